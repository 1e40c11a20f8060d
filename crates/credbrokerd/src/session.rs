//! Per-connection session engine
//!
//! Each accepted connection runs one session: read a record, dispatch. Idle
//! connections accept `ping` and `exec`. An accepted exec turns the
//! connection into a multiplexed stream until the child exits: two pump
//! tasks re-frame child stdout/stderr as records, while the session task
//! keeps consuming caller records to feed the child's stdin. The terminal
//! `exit` record is only sent after both output pipes reach EOF and the
//! child is reaped.

use anyhow::{anyhow, Context, Result};
use broker_core::audit::{AuditRecord, AuditStatus};
use broker_core::protocol::{self, DecodeError, Message};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};

use crate::server::BrokerState;

pub struct Session {
    state: Arc<BrokerState>,
    peer: String,
    reader: BufReader<OwnedReadHalf>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    pub fn new(
        state: Arc<BrokerState>,
        peer: String,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            peer,
            reader: BufReader::new(read_half),
            writer: Arc::new(Mutex::new(write_half)),
            shutdown,
        }
    }

    /// Drive the session until the peer disconnects, a transport error
    /// occurs, or the daemon shuts down. Transport failures are not
    /// reported to the peer; there is nobody left to tell.
    pub async fn run(mut self) {
        match self.serve().await {
            Ok(()) => tracing::debug!(peer = %self.peer, "session closed"),
            Err(err) => tracing::debug!(peer = %self.peer, "session ended: {err:#}"),
        }
    }

    async fn serve(&mut self) -> Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                read = self.reader.read_line(&mut line) => read?,
                _ = self.shutdown.changed() => return Ok(()),
            };
            if read == 0 {
                return Ok(());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match protocol::decode(trimmed) {
                Ok(Message::Ping) => {
                    self.send(&Message::Pong {
                        version: self.state.version.clone(),
                    })
                    .await?;
                }
                Ok(Message::Exec {
                    token,
                    tool,
                    args,
                    env,
                }) => {
                    self.handle_exec(&token, &tool, args, env).await?;
                }
                Ok(other) => {
                    // Stream records are only meaningful inside an exec.
                    self.send_error(&format!("unexpected message type: {}", other.kind()))
                        .await?;
                }
                Err(DecodeError::Invalid) => {
                    self.send_error("invalid JSON").await?;
                }
                Err(DecodeError::UnknownType(kind)) => {
                    self.send_error(&format!("unknown message type: {kind}"))
                        .await?;
                }
            }
        }
    }

    async fn handle_exec(
        &mut self,
        token: &str,
        tool_name: &str,
        args: Vec<String>,
        extra_env: BTreeMap<String, String>,
    ) -> Result<()> {
        let started_at = Instant::now();

        if !self.state.authorizer.authorize(token, &self.peer).await {
            self.audit(tool_name, &args, -1, started_at, AuditStatus::AuthFailed);
            return self.send_error("authentication failed").await;
        }

        let Some(tool) = self.state.config.tools.get(tool_name) else {
            self.audit(tool_name, &args, -1, started_at, AuditStatus::UnknownTool);
            return self.send_error(&format!("unknown tool: {tool_name}")).await;
        };

        if let Err(reason) = tool.validate_args(&args) {
            self.audit(tool_name, &args, -1, started_at, AuditStatus::InvalidArgs);
            return self.send_error(&reason).await;
        }

        let mut command = Command::new(&tool.path);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for credential in &tool.credentials {
            // Only the environment target is executed; header/flag bindings
            // are reserved.
            let Some(env_name) = &credential.env else {
                continue;
            };
            match self.state.secrets.get(&credential.secret) {
                Some(value) => {
                    command.env(env_name, value);
                }
                None => {
                    self.audit(
                        tool_name,
                        &args,
                        -1,
                        started_at,
                        AuditStatus::CredentialMissing,
                    );
                    return self
                        .send_error(&format!("credential not found: {}", credential.secret))
                        .await;
                }
            }
        }

        // Request-supplied entries are appended after credential bindings,
        // matching the order the environment is constructed in.
        for (name, value) in &extra_env {
            command.env(name, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.audit(tool_name, &args, -1, started_at, AuditStatus::StartFailed);
                return self.send_error(&format!("start: {err}")).await;
            }
        };

        let pid = child.id().unwrap_or_default();
        tracing::info!(peer = %self.peer, tool = tool_name, pid, "started child");
        self.send(&Message::Started { pid }).await?;

        let stdout = child.stdout.take().context("child stdout pipe missing")?;
        let stderr = child.stderr.take().context("child stderr pipe missing")?;
        let mut stdin = child.stdin.take();

        let mut out_task = tokio::spawn(pump_lines(self.writer.clone(), stdout, |data| {
            Message::Stdout { data }
        }));
        let mut err_task = tokio::spawn(pump_lines(self.writer.clone(), stderr, |data| {
            Message::Stderr { data }
        }));

        let mut out_done = false;
        let mut err_done = false;
        // Once the caller closes stdin we stop consuming its records until
        // the exec finishes.
        let mut stdin_open = true;
        let mut line = String::new();
        let mut aborted = false;

        while !(out_done && err_done) {
            tokio::select! {
                joined = &mut out_task, if !out_done => {
                    out_done = true;
                    let _ = joined;
                }
                joined = &mut err_task, if !err_done => {
                    err_done = true;
                    let _ = joined;
                }
                read = self.reader.read_line(&mut line), if stdin_open => {
                    match read {
                        Ok(0) | Err(_) => {
                            aborted = true;
                            break;
                        }
                        Ok(_) => {
                            match protocol::decode(line.trim()) {
                                Ok(Message::Stdin { data }) => {
                                    if let Some(pipe) = stdin.as_mut() {
                                        if pipe.write_all(data.as_bytes()).await.is_err() {
                                            // Child closed its end; drop ours.
                                            stdin = None;
                                            stdin_open = false;
                                        }
                                    }
                                }
                                Ok(Message::StdinClose) => {
                                    stdin = None;
                                    stdin_open = false;
                                }
                                // Anything else mid-exec is ignored.
                                _ => {}
                            }
                            line.clear();
                        }
                    }
                }
                _ = self.shutdown.changed() => {
                    aborted = true;
                    break;
                }
            }
        }

        if aborted {
            // Transport lost or daemon stopping: kill and reap the child,
            // discard its remaining output, send nothing.
            out_task.abort();
            err_task.abort();
            let _ = child.kill().await;
            return Err(anyhow!("exec aborted before child exit"));
        }

        // Both output pipes hit EOF. Close our end of stdin (EOF to the
        // child if the caller never did) and reap.
        drop(stdin);
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                tracing::warn!(peer = %self.peer, tool = tool_name, "wait failed: {err}");
                -1
            }
        };

        self.audit(tool_name, &args, code, started_at, AuditStatus::Ok);
        self.send(&Message::Exit { code }).await?;
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        send_message(&self.writer, message)
            .await
            .context("writing to peer")
    }

    async fn send_error(&self, message: &str) -> Result<()> {
        self.send(&Message::Error {
            message: message.to_string(),
        })
        .await
    }

    fn audit(
        &self,
        tool: &str,
        args: &[String],
        exit_code: i32,
        started_at: Instant,
        status: AuditStatus,
    ) {
        let record = AuditRecord::new(
            self.peer.clone(),
            tool,
            args.to_vec(),
            exit_code,
            started_at.elapsed(),
            status,
        );
        if let Err(err) = self.state.audit.record(&record) {
            tracing::warn!("failed to write audit record: {err}");
        }
    }
}

async fn send_message(writer: &Mutex<OwnedWriteHalf>, message: &Message) -> std::io::Result<()> {
    let line = message
        .to_line()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await
}

/// Re-frame one child output pipe as wire records, one per line, in pipe
/// read order. Ends at pipe EOF or when the peer is gone.
async fn pump_lines<R>(
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pipe: R,
    make: fn(String) -> Message,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if send_message(&writer, &make(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}
