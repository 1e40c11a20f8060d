//! Broker client
//!
//! Speaks the newline-delimited JSON protocol: one exec (or ping) per
//! connection turn, streaming the child's output to our own stdout/stderr.
//! Records with an unknown type are skipped so newer brokers keep working.

use anyhow::{bail, Context, Result};
use broker_core::protocol::{self, Message};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    token: String,
}

impl Client {
    pub async fn connect(addr: &str, token: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            token: token.to_string(),
        })
    }

    pub async fn ping(&mut self) -> Result<String> {
        self.send(&Message::Ping).await?;
        match self.read_message().await? {
            Some(Message::Pong { version }) => Ok(version),
            Some(other) => bail!("unexpected response: {}", other.kind()),
            None => bail!("connection closed unexpectedly"),
        }
    }

    /// Run a tool and stream its output. Returns the child's exit code.
    pub async fn exec(&mut self, tool: &str, args: &[String]) -> Result<i32> {
        self.send_exec(tool, args).await?;
        loop {
            match self.read_message().await? {
                Some(message) => {
                    if let Some(code) = handle_record(message)? {
                        return Ok(code);
                    }
                }
                None => bail!("connection closed unexpectedly"),
            }
        }
    }

    /// Like [`Client::exec`], additionally forwarding our own stdin to the
    /// child line by line, with a single `stdin_close` at EOF.
    pub async fn exec_interactive(&mut self, tool: &str, args: &[String]) -> Result<i32> {
        self.send_exec(tool, args).await?;

        let (tx, mut rx) = mpsc::channel::<Message>(16);
        tokio::spawn(async move {
            let mut stdin = BufReader::new(tokio::io::stdin());
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.read_line(&mut line).await {
                    Ok(0) | Err(_) => {
                        let _ = tx.send(Message::StdinClose).await;
                        return;
                    }
                    Ok(_) => {
                        // The newline travels with the data; the child sees
                        // exactly what was typed.
                        let forwarded = Message::Stdin { data: line.clone() };
                        if tx.send(forwarded).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let mut stdin_done = false;
        let mut line = String::new();
        loop {
            tokio::select! {
                forwarded = rx.recv(), if !stdin_done => {
                    match forwarded {
                        Some(message) => {
                            if matches!(message, Message::StdinClose) {
                                stdin_done = true;
                            }
                            let encoded = message.to_line()?;
                            self.writer.write_all(encoded.as_bytes()).await?;
                        }
                        None => stdin_done = true,
                    }
                }
                read = self.reader.read_line(&mut line) => {
                    let read = match read {
                        Ok(read) => read,
                        Err(err) => {
                            self.abort_stdin(stdin_done).await;
                            return Err(err).context("reading from broker");
                        }
                    };
                    if read == 0 {
                        self.abort_stdin(stdin_done).await;
                        bail!("connection closed unexpectedly");
                    }
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        if let Ok(message) = protocol::decode(trimmed) {
                            if let Some(code) = handle_record(message)? {
                                return Ok(code);
                            }
                        }
                    }
                    line.clear();
                }
            }
        }
    }

    /// Best-effort `stdin_close` when the transport is going away, if one
    /// was not already sent.
    async fn abort_stdin(&mut self, already_closed: bool) {
        if already_closed {
            return;
        }
        if let Ok(encoded) = Message::StdinClose.to_line() {
            let _ = self.writer.write_all(encoded.as_bytes()).await;
        }
    }

    async fn send_exec(&mut self, tool: &str, args: &[String]) -> Result<()> {
        self.send(&Message::Exec {
            token: self.token.clone(),
            tool: tool.to_string(),
            args: args.to_vec(),
            env: BTreeMap::new(),
        })
        .await
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        let line = message.to_line().context("encoding request")?;
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("sending request")?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Option<Message>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .context("reading from broker")?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match protocol::decode(trimmed) {
                Ok(message) => return Ok(Some(message)),
                // Skip records this client does not know about.
                Err(_) => continue,
            }
        }
    }
}

/// Apply one streamed record; `Some(code)` terminates the exec.
fn handle_record(message: Message) -> Result<Option<i32>> {
    match message {
        Message::Started { .. } => Ok(None),
        Message::Stdout { data } => {
            println!("{data}");
            Ok(None)
        }
        Message::Stderr { data } => {
            eprintln!("{data}");
            Ok(None)
        }
        Message::Exit { code } => Ok(Some(code)),
        Message::Error { message } => bail!("broker error: {message}"),
        _ => Ok(None),
    }
}
