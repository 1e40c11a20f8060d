//! Audit logging
//!
//! One JSON record per completed exec dispatch, appended to a single file.
//! Writes are serialized under a mutex so records never interleave.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of an exec dispatch. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    AuthFailed,
    UnknownTool,
    InvalidArgs,
    StartFailed,
    CredentialMissing,
}

/// A single audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the dispatch completed (UTC, RFC 3339).
    pub ts: DateTime<Utc>,

    /// Remote peer address.
    pub client: String,

    /// Requested tool name.
    pub tool: String,

    /// Requested argument vector.
    pub args: Vec<String>,

    /// Child exit code, or -1 when no child ran or it died abnormally.
    pub exit_code: i32,

    /// Wall time from request receipt to dispatch completion.
    pub duration_ms: i64,

    pub status: AuditStatus,
}

impl AuditRecord {
    pub fn new(
        client: impl Into<String>,
        tool: impl Into<String>,
        args: Vec<String>,
        exit_code: i32,
        duration: Duration,
        status: AuditStatus,
    ) -> Self {
        Self {
            ts: Utc::now(),
            client: client.into(),
            tool: tool.into(),
            args,
            exit_code,
            duration_ms: duration.as_millis() as i64,
            status,
        }
    }
}

/// Append-only audit sink. Opened once at daemon startup; a `None` path
/// means auditing is disabled and records are dropped.
pub struct AuditLog {
    sink: Option<Mutex<File>>,
}

impl AuditLog {
    pub fn open(path: Option<&Path>) -> std::io::Result<Self> {
        let sink = match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .mode(0o600)
                    .open(path)?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self { sink })
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn record(&self, record: &AuditRecord) -> std::io::Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let line = serde_json::to_string(record)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        let mut file = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(file, "{line}")?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sample(status: AuditStatus, exit_code: i32) -> AuditRecord {
        AuditRecord::new(
            "127.0.0.1:50000",
            "echo",
            vec!["hi".to_string()],
            exit_code,
            Duration::from_millis(12),
            status,
        )
    }

    #[test]
    fn records_are_one_json_line_each() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::open(Some(&path)).unwrap();

        log.record(&sample(AuditStatus::Ok, 0)).unwrap();
        log.record(&sample(AuditStatus::UnknownTool, -1)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.status, AuditStatus::Ok);
        assert_eq!(first.exit_code, 0);
        assert_eq!(first.tool, "echo");

        let second: AuditRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.status, AuditStatus::UnknownTool);
        assert_eq!(second.exit_code, -1);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&AuditStatus::CredentialMissing).unwrap();
        assert_eq!(json, r#""credential_missing""#);
        let json = serde_json::to_string(&AuditStatus::AuthFailed).unwrap();
        assert_eq!(json, r#""auth_failed""#);
    }

    #[test]
    fn appends_across_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");

        AuditLog::open(Some(&path))
            .unwrap()
            .record(&sample(AuditStatus::Ok, 0))
            .unwrap();
        AuditLog::open(Some(&path))
            .unwrap()
            .record(&sample(AuditStatus::InvalidArgs, -1))
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn disabled_sink_drops_records() {
        let log = AuditLog::disabled();
        assert!(!log.is_enabled());
        log.record(&sample(AuditStatus::Ok, 0)).unwrap();
    }
}
