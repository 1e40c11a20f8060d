//! Wire protocol
//!
//! One JSON record per line over a bidirectional byte stream. Every record
//! carries a `type` discriminant; decoding tolerates unknown fields, and an
//! unknown `type` is reported separately from malformed JSON so sessions can
//! ignore one and complain about the other.
//!
//! Output is line-framed: child output is re-framed as one record per
//! logical line, which alters binary output or output without a trailing
//! newline. Byte-exact passthrough would need a counted chunk record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Every record that can appear on the wire, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Caller asks the broker to run a tool.
    Exec {
        #[serde(default)]
        token: String,
        tool: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },

    /// Caller forwards bytes for the child's standard input.
    Stdin { data: String },

    /// Caller signals EOF for the child's standard input.
    StdinClose,

    /// Health check.
    Ping,

    /// The child process was spawned.
    Started { pid: u32 },

    /// One line of child standard output (no trailing newline).
    Stdout { data: String },

    /// One line of child standard error.
    Stderr { data: String },

    /// The child exited; -1 stands in for abnormal termination.
    Exit { code: i32 },

    /// The request failed before or instead of an exit.
    Error { message: String },

    /// Health check reply.
    Pong { version: String },
}

const KNOWN_TYPES: &[&str] = &[
    "exec",
    "stdin",
    "stdin_close",
    "ping",
    "started",
    "stdout",
    "stderr",
    "exit",
    "error",
    "pong",
];

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Exec { .. } => "exec",
            Message::Stdin { .. } => "stdin",
            Message::StdinClose => "stdin_close",
            Message::Ping => "ping",
            Message::Started { .. } => "started",
            Message::Stdout { .. } => "stdout",
            Message::Stderr { .. } => "stderr",
            Message::Exit { .. } => "exit",
            Message::Error { .. } => "error",
            Message::Pong { .. } => "pong",
        }
    }

    /// Encode as a single newline-terminated line. JSON escaping guarantees
    /// no literal newline appears inside the record.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid JSON")]
    Invalid,

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Decode one line. Unknown fields are ignored; a record whose `type` is not
/// in the protocol yields [`DecodeError::UnknownType`].
pub fn decode(line: &str) -> Result<Message, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|_| DecodeError::Invalid)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_owned);

    match serde_json::from_value(value) {
        Ok(message) => Ok(message),
        Err(_) => match kind {
            Some(kind) if !KNOWN_TYPES.contains(&kind.as_str()) => {
                Err(DecodeError::UnknownType(kind))
            }
            _ => Err(DecodeError::Invalid),
        },
    }
}
