//! credbrokerd - credential injection broker daemon
//!
//! Listens on TCP for newline-delimited JSON requests, authorizes each exec
//! against the configured policy, and runs allowlisted tools with secrets
//! injected into their environment. The caller never sees secret material;
//! it sees the child's output streamed back over the connection.

pub mod auth;
pub mod secrets_cmd;
pub mod server;
pub mod session;
pub mod tools_cmd;

pub use server::{Broker, BrokerState};
