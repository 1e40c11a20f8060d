//! Accept loop and shared daemon state
//!
//! Configuration, the decrypted secret store, and the audit sink are loaded
//! once at startup and shared read-only across sessions; only the audit
//! file handle is written to, under its own lock.

use anyhow::{Context, Result};
use broker_core::audit::AuditLog;
use broker_core::{Config, SecretStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::auth::Authorizer;
use crate::session::Session;

/// Immutable-after-startup state shared by every session.
pub struct BrokerState {
    pub config: Config,
    pub secrets: SecretStore,
    pub audit: AuditLog,
    pub authorizer: Authorizer,
    pub version: String,
}

pub struct Broker {
    state: Arc<BrokerState>,
    shutdown: watch::Sender<bool>,
}

impl Broker {
    pub fn new(config: Config, secrets: SecretStore, audit: AuditLog) -> Self {
        let authorizer = Authorizer::new(config.auth.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(BrokerState {
                config,
                secrets,
                audit,
                authorizer,
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            shutdown,
        }
    }

    /// Bind the configured listen endpoint.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listen = &self.state.config.server.listen;
        TcpListener::bind(listen)
            .await
            .with_context(|| format!("listening on {listen}"))
    }

    /// Accept connections until [`Broker::shutdown`] is called. Each
    /// connection gets its own task; accept errors are logged and the loop
    /// keeps going.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!("accept error: {err}");
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "accepted connection");
                    let state = self.state.clone();
                    let session_shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        let (read_half, write_half) = stream.into_split();
                        Session::new(
                            state,
                            peer.to_string(),
                            read_half,
                            write_half,
                            session_shutdown,
                        )
                        .run()
                        .await;
                    });
                }
                _ = shutdown.changed() => {
                    tracing::info!("listener closing");
                    return Ok(());
                }
            }
        }
    }

    /// Signal the accept loop and every live session to stop. Sessions with
    /// a running child kill it before exiting.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
