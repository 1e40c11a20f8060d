//! credbrokerd - the credential broker daemon
//!
//! Run without a subcommand to start the broker. The `secrets` and `tools`
//! subcommands manage the encrypted store and the tool allowlist
//! out-of-band.

use anyhow::{Context, Result};
use broker_core::audit::AuditLog;
use broker_core::store::{PasswordSource, SecretStore};
use broker_core::Config;
use clap::{Parser, Subcommand};
use credbrokerd::{secrets_cmd, tools_cmd, Broker};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "credbrokerd")]
#[command(version)]
#[command(about = "Credential injection broker daemon")]
#[command(long_about = "Credential injection broker daemon.\n\n\
    Holds an encrypted secret store in memory and runs allowlisted tools on\n\
    behalf of low-trust callers, injecting secrets into the child process\n\
    environment. Callers stream the child's output back over TCP and never\n\
    observe secret material.")]
struct Cli {
    /// Path to the broker configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the encrypted credentials file
    #[arg(long, default_value = "credentials.enc")]
    credentials: PathBuf,

    /// Read the store password from this keyfile instead of prompting
    #[arg(long)]
    keyfile: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the encrypted secret store
    Secrets {
        #[command(subcommand)]
        command: SecretsCommand,
    },

    /// Manage the tool allowlist in a configuration file
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
}

#[derive(Subcommand)]
enum SecretsCommand {
    /// Create a new encrypted credentials file
    Init {
        file: PathBuf,
        /// Use the password from this keyfile instead of prompting
        #[arg(long)]
        keyfile: Option<PathBuf>,
    },

    /// Add or update a secret (value prompted with echo off)
    Add {
        file: PathBuf,
        key: String,
        #[arg(long)]
        keyfile: Option<PathBuf>,
    },

    /// List secret names (never values)
    List {
        file: PathBuf,
        #[arg(long)]
        keyfile: Option<PathBuf>,
    },

    /// Remove a secret
    Rm {
        file: PathBuf,
        key: String,
        #[arg(long)]
        keyfile: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ToolsCommand {
    /// Add a tool entry to a configuration file
    Add {
        config: PathBuf,
        name: String,
        path: PathBuf,
        /// Environment variable to bind a credential to (repeatable)
        #[arg(long = "env")]
        env: Vec<String>,
    },

    /// List configured tools
    List { config: PathBuf },

    /// Remove a tool entry from a configuration file
    Rm { config: PathBuf, name: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Secrets { command }) => match command {
            SecretsCommand::Init { file, keyfile } => secrets_cmd::init(&file, keyfile),
            SecretsCommand::Add { file, key, keyfile } => {
                secrets_cmd::add(&file, &key, keyfile)
            }
            SecretsCommand::List { file, keyfile } => secrets_cmd::list(&file, keyfile),
            SecretsCommand::Rm { file, key, keyfile } => {
                secrets_cmd::rm(&file, &key, keyfile)
            }
        },
        Some(Commands::Tools { command }) => match command {
            ToolsCommand::Add {
                config,
                name,
                path,
                env,
            } => tools_cmd::add(&config, &name, &path, &env),
            ToolsCommand::List { config } => tools_cmd::list(&config),
            ToolsCommand::Rm { config, name } => tools_cmd::rm(&config, &name),
        },
        None => run_server(cli),
    }
}

fn run_server(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    // Password acquisition may prompt; do it before entering the runtime.
    let source = PasswordSource::new(cli.keyfile);
    let secrets = SecretStore::load(&cli.credentials, &source)
        .with_context(|| format!("loading credentials {}", cli.credentials.display()))?;

    let audit = AuditLog::open(config.server.audit.as_deref()).context("opening audit log")?;

    tracing::info!(
        "loaded {} tools, {} credentials",
        config.tools.len(),
        secrets.len()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let broker = Broker::new(config, secrets, audit);
        let listener = broker.bind().await?;

        tracing::info!(
            "credbrokerd listening on {}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );

        tokio::select! {
            result = broker.serve(listener) => result,
            _ = shutdown_signal() => {
                tracing::info!("shutting down");
                broker.shutdown();
                // Grace period: sessions kill their children and drain.
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(())
            }
        }
    })
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            tracing::warn!("failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
