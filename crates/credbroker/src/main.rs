//! credbroker - caller client for the credential broker
//!
//! Sends a single exec (or ping) to the broker and streams the child's
//! output back to the local terminal. Exits with the child's exit code;
//! broker-side failures exit 255.

mod client;
mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use client::Client;
use config::ClientConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "credbroker")]
#[command(version)]
#[command(about = "Run an allowlisted tool through the credential broker")]
struct Cli {
    /// Broker address (overrides config)
    #[arg(long)]
    server: Option<String>,

    /// Auth token (overrides config)
    #[arg(long)]
    token: Option<String>,

    /// Path to the client config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interactive mode (forward stdin to the tool)
    #[arg(short = 'i', long)]
    interactive: bool,

    /// Ping the broker and exit
    #[arg(long)]
    ping: bool,

    /// Tool name followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        // Abnormal termination (-1) and out-of-range codes collapse to 255,
        // distinct from any normal child exit.
        Ok(code) if (0..=254).contains(&code) => ExitCode::from(code as u8),
        Ok(_) => ExitCode::from(255),
        Err(err) => {
            eprintln!("credbroker: {err:#}");
            ExitCode::from(255)
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(token) = cli.token {
        config.token = token;
    }

    if config.server.is_empty() {
        bail!("broker address required (use --server or a config file)");
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        let mut client = Client::connect(&config.server, &config.token).await?;

        if cli.ping {
            let version = client.ping().await?;
            println!("Broker version: {version}");
            return Ok(0);
        }

        let (tool, args) = cli
            .command
            .split_first()
            .context("usage: credbroker [flags] TOOL [ARGS...]")?;
        if config.token.is_empty() {
            bail!("auth token required (use --token or a config file)");
        }

        if cli.interactive {
            client.exec_interactive(tool, args).await
        } else {
            client.exec(tool, args).await
        }
    });
    // A blocked stdin read must not hold up process exit after the child
    // is done.
    runtime.shutdown_background();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn trailing_args_go_to_the_tool() {
        let cli = Cli::parse_from(["credbroker", "--server", "h:1", "deploy", "--force", "-x"]);
        assert_eq!(cli.command, vec!["deploy", "--force", "-x"]);
        assert_eq!(cli.server.as_deref(), Some("h:1"));
    }

    #[test]
    fn interactive_flag_parses() {
        let cli = Cli::parse_from(["credbroker", "-i", "cat"]);
        assert!(cli.interactive);
        assert_eq!(cli.command, vec!["cat"]);
    }
}
