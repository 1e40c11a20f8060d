//! Broker policy configuration
//!
//! A YAML document with three sections: `server` (listen endpoint, audit
//! sink), `auth` (token/IP/node rules), and `tools` (the allowlist of
//! executables and their credential bindings). Unknown keys are tolerated so
//! newer documents keep working with older brokers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Read(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid args_pattern for tool {tool}: {source}")]
    Pattern {
        tool: String,
        source: regex::Error,
    },

    #[error("invalid listen address {0:?} (expected host:port)")]
    Listen(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub tools: BTreeMap<String, Tool>,
}

/// Server binding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen endpoint, e.g. "127.0.0.1:9876".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Audit log path. Absent means auditing is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<PathBuf>,
}

fn default_listen() -> String {
    "127.0.0.1:9876".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            audit: None,
        }
    }
}

/// Authentication rules. See the daemon's authorizer for how the three
/// checks combine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted bearer tokens.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Allowed peer addresses or CIDR ranges. Empty means all peers.
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Allowed Tailscale node IDs.
    #[serde(default)]
    pub tailscale_nodes: Vec<String>,

    /// If true, a valid token is always required.
    #[serde(default)]
    pub require_token: bool,
}

/// An allowlisted tool and how to invoke it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Absolute path to the executable.
    pub path: PathBuf,

    /// Credentials injected into the child environment, in order.
    #[serde(default)]
    pub credentials: Vec<Credential>,

    /// Allow arbitrary arguments.
    #[serde(default)]
    pub pass_args: bool,

    /// Pattern every argument must fully match. Without this and without
    /// `pass_args`, a request carrying arguments is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_pattern: Option<String>,

    #[serde(skip)]
    args_regex: Option<Regex>,
}

impl Tool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            credentials: Vec::new(),
            pass_args: false,
            args_pattern: None,
            args_regex: None,
        }
    }

    /// Set and compile the argument pattern. The compiled form is anchored
    /// so matching is full-match, not substring search.
    pub fn set_args_pattern(&mut self, pattern: &str) -> Result<(), regex::Error> {
        let compiled = Regex::new(&format!("^(?:{pattern})$"))?;
        self.args_pattern = Some(pattern.to_string());
        self.args_regex = Some(compiled);
        Ok(())
    }

    /// Check whether the given arguments are allowed for this tool.
    pub fn validate_args(&self, args: &[String]) -> Result<(), String> {
        if self.pass_args {
            return Ok(());
        }
        if let Some(regex) = &self.args_regex {
            for arg in args {
                if !regex.is_match(arg) {
                    return Err(format!("argument {arg:?} does not match allowed pattern"));
                }
            }
            return Ok(());
        }
        if args.is_empty() {
            Ok(())
        } else {
            Err("arguments are not permitted for this tool".to_string())
        }
    }
}

/// A credential binding. Only the `env` target is executed today; `header`
/// and `flag` parse for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,

    /// Key in the secret store.
    pub secret: String,
}

impl Config {
    /// Load and validate a configuration file. Argument patterns are
    /// compiled once, here; a bad pattern or listen address is fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.finalize()?;
        Ok(config)
    }

    /// Compile patterns and validate the endpoint. Split out so tests and
    /// the management commands can validate in-memory documents.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        if !is_host_port(&self.server.listen) {
            return Err(ConfigError::Listen(self.server.listen.clone()));
        }
        for (name, tool) in &mut self.tools {
            if let Some(pattern) = tool.args_pattern.clone() {
                tool.set_args_pattern(&pattern)
                    .map_err(|source| ConfigError::Pattern {
                        tool: name.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }
}

fn is_host_port(listen: &str) -> bool {
    match listen.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn load_str(yaml: &str) -> Result<Config, ConfigError> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, yaml).unwrap();
        Config::load(&path)
    }

    #[test]
    fn defaults_apply() {
        let config = load_str("tools: {}\n").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9876");
        assert!(config.server.audit.is_none());
        assert!(config.auth.tokens.is_empty());
        assert!(!config.auth.require_token);
    }

    #[test]
    fn full_document_parses() {
        let config = load_str(
            r#"
server:
  listen: "0.0.0.0:9876"
  audit: /var/log/credbroker/audit.log
auth:
  tokens: ["t1", "t2"]
  allowed_ips: ["127.0.0.1", "100.64.0.0/10"]
  tailscale_nodes: ["n123"]
  require_token: true
tools:
  deploy:
    path: /usr/local/bin/deploy
    pass_args: true
    credentials:
      - env: DEPLOY_TOKEN
        secret: deploy-token
"#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:9876");
        assert_eq!(config.auth.tokens.len(), 2);
        let tool = &config.tools["deploy"];
        assert!(tool.pass_args);
        assert_eq!(tool.credentials[0].env.as_deref(), Some("DEPLOY_TOKEN"));
        assert_eq!(tool.credentials[0].secret, "deploy-token");
    }

    #[test]
    fn args_pattern_is_full_match() {
        let mut tool = Tool::new("/bin/echo");
        tool.set_args_pattern("^[a-z]+$").unwrap();

        assert!(tool.validate_args(&["hello".to_string()]).is_ok());
        assert!(tool.validate_args(&["HELLO".to_string()]).is_err());
        assert!(tool.validate_args(&["hello world".to_string()]).is_err());
    }

    #[test]
    fn unanchored_pattern_still_matches_whole_argument() {
        let mut tool = Tool::new("/bin/echo");
        tool.set_args_pattern("[a-z]+").unwrap();

        assert!(tool.validate_args(&["hello".to_string()]).is_ok());
        assert!(tool.validate_args(&["hello world".to_string()]).is_err());
    }

    #[test]
    fn no_policy_denies_arguments() {
        let tool = Tool::new("/bin/echo");
        assert!(tool.validate_args(&[]).is_ok());
        assert!(tool.validate_args(&["hi".to_string()]).is_err());
    }

    #[test]
    fn pass_args_allows_anything() {
        let mut tool = Tool::new("/bin/echo");
        tool.pass_args = true;
        assert!(tool
            .validate_args(&["--force".to_string(), "; rm -rf".to_string()])
            .is_ok());
    }

    #[test]
    fn bad_pattern_fails_load() {
        let err = load_str(
            r#"
tools:
  broken:
    path: /bin/true
    args_pattern: "["
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Pattern { ref tool, .. } if tool == "broken"));
    }

    #[test]
    fn bad_listen_fails_load() {
        let err = load_str("server:\n  listen: \"no-port\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Listen(_)));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let config = load_str(
            r#"
future_section:
  anything: true
server:
  listen: "127.0.0.1:9876"
  shiny_new_option: 42
tools:
  echo:
    path: /bin/echo
    pass_args: true
    not_yet_invented: "ok"
"#,
        )
        .unwrap();
        assert!(config.tools.contains_key("echo"));
    }

    #[test]
    fn reserved_credential_targets_parse() {
        let config = load_str(
            r#"
tools:
  api:
    path: /usr/bin/api
    credentials:
      - header: Authorization
        secret: api-header
      - flag: --token
        secret: api-flag
"#,
        )
        .unwrap();
        let creds = &config.tools["api"].credentials;
        assert_eq!(creds[0].header.as_deref(), Some("Authorization"));
        assert!(creds[0].env.is_none());
        assert_eq!(creds[1].flag.as_deref(), Some("--token"));
    }
}
