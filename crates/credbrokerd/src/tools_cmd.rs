//! Tool allowlist management commands
//!
//! `tools {add,list,rm}` edit the broker configuration file. Edits go
//! through `serde_yaml::Value` rather than the typed model so unknown
//! fields on sibling entries survive a round-trip.

use anyhow::{bail, Context, Result};
use broker_core::Config;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;

pub fn add(config_path: &Path, name: &str, tool_path: &Path, env_vars: &[String]) -> Result<()> {
    let tool_path = fs::canonicalize(tool_path)
        .with_context(|| format!("resolving {}", tool_path.display()))?;
    let metadata = fs::metadata(&tool_path).context("source not found")?;
    if metadata.is_dir() {
        bail!("source is a directory, expected executable");
    }

    let mut document = read_document(config_path)?;
    let root = document
        .as_mapping_mut()
        .context("config is not a mapping")?;
    if !root.contains_key(Value::from("tools")) {
        root.insert(Value::from("tools"), Value::Mapping(Mapping::new()));
    }
    let tools = root
        .get_mut(Value::from("tools"))
        .and_then(Value::as_mapping_mut)
        .context("tools section is not a mapping")?;

    let mut entry = Mapping::new();
    entry.insert(
        Value::from("path"),
        Value::from(tool_path.display().to_string()),
    );
    entry.insert(Value::from("pass_args"), Value::from(true));
    let credentials: Vec<Value> = env_vars
        .iter()
        .map(|env| {
            let mut credential = Mapping::new();
            credential.insert(Value::from("env"), Value::from(env.as_str()));
            credential.insert(
                Value::from("secret"),
                Value::from(env_to_secret_name(env)),
            );
            Value::Mapping(credential)
        })
        .collect();
    entry.insert(Value::from("credentials"), Value::Sequence(credentials));

    tools.insert(Value::from(name), Value::Mapping(entry));
    write_document(config_path, &document)?;

    println!("success: Tool '{name}' added to {}", config_path.display());
    if !env_vars.is_empty() {
        println!("Next steps:");
        for env in env_vars {
            println!(
                "  credbrokerd secrets add <credentials-file> {}",
                env_to_secret_name(env)
            );
        }
        println!("  then restart the broker to pick up the change");
    }
    Ok(())
}

pub fn list(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    println!("Tools in {}:", config_path.display());
    println!();
    for (name, tool) in &config.tools {
        println!("  {name}");
        println!("    path: {}", tool.path.display());
        if !tool.credentials.is_empty() {
            println!("    credentials:");
            for credential in &tool.credentials {
                if let Some(env) = &credential.env {
                    println!("      - {env} (secret: {})", credential.secret);
                }
            }
        }
        println!();
    }
    Ok(())
}

pub fn rm(config_path: &Path, name: &str) -> Result<()> {
    let mut document = read_document(config_path)?;
    let tools = document
        .as_mapping_mut()
        .and_then(|root| root.get_mut(Value::from("tools")))
        .and_then(Value::as_mapping_mut)
        .context("no tools section in config")?;

    if tools.remove(Value::from(name)).is_none() {
        bail!("tool '{name}' not found in config");
    }
    write_document(config_path, &document)?;

    println!("success: Tool '{name}' removed from {}", config_path.display());
    println!("  Restart the broker to apply the change.");
    Ok(())
}

fn read_document(path: &Path) -> Result<Value> {
    let data =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn write_document(path: &Path, document: &Value) -> Result<()> {
    let data = serde_yaml::to_string(document)?;
    fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}

/// ENV_VAR_NAME -> env-var-name, the conventional secret name for a
/// credential added by env var.
pub fn env_to_secret_name(env: &str) -> String {
    env.to_lowercase().replace('_', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SEED: &str = r#"
server:
  listen: "127.0.0.1:9876"
experimental_flag: true
tools:
  existing:
    path: /bin/true
    pass_args: false
    vendor_extension:
      keep: me
"#;

    #[test]
    fn env_name_mapping() {
        assert_eq!(env_to_secret_name("GOG_KEYRING_PASSWORD"), "gog-keyring-password");
        assert_eq!(env_to_secret_name("TOKEN"), "token");
    }

    #[test]
    fn add_preserves_unknown_sibling_fields() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, SEED).unwrap();

        // Use a real file as the tool path; canonicalize must succeed.
        let tool_path = dir.path().join("mytool");
        fs::write(&tool_path, "#!/bin/sh\n").unwrap();

        add(
            &config_path,
            "mytool",
            &tool_path,
            &["MY_TOKEN".to_string()],
        )
        .unwrap();

        let document: Value =
            serde_yaml::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();

        // Unknown top-level and per-tool fields survive the edit.
        assert_eq!(document["experimental_flag"], Value::from(true));
        assert_eq!(
            document["tools"]["existing"]["vendor_extension"]["keep"],
            Value::from("me")
        );

        let entry = &document["tools"]["mytool"];
        assert_eq!(entry["pass_args"], Value::from(true));
        assert_eq!(entry["credentials"][0]["env"], Value::from("MY_TOKEN"));
        assert_eq!(entry["credentials"][0]["secret"], Value::from("my-token"));
    }

    #[test]
    fn rm_removes_only_the_named_tool() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, SEED).unwrap();

        rm(&config_path, "existing").unwrap();

        let document: Value =
            serde_yaml::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
        assert!(document["tools"]
            .as_mapping()
            .unwrap()
            .is_empty());
        assert_eq!(document["experimental_flag"], Value::from(true));
    }

    #[test]
    fn rm_unknown_tool_fails() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, SEED).unwrap();

        let err = rm(&config_path, "nope").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn add_rejects_missing_source() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, SEED).unwrap();

        let missing = dir.path().join("no-such-binary");
        assert!(add(&config_path, "ghost", &missing, &[]).is_err());
    }
}
