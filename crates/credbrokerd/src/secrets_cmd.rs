//! Secret store management commands
//!
//! `secrets {init,add,list,rm}` operate on the encrypted credentials file
//! through the in-memory mutation primitive: decrypt, change, re-encrypt.
//! Values are read with the terminal echo off and are never printed back.

use anyhow::{bail, Context, Result};
use broker_core::store::{PasswordSource, SecretStore, StoreError};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

pub fn init(file: &Path, keyfile: Option<PathBuf>) -> Result<()> {
    let overwrite = if file.exists() {
        if !confirm_overwrite(file)? {
            bail!("aborted");
        }
        true
    } else {
        false
    };

    let source = PasswordSource::new(keyfile);
    SecretStore::init(file, &source, overwrite)?;
    println!("success: Created encrypted credentials file: {}", file.display());
    Ok(())
}

pub fn add(file: &Path, key: &str, keyfile: Option<PathBuf>) -> Result<()> {
    let source = PasswordSource::new(keyfile);
    SecretStore::mutate(file, &source, |store| {
        let value = rpassword::prompt_password(format!("Enter value for '{key}': "))
            .map_err(|err| StoreError::Password(err.to_string()))?;
        store.set(key, value);
        Ok(())
    })
    .with_context(|| format!("updating {}", file.display()))?;

    println!("success: Secret '{key}' added to {}", file.display());
    Ok(())
}

pub fn list(file: &Path, keyfile: Option<PathBuf>) -> Result<()> {
    let source = PasswordSource::new(keyfile);
    let store = SecretStore::load(file, &source)?;

    println!("Secrets in {}:", file.display());
    if store.is_empty() {
        println!("  (none)");
    }
    for name in store.names() {
        println!("  - {name}");
    }
    Ok(())
}

pub fn rm(file: &Path, key: &str, keyfile: Option<PathBuf>) -> Result<()> {
    let source = PasswordSource::new(keyfile);
    SecretStore::mutate(file, &source, |store| {
        if store.remove(key).is_none() {
            return Err(StoreError::NoSuchSecret(key.to_string()));
        }
        Ok(())
    })
    .with_context(|| format!("updating {}", file.display()))?;

    println!("success: Secret '{key}' removed from {}", file.display());
    Ok(())
}

fn confirm_overwrite(file: &Path) -> Result<bool> {
    print!("{} exists. Overwrite? [y/N]: ", file.display());
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().lock().read_line(&mut response)?;
    Ok(response.trim().to_lowercase().starts_with('y'))
}
