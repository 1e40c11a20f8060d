//! Encrypted secret store
//!
//! A single file holding a password-encrypted name-to-value mapping. The
//! plaintext form is a YAML string map; the on-disk form is an age
//! passphrase container (scrypt-derived key). Mutations decrypt to memory,
//! apply the change, and re-encrypt in one operation - plaintext never
//! touches disk.

use age::secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Secret store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("credentials file not found: {0}")]
    NotFound(PathBuf),

    #[error("credentials file already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("decrypting credentials (wrong password?): {0}")]
    Decrypt(String),

    #[error("encrypting credentials: {0}")]
    Encrypt(String),

    #[error("parsing credentials: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("passwords don't match")]
    PasswordMismatch,

    #[error("reading password: {0}")]
    Password(String),

    #[error("secret '{0}' not found")]
    NoSuchSecret(String),

    #[error("writing credentials file: {0}")]
    Write(std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the store password comes from.
///
/// Resolution order for an existing store: the explicit keyfile, then
/// `<store>.keyfile` next to the ciphertext, then a file named `keyfile` in
/// the store's directory, then an interactive echo-off prompt.
#[derive(Debug, Clone, Default)]
pub struct PasswordSource {
    pub keyfile: Option<PathBuf>,
}

impl PasswordSource {
    pub fn new(keyfile: Option<PathBuf>) -> Self {
        Self { keyfile }
    }

    /// Resolve the password for an existing store.
    pub fn resolve(&self, store_path: &Path) -> Result<String, StoreError> {
        if let Some(keyfile) = &self.keyfile {
            return read_keyfile(keyfile);
        }

        let sidecar = sidecar_keyfile(store_path);
        if sidecar.is_file() {
            return read_keyfile(&sidecar);
        }

        let dir_keyfile = store_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("keyfile");
        if dir_keyfile.is_file() {
            return read_keyfile(&dir_keyfile);
        }

        prompt("Enter encryption password: ")
    }

    /// Resolve a password for a store that is being created. Interactive
    /// input is confirmed with a second prompt; keyfiles are taken as-is.
    pub fn resolve_new(&self, store_path: &Path) -> Result<String, StoreError> {
        if let Some(keyfile) = &self.keyfile {
            return read_keyfile(keyfile);
        }

        let sidecar = sidecar_keyfile(store_path);
        if sidecar.is_file() {
            return read_keyfile(&sidecar);
        }

        let password = prompt("Enter encryption password: ")?;
        let confirm = prompt("Confirm password: ")?;
        if password != confirm {
            return Err(StoreError::PasswordMismatch);
        }
        Ok(password)
    }
}

/// `<store>.keyfile` beside the ciphertext.
fn sidecar_keyfile(store_path: &Path) -> PathBuf {
    let mut name = store_path.as_os_str().to_owned();
    name.push(".keyfile");
    PathBuf::from(name)
}

/// Read a keyfile whole, trimming trailing whitespace (including the usual
/// final newline).
fn read_keyfile(path: &Path) -> Result<String, StoreError> {
    let content = fs::read_to_string(path)
        .map_err(|err| StoreError::Password(format!("reading keyfile {}: {err}", path.display())))?;
    Ok(content.trim_end().to_string())
}

fn prompt(message: &str) -> Result<String, StoreError> {
    rpassword::prompt_password(message).map_err(|err| StoreError::Password(err.to_string()))
}

/// The in-memory secret mapping.
///
/// Loaded once at daemon startup and read-only afterwards; the management
/// commands mutate it through [`SecretStore::mutate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretStore {
    secrets: BTreeMap<String, String>,
}

impl SecretStore {
    /// Create a new encrypted store holding the empty mapping.
    ///
    /// Refuses to replace an existing file unless `overwrite` is set; the
    /// interactive confirmation lives with the caller.
    pub fn init(
        path: &Path,
        source: &PasswordSource,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        if path.exists() && !overwrite {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        let password = source.resolve_new(path)?;
        SecretStore::default().save(path, &password)
    }

    /// Load and decrypt the store at `path`.
    pub fn load(path: &Path, source: &PasswordSource) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        let password = source.resolve(path)?;
        Self::load_with_password(path, &password)
    }

    /// Load with an already-resolved password.
    pub fn load_with_password(path: &Path, password: &str) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        let ciphertext = fs::read(path)?;
        let plaintext = decrypt(&ciphertext, password)?;
        let store = serde_yaml::from_slice(&plaintext)?;
        Ok(store)
    }

    /// Decrypt, apply `f` in memory, re-encrypt, write.
    ///
    /// When the file does not exist yet the mutation starts from the empty
    /// mapping under a freshly confirmed password, so `secrets add` can
    /// bootstrap a store. `f` is where interactive prompting for secret
    /// values happens; values must never be written to temporary files.
    pub fn mutate(
        path: &Path,
        source: &PasswordSource,
        f: impl FnOnce(&mut SecretStore) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let is_new = !path.exists();
        let password = if is_new {
            source.resolve_new(path)?
        } else {
            source.resolve(path)?
        };
        let mut store = if is_new {
            SecretStore::default()
        } else {
            Self::load_with_password(path, &password)?
        };
        f(&mut store)?;
        store.save(path, &password)
    }

    /// Serialize, encrypt under a fresh scrypt recipient, and write with
    /// owner-only permissions. Writes a temporary file in the target
    /// directory and renames it over the store, so a concurrent reader sees
    /// either the old or the new content.
    pub fn save(&self, path: &Path, password: &str) -> Result<(), StoreError> {
        let plaintext = serde_yaml::to_string(self)?;
        let ciphertext = encrypt(plaintext.as_bytes(), password)?;

        let tmp = {
            let mut name = path.as_os_str().to_owned();
            name.push(".tmp");
            PathBuf::from(name)
        };
        let mut file = File::create(&tmp).map_err(StoreError::Write)?;
        file.write_all(&ciphertext).map_err(StoreError::Write)?;
        file.set_permissions(Permissions::from_mode(0o600))
            .map_err(StoreError::Write)?;
        drop(file);
        fs::rename(&tmp, path).map_err(StoreError::Write)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.secrets.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }

    /// Secret names in stable order. Values are intentionally not exposed
    /// through iteration; callers look them up one at a time.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.secrets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>, StoreError> {
    let encryptor = age::Encryptor::with_user_passphrase(Secret::new(password.to_owned()));

    let mut ciphertext = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut ciphertext)
        .map_err(|err| StoreError::Encrypt(err.to_string()))?;
    writer
        .write_all(plaintext)
        .map_err(|err| StoreError::Encrypt(err.to_string()))?;
    writer
        .finish()
        .map_err(|err| StoreError::Encrypt(err.to_string()))?;

    Ok(ciphertext)
}

fn decrypt(ciphertext: &[u8], password: &str) -> Result<Vec<u8>, StoreError> {
    let decryptor = match age::Decryptor::new(ciphertext)
        .map_err(|err| StoreError::Decrypt(err.to_string()))?
    {
        age::Decryptor::Passphrase(d) => d,
        _ => {
            return Err(StoreError::Decrypt(
                "expected passphrase-encrypted file".to_string(),
            ))
        }
    };

    let mut plaintext = Vec::new();
    let mut reader = decryptor
        .decrypt(&Secret::new(password.to_owned()), None)
        .map_err(|err| StoreError::Decrypt(err.to_string()))?;
    reader
        .read_to_end(&mut plaintext)
        .map_err(|err| StoreError::Decrypt(err.to_string()))?;

    Ok(plaintext)
}
