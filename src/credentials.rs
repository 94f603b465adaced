//! Credential persistence.
//!
//! The host application owns durable storage. This module defines the
//! key-value seam the client reads and writes through, plus two stores: an
//! in-memory one and a JSON file on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Store key for the short-lived access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Store key for the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Store key for the preferred UI/API locale.
pub const LANGUAGE_KEY: &str = "language";

/// Access/refresh credential pair issued by `POST /auth/login`.
#[derive(Clone)]
pub struct TokenPair {
    pub access: SecretString,
    pub refresh: SecretString,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: SecretString::new(access.into()),
            refresh: SecretString::new(refresh.into()),
        }
    }
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"[REDACTED]")
            .field("refresh", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("credential file i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential file is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("credential store lock poisoned")]
    Poisoned,
}

/// Durable key-value persistence for tokens and locale preference.
///
/// Implementations must be cheap to call; the pipeline reads the access token
/// on every request.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), CredentialStoreError>;
    fn remove(&self, key: &str) -> Result<(), CredentialStoreError>;
}

/// Process-local store. Everything is lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CredentialStoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CredentialStoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CredentialStoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CredentialStoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten in full on every mutation.
///
/// The file is created with `0o600` permissions on unix. A missing or
/// unreadable file behaves as an empty store.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, String>>,
}

impl FileCredentialStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = load_entries(&path);
        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), CredentialStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }

        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CredentialStoreError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| CredentialStoreError::Poisoned)?;
        cache.insert(key.to_string(), value.to_string());
        self.persist(&cache)
    }

    fn remove(&self, key: &str) -> Result<(), CredentialStoreError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| CredentialStoreError::Poisoned)?;
        if cache.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&cache)
    }
}

fn load_entries(path: &Path) -> BTreeMap<String, String> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(err) => {
            tracing::warn!(event = "credential_file_unreadable", error = %err);
            return BTreeMap::new();
        }
    };

    serde_json::from_str(&data).unwrap_or_else(|err| {
        tracing::warn!(event = "credential_file_invalid", error = %err);
        BTreeMap::new()
    })
}

/// Reads the stored token pair, if both halves are present.
pub fn load_token_pair(store: &dyn CredentialStore) -> Option<TokenPair> {
    let access = store.get(ACCESS_TOKEN_KEY)?;
    let refresh = store.get(REFRESH_TOKEN_KEY)?;
    Some(TokenPair::new(access, refresh))
}

pub(crate) fn save_token_pair(
    store: &dyn CredentialStore,
    tokens: &TokenPair,
) -> Result<(), CredentialStoreError> {
    store.set(ACCESS_TOKEN_KEY, tokens.access.expose_secret())?;
    store.set(REFRESH_TOKEN_KEY, tokens.refresh.expose_secret())
}
