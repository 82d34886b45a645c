// ── Per-tunnel key files ──
//
// `<id>.key` holds the base64 private key and `<id>.pub` its public half,
// both 0600.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use tracing::warn;
use wireguard_control::Key;

use crate::error::CoreError;
use crate::manifest::write_atomic;

/// A freshly generated keypair, both halves base64.
#[derive(Debug)]
pub struct Keypair {
    pub private_key: SecretString,
    pub public_key: String,
}

pub fn generate_keypair() -> Keypair {
    let private = Key::generate_private();
    Keypair {
        public_key: private.get_public().to_base64(),
        private_key: SecretString::from(private.to_base64()),
    }
}

pub fn parse_private_key(raw: &str) -> Result<Key, CoreError> {
    Key::from_base64(raw.trim())
        .map_err(|_| CoreError::validation("private key is not a valid WireGuard key"))
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn private_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.key"))
    }

    fn public_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.pub"))
    }

    /// Generate and persist a new keypair for `id`.
    pub fn generate(&self, id: &str) -> Result<Key, CoreError> {
        self.store(id, Key::generate_private())
    }

    /// Persist a caller-supplied private key for `id`.
    pub fn import(&self, id: &str, raw_private: &str) -> Result<Key, CoreError> {
        self.store(id, parse_private_key(raw_private)?)
    }

    fn store(&self, id: &str, private: Key) -> Result<Key, CoreError> {
        write_atomic(&self.private_path(id), private.to_base64().as_bytes())?;
        let public = private.get_public().to_base64();
        if let Err(e) = write_atomic(&self.public_path(id), public.as_bytes()) {
            if let Err(cleanup) = self.delete(id) {
                warn!(id, error = %cleanup, "key cleanup failed");
            }
            return Err(e);
        }
        Ok(private)
    }

    pub fn private_key(&self, id: &str) -> Result<Key, CoreError> {
        let path = self.private_path(id);
        let raw = std::fs::read_to_string(&path).map_err(|e| CoreError::io(&path, e))?;
        parse_private_key(&raw)
    }

    pub fn public_key(&self, id: &str) -> Result<String, CoreError> {
        let path = self.public_path(id);
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_owned())
            .map_err(|e| CoreError::io(&path, e))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.private_path(id).exists()
    }

    /// Remove both files. Already-missing files count as removed; any other
    /// failure is returned after both removals have been attempted.
    pub fn delete(&self, id: &str) -> Result<(), CoreError> {
        let mut first_err = None;
        for path in [self.private_path(id), self.public_path(id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    first_err.get_or_insert(CoreError::io(path, e));
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
