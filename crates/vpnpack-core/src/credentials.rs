// ── API key file ──
//
// The Integration API key lives in a single 0600 file. An empty or
// whitespace-only file counts as no key.

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};

use crate::error::CoreError;
use crate::manifest::write_atomic;

#[derive(Debug, Clone)]
pub struct ApiKeyFile {
    path: PathBuf,
}

impl ApiKeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<SecretString>, CoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let key = raw.trim();
                Ok((!key.is_empty()).then(|| SecretString::from(key.to_owned())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::io(&self.path, e)),
        }
    }

    pub fn save(&self, key: &SecretString) -> Result<(), CoreError> {
        write_atomic(&self.path, key.expose_secret().trim().as_bytes())
    }

    /// Remove the key file; absent is fine.
    pub fn delete(&self) -> Result<(), CoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::io(&self.path, e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let file = ApiKeyFile::new(dir.path().join("config/api-key"));
        assert!(file.load().unwrap().is_none());

        file.save(&SecretString::from(" key-123\n".to_owned())).unwrap();
        assert_eq!(file.load().unwrap().unwrap().expose_secret(), "key-123");

        file.delete().unwrap();
        file.delete().unwrap();
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn blank_file_is_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api-key");
        std::fs::write(&path, "  \n").unwrap();
        assert!(ApiKeyFile::new(path).load().unwrap().is_none());
    }
}
