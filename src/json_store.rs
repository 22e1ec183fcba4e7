use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::store::TokenStore;
use crate::token::{DownloadToken, TokenPatch};

/// Tokens kept as one JSON array in a single file.
///
/// Every mutation reads the whole file, changes it in memory and writes it
/// back. The mutex only orders writers inside this process; two processes
/// sharing the file still race, and the last write wins.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        JsonFileStore {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All the entries currently in the file.
    pub fn all(&self) -> Result<Vec<DownloadToken>, StoreError> {
        let _guard = self.guard()?;
        self.read_entries()
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.lock.lock().map_err(|_| StoreError::Poisoned)
    }

    fn read_entries(&self) -> Result<Vec<DownloadToken>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_entries(&self, entries: &[DownloadToken]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl TokenStore for JsonFileStore {
    fn insert(&self, tok: &DownloadToken) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let mut entries = self.read_entries()?;
        if entries.iter().any(|e| e.token == tok.token) {
            return Err(StoreError::AlreadyExists(tok.token.clone()));
        }
        entries.push(tok.clone());
        self.write_entries(&entries)
    }

    fn find(&self, tok: &str) -> Result<Option<DownloadToken>, StoreError> {
        let _guard = self.guard()?;
        let entries = self.read_entries()?;
        Ok(entries.into_iter().find(|e| e.token == tok))
    }

    fn update(&self, tok: &str, patch: &TokenPatch) -> Result<DownloadToken, StoreError> {
        let _guard = self.guard()?;
        let mut entries = self.read_entries()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.token == tok)
            .ok_or_else(|| StoreError::NotFound(tok.to_string()))?;
        if patch.is_empty() {
            return Ok(entry.clone());
        }
        patch.apply_to(entry);
        let updated = entry.clone();
        self.write_entries(&entries)?;
        Ok(updated)
    }

    fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let _guard = self.guard()?;
        let mut entries = self.read_entries()?;
        let before = entries.len();
        entries.retain(|e| {
            let completed_long_ago = e.download_completed
                && e.completed_at.map(|at| at < cutoff).unwrap_or(false);
            e.expires_at >= cutoff && !completed_long_ago
        });
        let n = before - entries.len();
        if n > 0 {
            self.write_entries(&entries)?;
        }
        Ok(n)
    }
}
