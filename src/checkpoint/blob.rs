//! Key-value blob backends for checkpoints
//!
//! The checkpoint layer only needs `save / load / delete / list`. Two
//! backends ship with the crate: a directory of JSON files and an in-memory
//! map for tests and short-lived runs.
//!
//! ## Concurrency Safety
//! The file backend takes an advisory `fs2` lock per key and writes through
//! a temp file + rename, so a reader never sees a half-written blob.

use dashmap::DashMap;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;

use crate::error::CheckpointError;

const BLOB_SUFFIX: &str = ".ckpt.json";
const LOCK_SUFFIX: &str = ".ckpt.lock";
const TEMP_SUFFIX: &str = ".ckpt.tmp";

/// Storage interface the checkpoint store is written against
pub trait BlobStore: Send + Sync {
    /// Overwrite the blob stored under `key`
    fn save(&self, key: &str, blob: &[u8]) -> Result<(), CheckpointError>;

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CheckpointError>;

    /// Remove `key`; deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<(), CheckpointError>;

    /// All keys currently stored
    fn list(&self) -> Result<Vec<String>, CheckpointError>;
}

/// Blob store backed by a directory of files
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    /// Store under the platform data dir (`<data_local>/docpipe/checkpoints`)
    pub fn new() -> Self {
        Self {
            dir: Self::default_dir(),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docpipe")
            .join("checkpoints")
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn ensure_dir(&self, key: &str) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error(key, e))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, BLOB_SUFFIX))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, LOCK_SUFFIX))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, TEMP_SUFFIX))
    }

    /// Keys become file names, so path separators are rejected
    fn check_key(key: &str) -> Result<(), CheckpointError> {
        if key.is_empty() || key.contains(|c: char| c == '/' || c == '\\') || key.starts_with('.') {
            return Err(io_error(
                key,
                io::Error::new(io::ErrorKind::InvalidInput, "invalid checkpoint key"),
            ));
        }
        Ok(())
    }

    /// Acquire an exclusive lock for `key`.
    /// The returned handle must stay alive while the lock is needed.
    fn acquire_lock(&self, key: &str) -> Result<File, CheckpointError> {
        self.ensure_dir(key)?;

        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path(key))
            .map_err(|e| io_error(key, e))?;

        lock_file
            .lock_exclusive()
            .map_err(|e| CheckpointError::Lock {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(lock_file)
    }

    /// Remove lock and temp files left behind by crashed processes
    pub fn cleanup_stale_locks(&self) -> Result<usize, CheckpointError> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| io_error("*", e))?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if (name.ends_with(LOCK_SUFFIX) || name.ends_with(TEMP_SUFFIX))
                && fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(dir = %self.dir.display(), removed, "Removed stale checkpoint locks");
        }
        Ok(removed)
    }
}

impl Default for FileBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for FileBlobStore {
    fn save(&self, key: &str, blob: &[u8]) -> Result<(), CheckpointError> {
        Self::check_key(key)?;
        let _lock = self.acquire_lock(key)?;

        let temp_path = self.temp_path(key);
        fs::write(&temp_path, blob).map_err(|e| io_error(key, e))?;
        fs::rename(&temp_path, self.blob_path(key)).map_err(|e| io_error(key, e))?;

        tracing::debug!(key, bytes = blob.len(), "Saved checkpoint blob");
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CheckpointError> {
        Self::check_key(key)?;
        let path = self.blob_path(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path).map(Some).map_err(|e| io_error(key, e))
    }

    fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        Self::check_key(key)?;
        let path = self.blob_path(key);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| io_error(key, e))?;
            tracing::debug!(key, "Deleted checkpoint blob");
        }

        let lock_path = self.lock_path(key);
        if lock_path.exists() {
            let _ = fs::remove_file(&lock_path);
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| io_error("*", e))?;
        let mut keys: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(BLOB_SUFFIX).map(str::to_string)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// In-memory blob store
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn save(&self, key: &str, blob: &[u8]) -> Result<(), CheckpointError> {
        self.blobs.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CheckpointError> {
        Ok(self.blobs.get(key).map(|b| b.value().clone()))
    }

    fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        self.blobs.remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut keys: Vec<String> = self.blobs.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

fn io_error(key: &str, source: io::Error) -> CheckpointError {
    CheckpointError::Io {
        key: key.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_store() -> (FileBlobStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::with_dir(dir.path().join("ckpt"));
        (store, dir)
    }

    #[test]
    fn test_file_save_load_overwrite() {
        let (store, _dir) = create_test_store();

        assert!(store.load("run-1.text").unwrap().is_none());

        store.save("run-1.text", b"first").unwrap();
        store.save("run-1.text", b"second").unwrap();

        assert_eq!(store.load("run-1.text").unwrap().unwrap(), b"second");
        assert!(!store.temp_path("run-1.text").exists());
    }

    #[test]
    fn test_file_list_ignores_locks() {
        let (store, _dir) = create_test_store();
        store.save("run-2.visual", b"{}").unwrap();
        store.save("run-1.text", b"{}").unwrap();

        assert!(store.lock_path("run-1.text").exists());
        assert_eq!(store.list().unwrap(), vec!["run-1.text", "run-2.visual"]);
    }

    #[test]
    fn test_file_delete_removes_blob_and_lock() {
        let (store, _dir) = create_test_store();
        store.save("run-1.text", b"{}").unwrap();
        store.delete("run-1.text").unwrap();
        store.delete("run-1.text").unwrap();

        assert!(store.load("run-1.text").unwrap().is_none());
        assert!(!store.lock_path("run-1.text").exists());
    }

    #[test]
    fn test_cleanup_stale_locks() {
        let (store, _dir) = create_test_store();
        store.save("run-1.text", b"{}").unwrap();
        fs::write(store.temp_path("run-9.text"), b"partial").unwrap();

        assert_eq!(store.cleanup_stale_locks().unwrap(), 2);
        assert_eq!(store.list().unwrap(), vec!["run-1.text"]);
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let (store, _dir) = create_test_store();
        assert!(store.save("../escape", b"x").is_err());
        assert!(store.save("", b"x").is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryBlobStore::new();
        store.save("b", b"2").unwrap();
        store.save("a", b"1").unwrap();
        assert_eq!(store.list().unwrap(), vec!["a", "b"]);

        store.delete("a").unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.load("a").unwrap().is_none());
    }
}
