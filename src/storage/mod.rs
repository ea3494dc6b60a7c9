//! Persistence contract and its implementations.
//!
//! The core only needs byte streams keyed by opaque string paths: the own
//! keypair, the DHT routing table snapshot and the undelivered messages all
//! go through [`Store`]. Nothing here depends on a particular storage
//! engine.

pub mod undelivered;

pub use undelivered::{StoredRecord, UndeliveredStore};

use crate::utils::{Result, StorageError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Path of the local keypair
pub const IDENTITY_PATH: &str = "identity.key";

/// Path of the DHT routing table snapshot
pub const DHT_TABLE_PATH: &str = "dht.nodes";

/// Path of the undelivered message records
pub const UNDELIVERED_PATH: &str = "undelivered.bin";

/// Byte-stream store keyed by opaque paths
pub trait Store: Send + Sync {
    /// Open `path` for reading, or `None` if nothing was ever written there
    fn try_open_read(&self, path: &str) -> Result<Option<Box<dyn Read + Send>>>;

    /// Open `path` for writing, replacing any previous content
    fn open_write(&self, path: &str) -> Result<Box<dyn Write + Send>>;
}

/// Read the whole content at `path`
pub fn read_all(store: &dyn Store, path: &str) -> Result<Option<Vec<u8>>> {
    let Some(mut reader) = store.try_open_read(path)? else {
        return Ok(None);
    };
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| access_error(path, &e))?;
    Ok(Some(bytes))
}

/// Replace the content at `path` with `bytes`
pub fn write_all(store: &dyn Store, path: &str, bytes: &[u8]) -> Result<()> {
    let mut writer = store.open_write(path)?;
    writer
        .write_all(bytes)
        .and_then(|()| writer.flush())
        .map_err(|e| access_error(path, &e))?;
    Ok(())
}

fn access_error(path: &str, err: &std::io::Error) -> crate::utils::MessengerError {
    StorageError::Access {
        path: path.to_string(),
        reason: err.to_string(),
    }
    .into()
}

/// Store backed by files under a root directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Store for FileStore {
    fn try_open_read(&self, path: &str) -> Result<Option<Box<dyn Read + Send>>> {
        match File::open(self.resolve(path)) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(access_error(path, &e)),
        }
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| access_error(path, &e))?;
        }
        let mut temp = target.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        let file = File::create(&temp).map_err(|e| access_error(path, &e))?;
        Ok(Box::new(AtomicFileWriter {
            file: Some(file),
            temp,
            target,
        }))
    }
}

/// Writes into `<target>.tmp` and renames it over `target` on flush or
/// drop, so the target always holds either the old or the new content
struct AtomicFileWriter {
    file: Option<File>,
    temp: PathBuf,
    target: PathBuf,
}

impl AtomicFileWriter {
    fn commit(&mut self) -> std::io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.temp, &self.target)
    }
}

impl Write for AtomicFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::new(ErrorKind::Other, "write after commit")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.commit()
    }
}

impl Drop for AtomicFileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            log::warn!("Could not commit {}: {}", self.target.display(), e);
        }
    }
}

/// Store kept entirely in memory; clones share the same content
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything has been written at `path`
    pub fn contains(&self, path: &str) -> bool {
        self.entries.lock().contains_key(path)
    }
}

impl Store for MemoryStore {
    fn try_open_read(&self, path: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let bytes = self.entries.lock().get(path).cloned();
        Ok(bytes.map(|b| Box::new(std::io::Cursor::new(b)) as Box<dyn Read + Send>))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        Ok(Box::new(MemoryWriter {
            path: path.to_string(),
            buffer: Vec::new(),
            entries: Arc::clone(&self.entries),
        }))
    }
}

/// Buffers writes and publishes them on flush and on drop
struct MemoryWriter {
    path: String,
    buffer: Vec<u8>,
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.entries
            .lock()
            .insert(self.path.clone(), self.buffer.clone());
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.entries.lock().insert(std::mem::take(&mut self.path), buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_missing_path() {
        let store = MemoryStore::new();
        assert!(read_all(&store, "nothing").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_overwrites() {
        let store = MemoryStore::new();
        write_all(&store, "a", b"first").unwrap();
        write_all(&store, "a", b"second").unwrap();
        assert_eq!(read_all(&store, "a").unwrap().unwrap(), b"second");
        assert!(store.contains("a"));
    }

    #[test]
    fn test_file_store_creates_directories() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("nested"));

        assert!(read_all(&store, IDENTITY_PATH).unwrap().is_none());
        write_all(&store, IDENTITY_PATH, &[7u8; 64]).unwrap();
        assert_eq!(read_all(&store, IDENTITY_PATH).unwrap().unwrap(), vec![7u8; 64]);
    }

    #[test]
    fn test_file_store_interrupted_write_keeps_old_content() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        write_all(&store, IDENTITY_PATH, b"old key").unwrap();

        let mut writer = store.open_write(IDENTITY_PATH).unwrap();
        writer.write_all(b"half a new").unwrap();
        // The process dies before the writer is flushed or dropped
        std::mem::forget(writer);

        assert_eq!(read_all(&store, IDENTITY_PATH).unwrap().unwrap(), b"old key");

        write_all(&store, IDENTITY_PATH, b"new key").unwrap();
        assert_eq!(read_all(&store, IDENTITY_PATH).unwrap().unwrap(), b"new key");
        assert!(!dir.path().join("identity.key.tmp").exists());
    }

    #[test]
    fn test_file_store_commits_on_drop() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        {
            let mut writer = store.open_write(DHT_TABLE_PATH).unwrap();
            writer.write_all(b"nodes").unwrap();
        }
        assert_eq!(read_all(&store, DHT_TABLE_PATH).unwrap().unwrap(), b"nodes");
    }
}
