//! In-memory storage implementation for testing and temporary indexes.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

type FileMap = Arc<Mutex<HashMap<String, Arc<[u8]>>>>;

/// An in-memory storage implementation.
///
/// Cloning a `MemoryStorage` yields another handle onto the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    /// The files stored in memory. Finished files are immutable.
    files: FileMap,
    /// Names of locks currently held.
    locks: Arc<Mutex<HashSet<String>>>,
    /// Whether the storage is closed.
    closed: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Create a new, empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.check_closed()?;

        let mut locks = self.locks.lock();
        if !locks.insert(name.to_string()) {
            return Err(StorageError::LockFailed(name.to_string()).into());
        }

        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
            released: false,
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.locks.lock().clear();
        Ok(())
    }
}

/// A memory-based input.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        MemoryInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based output. The file is published when closed or dropped.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Cursor<Vec<u8>>,
    files: FileMap,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap) -> Self {
        MemoryOutput {
            name,
            buffer: Cursor::new(Vec::new()),
            files,
            closed: false,
        }
    }

    fn publish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let data: Arc<[u8]> = std::mem::take(self.buffer.get_mut()).into();
        self.files.lock().insert(self.name.clone(), data);
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }
        self.buffer.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.buffer.position())
    }

    fn close(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.publish();
    }
}

#[derive(Debug)]
struct MemoryLock {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.locks.lock().remove(&self.name);
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_basic_operations() {
        let storage = MemoryStorage::new();

        let mut output = storage.create_output("_0.pst").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        assert!(!storage.file_exists("_0.pst"));
        output.close().unwrap();

        assert!(storage.file_exists("_0.pst"));
        assert_eq!(storage.file_size("_0.pst").unwrap(), 13);

        let mut input = storage.open_input("_0.pst").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"Hello, World!");
    }

    #[test]
    fn test_rename_and_delete() {
        let storage = MemoryStorage::new();
        crate::storage::write_all(&storage, "pending_segments_1", b"x").unwrap();

        storage
            .rename_file("pending_segments_1", "segments_1")
            .unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["segments_1".to_string()]);

        storage.delete_file("segments_1").unwrap();
        storage.delete_file("segments_1").unwrap();
        assert_eq!(storage.file_count(), 0);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let storage = MemoryStorage::new();
        let mut lock = storage.obtain_lock("write.lock").unwrap();
        assert!(storage.obtain_lock("write.lock").is_err());

        lock.release().unwrap();
        assert!(!lock.is_valid());
        assert!(storage.obtain_lock("write.lock").is_ok());
    }

    #[test]
    fn test_closed_storage_rejects_operations() {
        let storage = MemoryStorage::new();
        storage.close().unwrap();
        assert!(storage.create_output("a").is_err());
        assert!(storage.list_files().is_err());
    }
}
