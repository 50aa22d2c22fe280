//! Storage abstraction layer for strata.
//!
//! The index writer never touches the file system directly. Every segment
//! file, live-docs generation and commit point goes through the [`Storage`]
//! trait, so the same write path runs on disk ([`file::FileStorage`]) or
//! entirely in memory ([`memory::MemoryStorage`]).
//!
//! # Example
//!
//! ```
//! use std::io::{Read, Write};
//!
//! use strata::storage::memory::MemoryStorage;
//! use strata::storage::Storage;
//!
//! # fn main() -> strata::error::Result<()> {
//! let storage = MemoryStorage::new();
//!
//! let mut output = storage.create_output("_0.pst")?;
//! output.write_all(b"postings")?;
//! output.close()?;
//!
//! let mut input = storage.open_input("_0.pst")?;
//! let mut buffer = Vec::new();
//! input.read_to_end(&mut buffer)?;
//! assert_eq!(buffer, b"postings");
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};

use crate::error::{Result, StrataError};

pub mod file;
pub mod memory;
pub mod structured;

/// Name of the lock file held by an open index writer.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// A trait for storage backends that can store and retrieve files.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing content.
    ///
    /// The file becomes visible once the returned output is closed.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file, replacing the destination if present.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Make sure all completed writes are durable.
    fn sync(&self) -> Result<()>;

    /// Obtain an exclusive, named lock. Fails if the lock is already held.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;

    /// Close the storage. Further operations fail.
    fn close(&self) -> Result<()>;
}

/// A readable, seekable file handle.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Total size of the file in bytes.
    fn size(&self) -> Result<u64>;

    /// Close the input.
    fn close(&mut self) -> Result<()>;
}

/// A writable file handle.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush buffered data and sync it to the backing store.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Current write position.
    fn position(&self) -> Result<u64>;

    /// Close the output, publishing the file.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// An exclusive lock held on a storage.
pub trait StorageLock: Send + std::fmt::Debug {
    /// The lock name.
    fn name(&self) -> &str;

    /// Release the lock. Releasing twice is a no-op.
    fn release(&mut self) -> Result<()>;

    /// Whether the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Storage-specific error conditions.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// The lock is held by someone else.
    LockFailed(String),

    /// The storage is closed.
    StorageClosed,

    /// The stored data failed validation.
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
            StorageError::Corrupt(msg) => write!(f, "Corrupt data: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for StrataError {
    fn from(err: StorageError) -> Self {
        StrataError::storage(err.to_string())
    }
}

/// Read a whole file into memory.
pub fn read_all(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut buffer = Vec::with_capacity(input.size()? as usize);
    input.read_to_end(&mut buffer)?;
    input.close()?;
    Ok(buffer)
}

/// Write a whole file, publishing it on close.
pub fn write_all(storage: &dyn Storage, name: &str, data: &[u8]) -> Result<()> {
    let mut output = storage.create_output(name)?;
    output.write_all(data)?;
    output.flush_and_sync()?;
    output.close()
}
