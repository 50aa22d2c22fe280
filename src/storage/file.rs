//! File-system storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Buffer size used for readers and writers.
    pub buffer_size: usize,

    /// Whether `sync` on the storage also fsyncs the directory.
    pub sync_directory: bool,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        FileStorageConfig {
            buffer_size: 65536,
            sync_directory: true,
        }
    }
}

/// A storage backed by one directory on disk.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: FileStorageConfig,
    /// Whether the storage is closed.
    closed: AtomicBool,
}

impl FileStorage {
    /// Open (and create if needed) a file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: FileStorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| StrataError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(StrataError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage {
            directory,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// The root directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }
}

fn map_not_found(name: &str, e: std::io::Error) -> StrataError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string()).into()
    } else {
        StrataError::Io(e)
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let file = File::open(self.file_path(name)).map_err(|e| map_not_found(name, e))?;
        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(name))?;

        Ok(Box::new(FileOutput::new(file, self.config.buffer_size)))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::storage(format!(
                "Failed to delete file {name}: {e}"
            ))),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| map_not_found(name, e))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| map_not_found(old_name, e))
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()?;

        if self.config.sync_directory {
            // Directory fsync is not supported on every platform.
            if let Ok(dir) = File::open(&self.directory) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.check_closed()?;

        let path = self.file_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    StorageError::LockFailed(name.to_string()).into()
                } else {
                    StrataError::Io(e)
                }
            })?;

        Ok(Box::new(FileLock {
            name: name.to_string(),
            path,
            _file: file,
            released: false,
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A buffered file input.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(FileInput {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A buffered file output, fsynced on close.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    position: u64,
    closed: bool,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            position: 0,
            closed: false,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.position = self.writer.seek(pos)?;
        Ok(self.position)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.flush_and_sync()?;
            self.closed = true;
        }
        Ok(())
    }
}

/// A lock represented by an exclusively created file.
#[derive(Debug)]
struct FileLock {
    name: String,
    path: PathBuf,
    _file: File,
    released: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            std::fs::remove_file(&self.path)
                .map_err(|e| StrataError::storage(format!("Failed to release lock: {e}")))?;
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, FileStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path(), FileStorageConfig::default()).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_create_and_read_file() {
        let (_temp_dir, storage) = create_test_storage();

        let mut output = storage.create_output("_0.pst").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("_0.pst").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, World!");
        assert_eq!(input.size().unwrap(), 13);
    }

    #[test]
    fn test_file_operations() {
        let (_temp_dir, storage) = create_test_storage();

        assert!(!storage.file_exists("pending_segments_1"));

        let mut output = storage.create_output("pending_segments_1").unwrap();
        output.write_all(b"Test content").unwrap();
        output.close().unwrap();

        assert!(storage.file_exists("pending_segments_1"));
        assert_eq!(storage.file_size("pending_segments_1").unwrap(), 12);
        assert_eq!(storage.list_files().unwrap(), vec!["pending_segments_1"]);

        storage
            .rename_file("pending_segments_1", "segments_1")
            .unwrap();
        assert!(!storage.file_exists("pending_segments_1"));
        assert!(storage.file_exists("segments_1"));

        storage.delete_file("segments_1").unwrap();
        storage.delete_file("segments_1").unwrap();
        assert!(!storage.file_exists("segments_1"));
    }

    #[test]
    fn test_file_not_found() {
        let (_temp_dir, storage) = create_test_storage();

        assert!(storage.open_input("nonexistent").is_err());
        assert!(storage.file_size("nonexistent").is_err());
    }

    #[test]
    fn test_write_lock() {
        let (_temp_dir, storage) = create_test_storage();

        let lock = storage.obtain_lock("write.lock").unwrap();
        assert!(storage.obtain_lock("write.lock").is_err());
        drop(lock);
        assert!(storage.obtain_lock("write.lock").is_ok());
    }

    #[test]
    fn test_storage_close() {
        let (_temp_dir, storage) = create_test_storage();

        storage.close().unwrap();
        assert!(storage.create_output("test.txt").is_err());
    }
}
