//! Reference counting of index files.
//!
//! Every checkpoint of the segment set increments the reference count of
//! the files it uses and decrements those of the previous checkpoint. A
//! commit keeps its files referenced until the next commit replaces it, so
//! only the last commit survives. Files reaching zero are deleted.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};

use crate::error::Result;
use crate::index::segment::{
    PENDING_SEGMENTS_PREFIX, SEGMENTS_PREFIX, SegmentInfos, generation_from_segments_file_name,
};
use crate::storage::{Storage, WRITE_LOCK_NAME};

/// Whether a file name belongs to the index (as opposed to foreign files
/// that happen to live in the same storage).
pub fn is_index_file(name: &str) -> bool {
    name.starts_with('_')
        || name.starts_with(SEGMENTS_PREFIX)
        || name.starts_with(PENDING_SEGMENTS_PREFIX)
}

/// Tracks which files are in use and deletes the rest.
#[derive(Debug)]
pub struct FileDeleter {
    storage: Arc<dyn Storage>,
    ref_counts: AHashMap<String, u32>,
    last_files: BTreeSet<String>,
    commit_files: BTreeSet<String>,
    pending_deletes: BTreeSet<String>,
}

impl FileDeleter {
    /// Create a deleter for the given commit and remove every index file
    /// that commit does not reference, older commits included.
    pub fn new(storage: Arc<dyn Storage>, infos: &SegmentInfos) -> Result<Self> {
        let mut deleter = FileDeleter {
            storage,
            ref_counts: AHashMap::new(),
            last_files: BTreeSet::new(),
            commit_files: BTreeSet::new(),
            pending_deletes: BTreeSet::new(),
        };

        if infos.generation() > 0 {
            let files = infos.files(true);
            deleter.inc_ref(&files);
            deleter.commit_files = files;
        }
        deleter.refresh_all()?;
        Ok(deleter)
    }

    /// Current reference count of a file.
    pub fn ref_count(&self, file: &str) -> u32 {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    /// Whether the file is referenced by a checkpoint or commit.
    pub fn exists(&self, file: &str) -> bool {
        self.ref_count(file) > 0
    }

    /// Record a new state of the segment set.
    ///
    /// For a commit the previous commit's files are released; otherwise
    /// the previous checkpoint's files are.
    pub fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) -> Result<()> {
        let files = infos.files(is_commit);
        self.inc_ref(&files);

        if is_commit {
            let previous = std::mem::replace(&mut self.commit_files, files);
            self.dec_ref(&previous)?;
            debug!(
                "checkpoint: commit {:?} references {} files",
                infos.segments_file_name(),
                self.commit_files.len()
            );
        } else {
            let previous = std::mem::replace(&mut self.last_files, files);
            self.dec_ref(&previous)?;
        }
        Ok(())
    }

    /// Increment the reference count of each file.
    pub fn inc_ref(&mut self, files: &BTreeSet<String>) {
        for file in files {
            *self.ref_counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    /// Decrement the reference count of each file, deleting files that
    /// are no longer referenced.
    pub fn dec_ref(&mut self, files: &BTreeSet<String>) -> Result<()> {
        let mut to_delete = Vec::new();
        for file in files {
            if let Some(count) = self.ref_counts.get_mut(file) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ref_counts.remove(file);
                    to_delete.push(file.clone());
                }
            }
        }
        for file in to_delete {
            self.delete_file(&file);
        }
        self.delete_pending_files();
        Ok(())
    }

    /// Delete freshly written files that no checkpoint ever referenced.
    pub fn delete_new_files(&mut self, files: &BTreeSet<String>) {
        for file in files {
            if !self.exists(file) {
                self.delete_file(file);
            }
        }
    }

    /// Delete unreferenced files of one segment, e.g. after a failed flush.
    pub fn refresh(&mut self, segment: &str) -> Result<()> {
        let prefix_dot = format!("{segment}.");
        let prefix_gen = format!("{segment}_");
        let files = self.storage.list_files()?;
        for file in files {
            if (file.starts_with(&prefix_dot) || file.starts_with(&prefix_gen)) && !self.exists(&file)
            {
                self.delete_file(&file);
            }
        }
        Ok(())
    }

    /// Delete every unreferenced index file.
    pub fn refresh_all(&mut self) -> Result<()> {
        let files = self.storage.list_files()?;
        for file in files {
            if file == WRITE_LOCK_NAME || !is_index_file(&file) || self.exists(&file) {
                continue;
            }
            if let Some(generation) = generation_from_segments_file_name(&file) {
                debug!("deleting unreferenced commit segments_{generation}");
            }
            self.delete_file(&file);
        }
        Ok(())
    }

    /// Release the last non-commit checkpoint.
    pub fn close(&mut self) -> Result<()> {
        let previous = std::mem::take(&mut self.last_files);
        self.dec_ref(&previous)
    }

    fn delete_file(&mut self, file: &str) {
        match self.storage.delete_file(file) {
            Ok(()) => {
                self.pending_deletes.remove(file);
            }
            Err(e) => {
                warn!("unable to delete {file}: {e}; will retry");
                self.pending_deletes.insert(file.to_string());
            }
        }
    }

    fn delete_pending_files(&mut self) {
        let pending: Vec<String> = self.pending_deletes.iter().cloned().collect();
        for file in pending {
            if !self.exists(&file) {
                self.delete_file(&file);
            } else {
                self.pending_deletes.remove(&file);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
    use crate::storage::memory::MemoryStorage;

    fn write(storage: &MemoryStorage, name: &str) {
        crate::storage::write_all(storage, name, b"x").unwrap();
    }

    fn segment(storage: &MemoryStorage, name: &str) -> Arc<SegmentCommitInfo> {
        let mut info = SegmentInfo::new(name, 1, "default");
        let file = format!("{name}.pst");
        write(storage, &file);
        info.files.insert(file);
        Arc::new(SegmentCommitInfo::new(info))
    }

    #[test]
    fn test_unreferenced_files_are_deleted_on_open() {
        let storage = MemoryStorage::new();
        write(&storage, "_9.pst");
        write(&storage, "notes.txt");
        write(&storage, WRITE_LOCK_NAME);

        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        FileDeleter::new(shared, &SegmentInfos::new()).unwrap();

        assert!(!storage.file_exists("_9.pst"));
        assert!(storage.file_exists("notes.txt"));
        assert!(storage.file_exists(WRITE_LOCK_NAME));
    }

    #[test]
    fn test_checkpoint_releases_superseded_segments() {
        let storage = MemoryStorage::new();
        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        let mut deleter = FileDeleter::new(shared, &SegmentInfos::new()).unwrap();

        let mut infos = SegmentInfos::new();
        infos.add(segment(&storage, "_0"));
        deleter.checkpoint(&infos, false).unwrap();
        assert_eq!(deleter.ref_count("_0.pst"), 1);

        infos.remove("_0");
        infos.add(segment(&storage, "_1"));
        deleter.checkpoint(&infos, false).unwrap();

        assert!(!storage.file_exists("_0.pst"));
        assert!(storage.file_exists("_1.pst"));
    }

    #[test]
    fn test_commit_keeps_only_last_commit() {
        let storage = MemoryStorage::new();
        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        let mut deleter = FileDeleter::new(shared, &SegmentInfos::new()).unwrap();

        let mut infos = SegmentInfos::new();
        infos.add(segment(&storage, "_0"));
        let generation = infos.prepare_commit(&storage).unwrap();
        infos.finish_commit(&storage, generation).unwrap();
        deleter.checkpoint(&infos, true).unwrap();

        infos.add(segment(&storage, "_1"));
        let generation = infos.prepare_commit(&storage).unwrap();
        infos.finish_commit(&storage, generation).unwrap();
        deleter.checkpoint(&infos, true).unwrap();

        assert!(!storage.file_exists("segments_1"));
        assert!(storage.file_exists("segments_2"));
        assert!(storage.file_exists("_0.pst"));
        assert_eq!(deleter.ref_count("_0.pst"), 1);
    }

    #[test]
    fn test_refresh_segment_and_new_files() {
        let storage = MemoryStorage::new();
        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        let mut deleter = FileDeleter::new(shared, &SegmentInfos::new()).unwrap();

        write(&storage, "_3.pst");
        write(&storage, "_3_1.liv");
        write(&storage, "_30.pst");
        deleter.refresh("_3").unwrap();
        assert!(!storage.file_exists("_3.pst"));
        assert!(!storage.file_exists("_3_1.liv"));
        assert!(storage.file_exists("_30.pst"));

        deleter.delete_new_files(&["_30.pst".to_string()].into());
        assert!(!storage.file_exists("_30.pst"));
    }
}
