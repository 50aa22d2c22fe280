//! Per-segment readers with pending deletes and doc-values updates.
//!
//! Resolving deletes needs a reader per live segment and a writable copy of
//! its live docs. [`ReadersAndUpdates`] keeps both, plus the deletes that
//! are not yet written to a new live-docs generation. Live docs are
//! copy-on-write: handing them to a reader marks them shared, and the next
//! delete clones them first, so a published reader never sees later deletes.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::index::codec::Codec;
use crate::index::live_docs::LiveDocs;
use crate::index::reader::SegmentReader;
use crate::index::segment::{SegmentCommitInfo, SegmentInfos, field_updates_file_name, live_docs_file_name};
use crate::index::writer::doc_values_updates::FieldUpdates;
use crate::storage::Storage;

#[derive(Debug)]
struct RldState {
    reader: Option<SegmentReader>,
    live_docs: Option<Arc<LiveDocs>>,
    live_docs_shared: bool,
    pending_delete_count: u32,
    merging: bool,
    merging_updates: FieldUpdates,
}

/// Reader, live docs and pending changes of one segment.
#[derive(Debug)]
pub struct ReadersAndUpdates {
    info: Arc<SegmentCommitInfo>,
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    state: Mutex<RldState>,
}

impl ReadersAndUpdates {
    /// Create an entry for a segment. Nothing is loaded until needed.
    pub fn new(info: Arc<SegmentCommitInfo>, storage: Arc<dyn Storage>, codec: Arc<dyn Codec>) -> Self {
        ReadersAndUpdates {
            info,
            storage,
            codec,
            state: Mutex::new(RldState {
                reader: None,
                live_docs: None,
                live_docs_shared: true,
                pending_delete_count: 0,
                merging: false,
                merging_updates: FieldUpdates::new(),
            }),
        }
    }

    /// Create an entry for a just-flushed segment whose live docs are known.
    pub fn with_live_docs(
        info: Arc<SegmentCommitInfo>,
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        live_docs: Option<LiveDocs>,
    ) -> Self {
        let rld = Self::new(info, storage, codec);
        {
            let mut state = rld.state.lock();
            state.live_docs = live_docs.map(Arc::new);
            state.live_docs_shared = false;
        }
        rld
    }

    /// The segment.
    pub fn info(&self) -> &Arc<SegmentCommitInfo> {
        &self.info
    }

    fn ensure_reader(&self, state: &mut RldState) -> Result<SegmentReader> {
        if let Some(reader) = &state.reader {
            return Ok(reader.clone());
        }
        let reader = SegmentReader::open(self.storage.as_ref(), self.codec.as_ref(), Arc::clone(&self.info))?;
        if state.live_docs.is_none() {
            state.live_docs = reader.live_docs().cloned();
            state.live_docs_shared = true;
        }
        trace!("opened reader for {}", self.info.name());
        state.reader = Some(reader.clone());
        Ok(reader)
    }

    /// The reader over the segment as last written, opened on first use.
    pub fn reader(&self) -> Result<SegmentReader> {
        let mut state = self.state.lock();
        self.ensure_reader(&mut state)
    }

    fn current_view(&self, state: &mut RldState) -> Result<SegmentReader> {
        let reader = self.ensure_reader(state)?;
        state.live_docs_shared = true;
        let num_docs = self.info.max_doc() - self.info.del_count() - state.pending_delete_count;
        Ok(reader.with_live_docs(state.live_docs.clone(), num_docs))
    }

    /// A reader reflecting every delete so far, including unwritten ones.
    /// Later deletes do not show through it.
    pub fn read_only_clone(&self) -> Result<SegmentReader> {
        let mut state = self.state.lock();
        self.current_view(&mut state)
    }

    /// Like [`read_only_clone`](Self::read_only_clone), and marks the
    /// segment as merging so doc-values updates are mirrored for the merge.
    pub fn reader_for_merge(&self) -> Result<SegmentReader> {
        let mut state = self.state.lock();
        state.merging = true;
        self.current_view(&mut state)
    }

    /// Make sure the live docs can be changed without affecting readers.
    pub fn init_writable_live_docs(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_reader(&mut state)?;
        Self::make_writable(&mut state, self.info.max_doc());
        Ok(())
    }

    fn make_writable(state: &mut RldState, max_doc: u32) {
        if state.live_docs_shared {
            let copy = match &state.live_docs {
                Some(live) => LiveDocs::clone(live),
                None => LiveDocs::all_live(max_doc),
            };
            state.live_docs = Some(Arc::new(copy));
            state.live_docs_shared = false;
        }
    }

    /// Delete a document. Returns false if it was already deleted.
    pub fn delete(&self, doc: u32) -> bool {
        let mut state = self.state.lock();
        Self::make_writable(&mut state, self.info.max_doc());
        let Some(live) = state.live_docs.as_mut() else {
            return false;
        };
        let deleted = Arc::make_mut(live).delete(doc);
        if deleted {
            state.pending_delete_count += 1;
        }
        deleted
    }

    /// Current live docs, `None` if every document is live.
    pub fn live_docs(&self) -> Option<Arc<LiveDocs>> {
        self.state.lock().live_docs.clone()
    }

    /// Current live docs for a reader; later deletes copy first.
    pub fn read_only_live_docs(&self) -> Option<Arc<LiveDocs>> {
        let mut state = self.state.lock();
        state.live_docs_shared = true;
        state.live_docs.clone()
    }

    /// Deletes not yet written to a live-docs generation.
    pub fn pending_delete_count(&self) -> u32 {
        self.state.lock().pending_delete_count
    }

    /// Written plus pending deletes.
    pub fn num_deleted_docs(&self) -> u32 {
        self.info.del_count() + self.pending_delete_count()
    }

    /// Write pending deletes as a new live-docs generation.
    ///
    /// Returns false if nothing was pending. A failed write still advances
    /// the next write generation so a retry never reuses the file name.
    pub fn write_live_docs(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.pending_delete_count == 0 {
            return Ok(false);
        }
        let Some(live) = state.live_docs.clone() else {
            return Ok(false);
        };
        debug_assert_eq!(live.max_doc(), self.info.max_doc());

        let gen = self.info.next_write_del_gen();
        if let Err(e) = self
            .codec
            .write_live_docs(self.storage.as_ref(), self.info.name(), gen, &live)
        {
            self.info.advance_next_write_del_gen();
            let partial = live_docs_file_name(self.info.name(), gen);
            if let Err(delete_err) = self.storage.delete_file(&partial) {
                warn!("cannot remove partial live docs {partial}: {delete_err}");
            }
            return Err(e);
        }

        self.info.advance_del_gen();
        self.info
            .set_del_count(self.info.del_count() + state.pending_delete_count)?;
        debug!(
            "wrote live docs for {} at gen {gen}: {} new deletes",
            self.info.name(),
            state.pending_delete_count
        );
        state.pending_delete_count = 0;
        Ok(true)
    }

    /// Write resolved doc-values updates as a new update generation and
    /// switch the reader over to the new values.
    pub fn write_field_updates(&self, updates: &FieldUpdates) -> Result<()> {
        if !updates.any() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let reader = self.ensure_reader(&mut state)?;
        let columns = updates.apply_to(&reader.doc_values_columns(), self.info.max_doc());

        let gen = self.info.next_write_field_infos_gen();
        match self
            .codec
            .write_field_updates(self.storage.as_ref(), self.info.name(), gen, &columns)
        {
            Ok(file) => {
                self.info.advance_field_infos_gen(file, &columns.fields());
                state.reader = Some(reader.with_field_updates(&columns));
                if state.merging {
                    state.merging_updates.merge(updates);
                }
                debug!(
                    "wrote doc-values updates for {} at gen {gen}: {:?}",
                    self.info.name(),
                    columns.fields()
                );
                Ok(())
            }
            Err(e) => {
                self.info.advance_next_write_field_infos_gen();
                let partial = field_updates_file_name(self.info.name(), gen);
                if let Err(delete_err) = self.storage.delete_file(&partial) {
                    warn!("cannot remove partial updates {partial}: {delete_err}");
                }
                Err(e)
            }
        }
    }

    /// Mark or unmark the segment as being merged.
    pub fn set_merging(&self, merging: bool) {
        self.state.lock().merging = merging;
    }

    /// Whether the segment is being merged.
    pub fn is_merging(&self) -> bool {
        self.state.lock().merging
    }

    /// Doc-values updates written since the merge started.
    pub fn merging_field_updates(&self) -> FieldUpdates {
        self.state.lock().merging_updates.clone()
    }

    /// Forget mirrored updates and leave merging mode.
    pub fn drop_merging_updates(&self) {
        let mut state = self.state.lock();
        state.merging_updates.clear();
        state.merging = false;
    }

    /// Close the cached reader.
    pub fn drop_reader(&self) {
        self.state.lock().reader = None;
    }
}

/// Pool of [`ReadersAndUpdates`] keyed by segment name.
#[derive(Debug)]
pub struct ReaderPool {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    pooling: bool,
    readers: Mutex<HashMap<String, Arc<ReadersAndUpdates>>>,
}

impl ReaderPool {
    /// Create a pool. Without pooling, entries are written and dropped on
    /// their last release.
    pub fn new(storage: Arc<dyn Storage>, codec: Arc<dyn Codec>, pooling: bool) -> Self {
        ReaderPool {
            storage,
            codec,
            pooling,
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether readers stay open between operations.
    pub fn is_pooling(&self) -> bool {
        self.pooling
    }

    /// Entry for a segment, created if `create` is set.
    pub fn get(&self, info: &Arc<SegmentCommitInfo>, create: bool) -> Option<Arc<ReadersAndUpdates>> {
        let mut readers = self.readers.lock();
        if let Some(rld) = readers.get(info.name()) {
            debug_assert!(Arc::ptr_eq(rld.info(), info), "stale entry for {}", info.name());
            return Some(Arc::clone(rld));
        }
        if !create {
            return None;
        }
        let rld = Arc::new(ReadersAndUpdates::new(
            Arc::clone(info),
            Arc::clone(&self.storage),
            Arc::clone(&self.codec),
        ));
        readers.insert(info.name().to_string(), Arc::clone(&rld));
        Some(rld)
    }

    /// Register a just-flushed segment with its known live docs.
    pub fn insert_flushed(&self, info: &Arc<SegmentCommitInfo>, live_docs: Option<LiveDocs>) -> Arc<ReadersAndUpdates> {
        let rld = Arc::new(ReadersAndUpdates::with_live_docs(
            Arc::clone(info),
            Arc::clone(&self.storage),
            Arc::clone(&self.codec),
            live_docs,
        ));
        self.readers
            .lock()
            .insert(info.name().to_string(), Arc::clone(&rld));
        rld
    }

    /// Give back an entry. Returns true if live docs were written, in which
    /// case the caller must checkpoint.
    pub fn release(&self, rld: Arc<ReadersAndUpdates>) -> Result<bool> {
        let mut readers = self.readers.lock();
        // one reference in the map, one held by the caller
        if self.pooling || Arc::strong_count(&rld) > 2 {
            return Ok(false);
        }
        let wrote = rld.write_live_docs()?;
        rld.drop_reader();
        readers.remove(rld.info().name());
        Ok(wrote)
    }

    /// Drop a segment's entry without writing.
    pub fn drop(&self, info: &SegmentCommitInfo) {
        if let Some(rld) = self.readers.lock().remove(info.name()) {
            rld.drop_reader();
        }
    }

    /// Drop every entry, writing pending deletes first if `save`.
    /// Returns true if anything was written.
    pub fn drop_all(&self, save: bool) -> Result<bool> {
        let entries: Vec<Arc<ReadersAndUpdates>> = self.readers.lock().drain().map(|(_, v)| v).collect();
        let mut wrote = false;
        let mut first_err = None;
        for rld in entries {
            if save {
                match rld.write_live_docs() {
                    Ok(w) => wrote |= w,
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            rld.drop_reader();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(wrote),
        }
    }

    /// Write pending deletes of every segment in `infos`. Returns true if
    /// anything was written.
    pub fn commit(&self, infos: &SegmentInfos) -> Result<bool> {
        let mut wrote = false;
        for info in infos.iter() {
            let rld = self.readers.lock().get(info.name()).cloned();
            if let Some(rld) = rld {
                wrote |= rld.write_live_docs()?;
            }
        }
        Ok(wrote)
    }

    /// Whether `info` is the live instance of its segment in `infos`.
    pub fn info_is_live(&self, infos: &SegmentInfos, info: &Arc<SegmentCommitInfo>) -> bool {
        infos.get(info.name()).is_some_and(|live| Arc::ptr_eq(live, info))
    }

    /// Written plus pending deletes of a segment.
    pub fn num_deleted_docs(&self, info: &SegmentCommitInfo) -> u32 {
        match self.readers.lock().get(info.name()) {
            Some(rld) => rld.num_deleted_docs(),
            None => info.del_count(),
        }
    }

    /// Whether any segment has deletes not yet written.
    pub fn any_pending_deletes(&self) -> bool {
        self.readers
            .lock()
            .values()
            .any(|rld| rld.pending_delete_count() > 0)
    }
}
