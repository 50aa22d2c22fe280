//! Read-only views over segments.
//!
//! A [`SegmentReader`] pairs the immutable core of a segment (loaded once
//! through the codec and shared by every reopen) with the deletes and
//! doc-values updates of one point in time. Reopening after new deletes
//! only swaps the live docs, so readers are cheap to clone.
//!
//! An [`IndexSnapshot`] is a consistent set of segment readers, returned by
//! [`IndexWriter::get_reader`](crate::index::writer::IndexWriter::get_reader).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::index::codec::{Codec, DocValuesColumns, Posting, SegmentData, StoredField, TermPostings};
use crate::index::field_infos::FieldInfos;
use crate::index::live_docs::LiveDocs;
use crate::index::query::Query;
use crate::index::segment::SegmentCommitInfo;
use crate::index::term::Term;
use crate::storage::Storage;

/// A point-in-time view of one segment.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    info: Arc<SegmentCommitInfo>,
    core: Arc<SegmentData>,
    numeric_updates: BTreeMap<String, Arc<Vec<Option<i64>>>>,
    binary_updates: BTreeMap<String, Arc<Vec<Option<Vec<u8>>>>>,
    live_docs: Option<Arc<LiveDocs>>,
    num_docs: u32,
}

impl SegmentReader {
    /// Open a segment with its current live docs and doc-values updates.
    pub fn open(
        storage: &dyn Storage,
        codec: &dyn Codec,
        info: Arc<SegmentCommitInfo>,
    ) -> Result<Self> {
        let core = Arc::new(codec.open_segment(storage, info.info())?);
        let mut reader = SegmentReader::from_data(Arc::clone(&info), core);
        reader.load_field_updates(storage, codec)?;

        if info.has_deletions() {
            let live_docs = codec.read_live_docs(storage, info.name(), info.del_gen(), info.max_doc())?;
            if live_docs.num_deleted() != info.del_count() {
                return Err(StrataError::index(format!(
                    "segment {} has {} deleted bits but del count {}",
                    info.name(),
                    live_docs.num_deleted(),
                    info.del_count()
                )));
            }
            reader.num_docs = live_docs.num_live();
            reader.live_docs = Some(Arc::new(live_docs));
        }

        Ok(reader)
    }

    /// Wrap in-memory segment data with every document live.
    pub fn from_data(info: Arc<SegmentCommitInfo>, core: Arc<SegmentData>) -> Self {
        let num_docs = core.max_doc;
        SegmentReader {
            info,
            core,
            numeric_updates: BTreeMap::new(),
            binary_updates: BTreeMap::new(),
            live_docs: None,
            num_docs,
        }
    }

    fn load_field_updates(&mut self, storage: &dyn Storage, codec: &dyn Codec) -> Result<()> {
        let gens = self.info.field_update_gens();
        let wanted: BTreeSet<i64> = gens.values().copied().collect();
        for gen in wanted {
            let file = self.info.update_file(gen).ok_or_else(|| {
                StrataError::index(format!(
                    "segment {} has no update file for generation {gen}",
                    self.info.name()
                ))
            })?;
            let mut columns = codec.read_field_updates(storage, &file)?;
            for (field, _) in gens.iter().filter(|(_, g)| **g == gen) {
                if let Some(column) = columns.numeric.remove(field) {
                    self.numeric_updates.insert(field.clone(), Arc::new(column));
                }
                if let Some(column) = columns.binary.remove(field) {
                    self.binary_updates.insert(field.clone(), Arc::new(column));
                }
            }
        }
        Ok(())
    }

    /// Same core and updates with different live docs.
    pub fn with_live_docs(&self, live_docs: Option<Arc<LiveDocs>>, num_docs: u32) -> Self {
        SegmentReader {
            live_docs,
            num_docs,
            ..self.clone()
        }
    }

    /// Same core and live docs with the given columns replacing current values.
    pub fn with_field_updates(&self, columns: &DocValuesColumns) -> Self {
        let mut reader = self.clone();
        for (field, column) in &columns.numeric {
            reader
                .numeric_updates
                .insert(field.clone(), Arc::new(column.clone()));
        }
        for (field, column) in &columns.binary {
            reader
                .binary_updates
                .insert(field.clone(), Arc::new(column.clone()));
        }
        reader
    }

    /// Segment commit info this reader was opened for.
    pub fn info(&self) -> &Arc<SegmentCommitInfo> {
        &self.info
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.info.name()
    }

    /// The shared immutable segment data.
    pub fn core(&self) -> &Arc<SegmentData> {
        &self.core
    }

    /// Number of documents, deleted or not.
    pub fn max_doc(&self) -> u32 {
        self.core.max_doc
    }

    /// Number of live documents.
    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    /// Number of deleted documents.
    pub fn num_deleted_docs(&self) -> u32 {
        self.max_doc() - self.num_docs
    }

    /// Live docs, `None` if every document is live.
    pub fn live_docs(&self) -> Option<&Arc<LiveDocs>> {
        self.live_docs.as_ref()
    }

    /// Whether a document is live.
    pub fn is_live(&self, doc: u32) -> bool {
        match &self.live_docs {
            Some(live) => live.is_live(doc),
            None => doc < self.max_doc(),
        }
    }

    /// Field metadata.
    pub fn field_infos(&self) -> &FieldInfos {
        &self.core.field_infos
    }

    /// Terms of a field.
    pub fn terms(&self, field: &str) -> Option<&TermPostings> {
        self.core.postings.get(field)
    }

    /// Postings of a term, deleted documents included.
    pub fn postings(&self, term: &Term) -> &[Posting] {
        self.core
            .postings
            .get(&term.field)
            .and_then(|terms| terms.get(&term.text))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Token counts per document for a field.
    pub fn norms(&self, field: &str) -> Option<&[u32]> {
        self.core.norms.get(field).map(Vec::as_slice)
    }

    /// Current numeric column of a field, updates applied.
    pub fn numeric_column(&self, field: &str) -> Option<&[Option<i64>]> {
        match self.numeric_updates.get(field) {
            Some(column) => Some(column.as_slice()),
            None => self.core.numeric_doc_values.get(field).map(Vec::as_slice),
        }
    }

    /// Current binary column of a field, updates applied.
    pub fn binary_column(&self, field: &str) -> Option<&[Option<Vec<u8>>]> {
        match self.binary_updates.get(field) {
            Some(column) => Some(column.as_slice()),
            None => self.core.binary_doc_values.get(field).map(Vec::as_slice),
        }
    }

    /// Numeric doc value of a document.
    pub fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        self.numeric_column(field)
            .and_then(|column| column.get(doc as usize).copied().flatten())
    }

    /// Binary doc value of a document.
    pub fn binary_value(&self, field: &str, doc: u32) -> Option<&[u8]> {
        self.binary_column(field)
            .and_then(|column| column.get(doc as usize))
            .and_then(|value| value.as_deref())
    }

    /// All current doc-values columns, updates applied.
    pub fn doc_values_columns(&self) -> DocValuesColumns {
        let mut columns = DocValuesColumns {
            numeric: self.core.numeric_doc_values.clone(),
            binary: self.core.binary_doc_values.clone(),
        };
        for (field, column) in &self.numeric_updates {
            columns.numeric.insert(field.clone(), column.as_ref().clone());
        }
        for (field, column) in &self.binary_updates {
            columns.binary.insert(field.clone(), column.as_ref().clone());
        }
        columns
    }

    /// Stored fields of a document.
    pub fn stored_fields(&self, doc: u32) -> &[StoredField] {
        self.core
            .stored
            .get(doc as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Live documents matching a query.
    pub fn search(&self, query: &Query) -> Vec<u32> {
        query
            .matching_docs(self)
            .into_iter()
            .filter(|&doc| self.is_live(doc))
            .collect()
    }
}

/// A document inside an [`IndexSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocAddress {
    /// Index of the segment reader in the snapshot.
    pub segment: usize,
    /// Segment-local document ID.
    pub doc: u32,
}

/// A consistent, read-only view of the whole index.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    readers: Vec<SegmentReader>,
    version: u64,
}

impl IndexSnapshot {
    /// Build a snapshot from segment readers.
    pub fn new(readers: Vec<SegmentReader>, version: u64) -> Self {
        IndexSnapshot { readers, version }
    }

    /// Version of the segment set the snapshot was taken from.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The segment readers, in index order.
    pub fn segment_readers(&self) -> &[SegmentReader] {
        &self.readers
    }

    /// Number of live documents.
    pub fn num_docs(&self) -> u64 {
        self.readers.iter().map(|r| r.num_docs() as u64).sum()
    }

    /// Number of documents, deleted or not.
    pub fn max_doc(&self) -> u64 {
        self.readers.iter().map(|r| r.max_doc() as u64).sum()
    }

    /// Number of live documents containing the term.
    pub fn doc_freq(&self, term: &Term) -> u64 {
        self.readers
            .iter()
            .map(|r| r.postings(term).iter().filter(|p| r.is_live(p.doc)).count() as u64)
            .sum()
    }

    /// Live documents matching a query, in index order.
    pub fn search(&self, query: &Query) -> Vec<DocAddress> {
        self.readers
            .iter()
            .enumerate()
            .flat_map(|(segment, reader)| {
                reader
                    .search(query)
                    .into_iter()
                    .map(move |doc| DocAddress { segment, doc })
            })
            .collect()
    }

    /// Stored fields of a document.
    pub fn stored_fields(&self, address: DocAddress) -> &[StoredField] {
        self.readers
            .get(address.segment)
            .map(|r| r.stored_fields(address.doc))
            .unwrap_or(&[])
    }

    /// Numeric doc value of a document.
    pub fn numeric_value(&self, field: &str, address: DocAddress) -> Option<i64> {
        self.readers
            .get(address.segment)
            .and_then(|r| r.numeric_value(field, address.doc))
    }

    /// Binary doc value of a document.
    pub fn binary_value(&self, field: &str, address: DocAddress) -> Option<&[u8]> {
        self.readers
            .get(address.segment)
            .and_then(|r| r.binary_value(field, address.doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::DefaultCodec;
    use crate::index::segment::SegmentInfo;
    use crate::storage::memory::MemoryStorage;

    fn data() -> SegmentData {
        let mut data = SegmentData::new(3);
        let mut terms = TermPostings::new();
        terms.insert("a".into(), vec![Posting::new(0, vec![0]), Posting::new(2, vec![0])]);
        data.postings.insert("f".into(), terms);
        data.numeric_doc_values
            .insert("n".into(), vec![Some(1), Some(2), Some(3)]);
        data
    }

    #[test]
    fn test_open_with_deletes_and_updates() {
        let storage = MemoryStorage::new();
        let codec = DefaultCodec::new();
        let mut info = SegmentInfo::new("_0", 3, "default");
        info.files = codec.write_segment(&storage, "_0", &data()).unwrap();
        let info = Arc::new(SegmentCommitInfo::new(info));

        let mut live = LiveDocs::all_live(3);
        live.delete(2);
        codec
            .write_live_docs(&storage, "_0", info.next_write_del_gen(), &live)
            .unwrap();
        info.advance_del_gen();
        info.set_del_count(1).unwrap();

        let mut columns = DocValuesColumns::default();
        columns.numeric.insert("n".into(), vec![Some(10), Some(2), Some(3)]);
        let file = codec
            .write_field_updates(&storage, "_0", info.next_write_field_infos_gen(), &columns)
            .unwrap();
        info.advance_field_infos_gen(file, &["n".to_string()]);

        let reader = SegmentReader::open(&storage, &codec, info).unwrap();
        assert_eq!(reader.num_docs(), 2);
        assert!(!reader.is_live(2));
        assert_eq!(reader.numeric_value("n", 0), Some(10));
        assert_eq!(reader.search(&Query::term("f", "a")), vec![0]);
    }

    #[test]
    fn test_snapshot_addresses() {
        let info = |name: &str| Arc::new(SegmentCommitInfo::new(SegmentInfo::new(name, 3, "default")));
        let first = SegmentReader::from_data(info("_0"), Arc::new(data()));
        let mut live = LiveDocs::all_live(3);
        live.delete(0);
        let second = SegmentReader::from_data(info("_1"), Arc::new(data()))
            .with_live_docs(Some(Arc::new(live)), 2);

        let snapshot = IndexSnapshot::new(vec![first, second], 1);
        assert_eq!(snapshot.num_docs(), 5);
        assert_eq!(snapshot.max_doc(), 6);
        assert_eq!(snapshot.doc_freq(&Term::new("f", "a")), 3);

        let hits = snapshot.search(&Query::term("f", "a"));
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[2], DocAddress { segment: 1, doc: 2 });
        assert_eq!(snapshot.numeric_value("n", hits[2]), Some(3));
    }
}
