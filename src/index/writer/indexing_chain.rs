//! The per-document indexing chain.
//!
//! A document is pushed field by field through an ordered list of
//! [`IndexingStage`]s. Each stage owns one kind of in-memory segment data
//! (postings, norms, doc values, stored fields) and turns it into the
//! matching part of [`SegmentData`] on flush.
//!
//! Errors raised while processing a field are per-document unless they are
//! [`StrataError::Aborting`]: the caller deletes the offending document and
//! keeps the rest of the buffer.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::analysis::Analyzer;
use crate::document::{Document, Field, FieldValue};
use crate::error::{Result, StrataError};
use crate::index::codec::{Posting, SegmentData, StoredField};
use crate::index::field_infos::{FieldInfo, FieldInfosBuilder, FieldNumbers};
use crate::index::writer::block_pool::ByteBlockPool;

/// Longest term, in UTF-8 bytes, the postings can hold.
pub const MAX_TERM_LENGTH: usize = 32766;

const BYTES_PER_TERM: i64 = 48;
const BYTES_PER_POSTING: i64 = 24;
const BYTES_PER_POSITION: i64 = 4;

/// Per-document scratch state shared by the stages.
#[derive(Debug, Default)]
pub struct DocumentState {
    /// Buffer-local ID of the document.
    pub doc_id: u32,
    /// Number of tokens per analyzed field.
    pub field_lengths: AHashMap<String, u32>,
    /// Next position per field, so multi-valued fields keep counting.
    pub positions: AHashMap<String, u32>,
    /// Doc-values fields already seen in this document.
    pub doc_values_seen: AHashSet<String>,
    /// Stored values collected for this document.
    pub stored: Vec<StoredField>,
}

impl DocumentState {
    /// Fresh state for one document.
    pub fn new(doc_id: u32) -> Self {
        DocumentState {
            doc_id,
            ..Default::default()
        }
    }
}

/// One stage of the indexing chain.
pub trait IndexingStage: Send + std::fmt::Debug {
    /// Stage name for logging.
    fn name(&self) -> &'static str;

    /// Consume one field of the current document.
    fn process_field(
        &mut self,
        state: &mut DocumentState,
        field: &Field,
        info: &FieldInfo,
        analyzer: &dyn Analyzer,
    ) -> Result<()>;

    /// Called once every field of the document was processed.
    fn finish_document(&mut self, _state: &mut DocumentState) -> Result<()> {
        Ok(())
    }

    /// Move the buffered data of `num_docs` documents into `segment`.
    fn flush(&mut self, num_docs: u32, segment: &mut SegmentData) -> Result<()>;

    /// Discard everything buffered.
    fn abort(&mut self);

    /// Approximate RAM held.
    fn bytes_used(&self) -> i64;
}

/// Inverts text and keyword fields into postings.
#[derive(Debug, Default)]
pub struct InvertStage {
    postings: AHashMap<String, AHashMap<String, Vec<Posting>>>,
    bytes_used: i64,
}

impl InvertStage {
    /// Create an empty stage.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_token(&mut self, field: &str, text: &str, doc: u32, position: u32) {
        let terms = self.postings.entry(field.to_string()).or_default();
        let postings = match terms.get_mut(text) {
            Some(postings) => postings,
            None => {
                self.bytes_used += BYTES_PER_TERM + text.len() as i64;
                terms.entry(text.to_string()).or_default()
            }
        };
        match postings.last_mut() {
            Some(last) if last.doc == doc => last.positions.push(position),
            _ => {
                self.bytes_used += BYTES_PER_POSTING;
                postings.push(Posting::new(doc, vec![position]));
            }
        }
        self.bytes_used += BYTES_PER_POSITION;
    }
}

fn check_term_length(field: &str, text: &str) -> Result<()> {
    if text.len() > MAX_TERM_LENGTH {
        return Err(StrataError::document(format!(
            "immense term in field \"{field}\": {} bytes exceeds the maximum of {MAX_TERM_LENGTH}",
            text.len()
        )));
    }
    Ok(())
}

impl IndexingStage for InvertStage {
    fn name(&self) -> &'static str {
        "invert"
    }

    fn process_field(
        &mut self,
        state: &mut DocumentState,
        field: &Field,
        _info: &FieldInfo,
        analyzer: &dyn Analyzer,
    ) -> Result<()> {
        let base = state.positions.get(&field.name).copied().unwrap_or(0);
        match &field.value {
            FieldValue::Keyword(text) => {
                check_term_length(&field.name, text)?;
                self.add_token(&field.name, text, state.doc_id, base);
                state.positions.insert(field.name.clone(), base + 1);
            }
            FieldValue::Text(text) => {
                let mut next = base;
                let mut count = 0u32;
                for token in analyzer.analyze(text)? {
                    check_term_length(&field.name, &token.text)?;
                    let position = base + token.position as u32;
                    self.add_token(&field.name, &token.text, state.doc_id, position);
                    next = next.max(position + 1);
                    count += 1;
                }
                state.positions.insert(field.name.clone(), next);
                *state.field_lengths.entry(field.name.clone()).or_insert(0) += count;
            }
            FieldValue::Numeric(_) | FieldValue::Binary(_) => {}
        }
        Ok(())
    }

    fn flush(&mut self, _num_docs: u32, segment: &mut SegmentData) -> Result<()> {
        for (field, terms) in self.postings.drain() {
            let sorted: BTreeMap<String, Vec<Posting>> = terms.into_iter().collect();
            segment.postings.insert(field, sorted);
        }
        self.bytes_used = 0;
        Ok(())
    }

    fn abort(&mut self) {
        self.postings.clear();
        self.bytes_used = 0;
    }

    fn bytes_used(&self) -> i64 {
        self.bytes_used
    }
}

/// Records the token count of analyzed fields.
#[derive(Debug, Default)]
pub struct NormsStage {
    norms: AHashMap<String, Vec<u32>>,
}

impl NormsStage {
    /// Create an empty stage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexingStage for NormsStage {
    fn name(&self) -> &'static str {
        "norms"
    }

    fn process_field(
        &mut self,
        _state: &mut DocumentState,
        _field: &Field,
        _info: &FieldInfo,
        _analyzer: &dyn Analyzer,
    ) -> Result<()> {
        Ok(())
    }

    fn finish_document(&mut self, state: &mut DocumentState) -> Result<()> {
        let doc = state.doc_id as usize;
        for (field, &length) in &state.field_lengths {
            let column = self.norms.entry(field.clone()).or_default();
            if column.len() <= doc {
                column.resize(doc + 1, 0);
            }
            column[doc] = length;
        }
        Ok(())
    }

    fn flush(&mut self, num_docs: u32, segment: &mut SegmentData) -> Result<()> {
        for (field, mut column) in self.norms.drain() {
            column.resize(num_docs as usize, 0);
            segment.norms.insert(field, column);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.norms.clear();
    }

    fn bytes_used(&self) -> i64 {
        self.norms.values().map(|c| c.len() as i64 * 4).sum()
    }
}

/// Buffers numeric and binary doc values.
#[derive(Debug, Default)]
pub struct DocValuesStage {
    numeric: AHashMap<String, Vec<Option<i64>>>,
    binary: AHashMap<String, Vec<Option<Vec<u8>>>>,
    bytes_used: i64,
}

impl DocValuesStage {
    /// Create an empty stage.
    pub fn new() -> Self {
        Self::default()
    }
}

fn set_slot<T: Clone>(column: &mut Vec<Option<T>>, doc: u32, value: T) {
    let doc = doc as usize;
    if column.len() <= doc {
        column.resize(doc + 1, None);
    }
    column[doc] = Some(value);
}

impl IndexingStage for DocValuesStage {
    fn name(&self) -> &'static str {
        "doc_values"
    }

    fn process_field(
        &mut self,
        state: &mut DocumentState,
        field: &Field,
        _info: &FieldInfo,
        _analyzer: &dyn Analyzer,
    ) -> Result<()> {
        if !field.value.is_doc_value() {
            return Ok(());
        }
        if !state.doc_values_seen.insert(field.name.clone()) {
            return Err(StrataError::document(format!(
                "doc values field \"{}\" appears more than once in this document",
                field.name
            )));
        }
        match &field.value {
            FieldValue::Numeric(v) => {
                let column = self.numeric.entry(field.name.clone()).or_default();
                set_slot(column, state.doc_id, *v);
                self.bytes_used += 16;
            }
            FieldValue::Binary(bytes) => {
                let column = self.binary.entry(field.name.clone()).or_default();
                set_slot(column, state.doc_id, bytes.clone());
                self.bytes_used += 24 + bytes.len() as i64;
            }
            _ => {}
        }
        Ok(())
    }

    fn flush(&mut self, num_docs: u32, segment: &mut SegmentData) -> Result<()> {
        for (field, mut column) in self.numeric.drain() {
            column.resize(num_docs as usize, None);
            segment.numeric_doc_values.insert(field, column);
        }
        for (field, mut column) in self.binary.drain() {
            column.resize(num_docs as usize, None);
            segment.binary_doc_values.insert(field, column);
        }
        self.bytes_used = 0;
        Ok(())
    }

    fn abort(&mut self) {
        self.numeric.clear();
        self.binary.clear();
        self.bytes_used = 0;
    }

    fn bytes_used(&self) -> i64 {
        self.bytes_used
    }
}

/// Serializes stored fields into a byte block pool.
#[derive(Debug, Default)]
pub struct StoredFieldsStage {
    pool: ByteBlockPool,
    /// `(offset, len)` per document; documents without stored fields are `(0, 0)`.
    index: Vec<(usize, usize)>,
}

impl StoredFieldsStage {
    /// Create an empty stage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexingStage for StoredFieldsStage {
    fn name(&self) -> &'static str {
        "stored_fields"
    }

    fn process_field(
        &mut self,
        state: &mut DocumentState,
        field: &Field,
        _info: &FieldInfo,
        _analyzer: &dyn Analyzer,
    ) -> Result<()> {
        if field.stored {
            state.stored.push(StoredField {
                name: field.name.clone(),
                value: field.value.clone(),
            });
        }
        Ok(())
    }

    fn finish_document(&mut self, state: &mut DocumentState) -> Result<()> {
        if state.stored.is_empty() {
            return Ok(());
        }
        let bytes = bincode::serialize(&state.stored)
            .map_err(|e| StrataError::aborting(format!("cannot encode stored fields: {e}")))?;
        let offset = self.pool.append(&bytes);
        let doc = state.doc_id as usize;
        if self.index.len() <= doc {
            self.index.resize(doc + 1, (0, 0));
        }
        self.index[doc] = (offset, bytes.len());
        Ok(())
    }

    fn flush(&mut self, num_docs: u32, segment: &mut SegmentData) -> Result<()> {
        self.index.resize(num_docs as usize, (0, 0));
        let mut stored = Vec::with_capacity(num_docs as usize);
        for &(offset, len) in &self.index {
            if len == 0 {
                stored.push(Vec::new());
                continue;
            }
            let bytes = self.pool.read(offset, len).ok_or_else(|| {
                StrataError::aborting(format!("stored fields at {offset} are out of bounds"))
            })?;
            let fields: Vec<StoredField> = bincode::deserialize(&bytes)
                .map_err(|e| StrataError::aborting(format!("cannot decode stored fields: {e}")))?;
            stored.push(fields);
        }
        segment.stored = stored;
        self.abort();
        Ok(())
    }

    fn abort(&mut self) {
        self.pool.reset();
        self.index.clear();
    }

    fn bytes_used(&self) -> i64 {
        (self.pool.bytes_allocated() + self.index.len() * 16) as i64
    }
}

/// The full chain of one per-thread buffer.
#[derive(Debug)]
pub struct IndexingChain {
    stages: Vec<Box<dyn IndexingStage>>,
    field_infos: FieldInfosBuilder,
    global_field_numbers: Arc<FieldNumbers>,
}

impl IndexingChain {
    /// The default chain: invert, norms, doc values, stored fields.
    pub fn new(global_field_numbers: Arc<FieldNumbers>) -> Self {
        Self::with_stages(
            global_field_numbers,
            vec![
                Box::new(InvertStage::new()),
                Box::new(NormsStage::new()),
                Box::new(DocValuesStage::new()),
                Box::new(StoredFieldsStage::new()),
            ],
        )
    }

    /// A chain with custom stages.
    pub fn with_stages(
        global_field_numbers: Arc<FieldNumbers>,
        stages: Vec<Box<dyn IndexingStage>>,
    ) -> Self {
        IndexingChain {
            stages,
            field_infos: FieldInfosBuilder::new(),
            global_field_numbers,
        }
    }

    /// Run one document through every stage.
    pub fn process_document(
        &mut self,
        doc_id: u32,
        doc: &Document,
        analyzer: &dyn Analyzer,
    ) -> Result<()> {
        let mut state = DocumentState::new(doc_id);
        for field in doc.fields() {
            let info = self
                .field_infos
                .add_or_update(&self.global_field_numbers, &field.name, &field.value, field.stored)?
                .clone();
            for stage in self.stages.iter_mut() {
                stage.process_field(&mut state, field, &info, analyzer)?;
            }
        }
        for stage in self.stages.iter_mut() {
            stage.finish_document(&mut state)?;
        }
        Ok(())
    }

    /// Build the in-memory segment for `num_docs` documents and reset.
    pub fn flush(&mut self, num_docs: u32) -> Result<SegmentData> {
        let mut segment = SegmentData::new(num_docs);
        segment.field_infos = self.field_infos.finish();
        for stage in self.stages.iter_mut() {
            stage.flush(num_docs, &mut segment)?;
        }
        Ok(segment)
    }

    /// Discard everything buffered.
    pub fn abort(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.abort();
        }
        self.field_infos.clear();
    }

    /// Approximate RAM held by all stages.
    pub fn bytes_used(&self) -> i64 {
        self.stages.iter().map(|s| s.bytes_used()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyzer::StandardAnalyzer;

    fn chain() -> IndexingChain {
        IndexingChain::new(Arc::new(FieldNumbers::new()))
    }

    #[test]
    fn test_invert_and_norms() {
        let analyzer = StandardAnalyzer::new();
        let mut chain = chain();
        let doc0 = Document::builder()
            .add_keyword("id", "a")
            .add_text("body", "quick brown fox")
            .build();
        let doc1 = Document::builder()
            .add_keyword("id", "b")
            .add_text("body", "brown")
            .add_text("body", "dog")
            .build();
        chain.process_document(0, &doc0, &analyzer).unwrap();
        chain.process_document(1, &doc1, &analyzer).unwrap();
        assert!(chain.bytes_used() > 0);

        let segment = chain.flush(2).unwrap();
        let body = &segment.postings["body"];
        assert_eq!(body["brown"].len(), 2);
        assert_eq!(body["brown"][0].positions, vec![1]);
        // second value continues positions
        assert_eq!(body["dog"][0].positions, vec![1]);
        assert_eq!(segment.postings["id"]["b"][0].doc, 1);
        assert_eq!(segment.norms["body"], vec![3, 2]);
        assert!(segment.norms.get("id").is_none());
        assert_eq!(chain.bytes_used(), 0);
    }

    #[test]
    fn test_immense_term_is_document_error() {
        let analyzer = StandardAnalyzer::new();
        let mut chain = chain();
        let doc = Document::builder()
            .add_keyword("id", "x".repeat(MAX_TERM_LENGTH + 1))
            .build();
        let err = chain.process_document(0, &doc, &analyzer).unwrap_err();
        assert!(!err.is_aborting());
    }

    #[test]
    fn test_doc_values_padded_and_checked() {
        let analyzer = StandardAnalyzer::new();
        let mut chain = chain();
        let doc = Document::builder().add_numeric("price", 7).build();
        chain.process_document(1, &doc, &analyzer).unwrap();

        let twice = Document::builder()
            .add_numeric("price", 1)
            .add_numeric("price", 2)
            .build();
        assert!(chain.process_document(2, &twice, &analyzer).is_err());

        let conflict = Document::builder().add_binary("price", vec![1]).build();
        let err = chain.process_document(3, &conflict, &analyzer).unwrap_err();
        assert!(!err.is_aborting());

        let segment = chain.flush(4).unwrap();
        let column = &segment.numeric_doc_values["price"];
        assert_eq!(column.len(), 4);
        assert_eq!(column[0], None);
        assert_eq!(column[1], Some(7));
    }

    #[test]
    fn test_stored_fields_round_through_pool() {
        let analyzer = StandardAnalyzer::new();
        let mut chain = chain();
        let doc = Document::builder()
            .add_field(Field::keyword("id", "k").with_stored(true))
            .add_text("body", "not stored")
            .build();
        chain.process_document(2, &doc, &analyzer).unwrap();

        let segment = chain.flush(3).unwrap();
        assert_eq!(segment.stored.len(), 3);
        assert!(segment.stored[0].is_empty());
        assert_eq!(segment.stored[2].len(), 1);
        assert_eq!(segment.stored[2][0].value, FieldValue::Keyword("k".into()));
        assert!(segment.field_infos.get("id").unwrap().stored);
    }

    #[test]
    fn test_abort_discards_everything() {
        let analyzer = StandardAnalyzer::new();
        let mut chain = chain();
        let doc = Document::builder().add_text("body", "hello").build();
        chain.process_document(0, &doc, &analyzer).unwrap();
        chain.abort();

        assert_eq!(chain.bytes_used(), 0);
        let segment = chain.flush(0).unwrap();
        assert!(segment.postings.is_empty());
        assert!(segment.field_infos.is_empty());
    }
}
