//! Doc-values updates: requests to change the doc value of every document
//! matching a term, and the per-segment resolved result of those requests.

use std::collections::BTreeMap;

use crate::index::codec::DocValuesColumns;
use crate::index::field_infos::DocValuesType;
use crate::index::term::Term;

/// New value of a doc-values field. `None` unsets the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocValuesValue {
    /// Numeric value.
    Numeric(Option<i64>),
    /// Binary value.
    Binary(Option<Vec<u8>>),
}

impl DocValuesValue {
    /// The doc-values type this value belongs to.
    pub fn doc_values_type(&self) -> DocValuesType {
        match self {
            DocValuesValue::Numeric(_) => DocValuesType::Numeric,
            DocValuesValue::Binary(_) => DocValuesType::Binary,
        }
    }

    fn bytes_used(&self) -> usize {
        match self {
            DocValuesValue::Numeric(_) => 8,
            DocValuesValue::Binary(v) => v.as_ref().map_or(0, Vec::len),
        }
    }
}

/// Set `field` to `value` on all documents matching `term` below `doc_id_upto`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocValuesUpdate {
    /// Selects the documents to update.
    pub term: Term,
    /// The doc-values field to update.
    pub field: String,
    /// The new value.
    pub value: DocValuesValue,
    /// Only documents with a smaller ID are updated.
    pub doc_id_upto: u32,
}

impl DocValuesUpdate {
    /// A numeric update with an unbounded doc-ID limit.
    pub fn numeric<S: Into<String>>(term: Term, field: S, value: Option<i64>) -> Self {
        DocValuesUpdate {
            term,
            field: field.into(),
            value: DocValuesValue::Numeric(value),
            doc_id_upto: u32::MAX,
        }
    }

    /// A binary update with an unbounded doc-ID limit.
    pub fn binary<S: Into<String>>(term: Term, field: S, value: Option<Vec<u8>>) -> Self {
        DocValuesUpdate {
            term,
            field: field.into(),
            value: DocValuesValue::Binary(value),
            doc_id_upto: u32::MAX,
        }
    }

    /// Approximate heap bytes held by the update.
    pub fn bytes_used(&self) -> usize {
        self.term.bytes_used() + self.field.len() + self.value.bytes_used()
    }
}

/// Resolved doc-values updates of one segment: field to doc to new value.
/// Later additions for the same document win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdates {
    /// Numeric updates by field.
    pub numeric: BTreeMap<String, BTreeMap<u32, Option<i64>>>,
    /// Binary updates by field.
    pub binary: BTreeMap<String, BTreeMap<u32, Option<Vec<u8>>>>,
}

impl FieldUpdates {
    /// Empty updates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new value for one document.
    pub fn add(&mut self, field: &str, doc: u32, value: &DocValuesValue) {
        match value {
            DocValuesValue::Numeric(v) => {
                self.numeric
                    .entry(field.to_string())
                    .or_default()
                    .insert(doc, *v);
            }
            DocValuesValue::Binary(v) => {
                self.binary
                    .entry(field.to_string())
                    .or_default()
                    .insert(doc, v.clone());
            }
        }
    }

    /// Whether any update is recorded.
    pub fn any(&self) -> bool {
        self.numeric.values().any(|m| !m.is_empty()) || self.binary.values().any(|m| !m.is_empty())
    }

    /// Fold in newer updates; they win over existing ones.
    pub fn merge(&mut self, newer: &FieldUpdates) {
        for (field, docs) in &newer.numeric {
            let target = self.numeric.entry(field.clone()).or_default();
            target.extend(docs.iter().map(|(d, v)| (*d, *v)));
        }
        for (field, docs) in &newer.binary {
            let target = self.binary.entry(field.clone()).or_default();
            target.extend(docs.iter().map(|(d, v)| (*d, v.clone())));
        }
    }

    /// Names of the updated fields.
    pub fn fields(&self) -> Vec<String> {
        self.numeric.keys().chain(self.binary.keys()).cloned().collect()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.numeric.clear();
        self.binary.clear();
    }

    /// Build full replacement columns for the updated fields, starting
    /// from the current columns of a segment with `max_doc` documents.
    pub fn apply_to(&self, current: &DocValuesColumns, max_doc: u32) -> DocValuesColumns {
        let mut out = DocValuesColumns::default();
        for (field, docs) in &self.numeric {
            let mut column = current
                .numeric
                .get(field)
                .cloned()
                .unwrap_or_else(|| vec![None; max_doc as usize]);
            column.resize(max_doc as usize, None);
            for (&doc, value) in docs {
                if let Some(slot) = column.get_mut(doc as usize) {
                    *slot = *value;
                }
            }
            out.numeric.insert(field.clone(), column);
        }
        for (field, docs) in &self.binary {
            let mut column = current
                .binary
                .get(field)
                .cloned()
                .unwrap_or_else(|| vec![None; max_doc as usize]);
            column.resize(max_doc as usize, None);
            for (&doc, value) in docs {
                if let Some(slot) = column.get_mut(doc as usize) {
                    *slot = value.clone();
                }
            }
            out.binary.insert(field.clone(), column);
        }
        out
    }
}
