//! Deletes and doc-values updates buffered in RAM before they are frozen.
//!
//! Every entry carries a doc-ID limit: it only affects documents whose ID
//! is smaller than the limit, i.e. documents that were added before the
//! delete arrived. Global buffers use `u32::MAX` as the limit.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::index::query::Query;
use crate::index::term::Term;
use crate::index::writer::doc_values_updates::{DocValuesUpdate, DocValuesValue};
use crate::index::writer::ram::{
    BYTES_PER_DEL_DOCID, BYTES_PER_DEL_QUERY, BYTES_PER_DEL_TERM, BYTES_PER_DV_UPDATE,
};

/// Doc-ID limit that admits every document.
pub const MAX_DOC_ID_UPTO: u32 = u32::MAX;

/// Pending deletes and updates of one buffer.
#[derive(Debug, Default)]
pub struct BufferedUpdates {
    terms: BTreeMap<Term, u32>,
    queries: AHashMap<Query, u32>,
    doc_ids: Vec<u32>,
    updates: Vec<Option<DocValuesUpdate>>,
    update_index: AHashMap<(String, Term), usize>,
    num_updates: usize,
    num_term_deletes: usize,
    bytes_used: i64,
}

impl BufferedUpdates {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a term delete. A repeated term keeps the larger limit.
    pub fn add_term(&mut self, term: Term, doc_id_upto: u32) {
        let current = self.terms.get(&term).copied();
        if let Some(current) = current {
            if doc_id_upto < current {
                return;
            }
        }
        if current.is_none() {
            self.bytes_used += BYTES_PER_DEL_TERM + term.bytes_used() as i64;
        }
        self.terms.insert(term, doc_id_upto);
        self.num_term_deletes += 1;
    }

    /// Buffer a query delete. A repeated query takes the new limit.
    pub fn add_query(&mut self, query: Query, doc_id_upto: u32) {
        let bytes = query.bytes_used() as i64;
        if self.queries.insert(query, doc_id_upto).is_none() {
            self.bytes_used += BYTES_PER_DEL_QUERY + bytes;
        }
    }

    /// Buffer a delete of one document of this buffer.
    pub fn add_doc_id(&mut self, doc: u32) {
        self.doc_ids.push(doc);
        self.bytes_used += BYTES_PER_DEL_DOCID;
    }

    /// Buffer a doc-values update.
    ///
    /// A later update of the same field and term replaces the earlier one
    /// and moves to the end of the arrival order, unless its limit is smaller.
    pub fn add_update(&mut self, mut update: DocValuesUpdate, doc_id_upto: u32) {
        let key = (update.field.clone(), update.term.clone());
        if let Some(&idx) = self.update_index.get(&key) {
            if let Some(existing) = &self.updates[idx] {
                if doc_id_upto < existing.doc_id_upto {
                    return;
                }
            }
            self.updates[idx] = None;
            self.num_updates -= 1;
        } else {
            self.bytes_used += BYTES_PER_DV_UPDATE + update.bytes_used() as i64;
        }
        update.doc_id_upto = doc_id_upto;
        self.update_index.insert(key, self.updates.len());
        self.updates.push(Some(update));
        self.num_updates += 1;
    }

    /// Buffered term deletes with their limits, sorted by term.
    pub fn terms(&self) -> &BTreeMap<Term, u32> {
        &self.terms
    }

    /// Buffered query deletes with their limits.
    pub fn queries(&self) -> &AHashMap<Query, u32> {
        &self.queries
    }

    /// Buffered doc-ID deletes.
    pub fn doc_ids(&self) -> &[u32] {
        &self.doc_ids
    }

    /// Buffered doc-values updates in arrival order.
    pub fn updates(&self) -> impl Iterator<Item = &DocValuesUpdate> {
        self.updates.iter().flatten()
    }

    /// Numeric updates in arrival order.
    pub fn numeric_updates(&self) -> Vec<DocValuesUpdate> {
        self.updates()
            .filter(|u| matches!(u.value, DocValuesValue::Numeric(_)))
            .cloned()
            .collect()
    }

    /// Binary updates in arrival order.
    pub fn binary_updates(&self) -> Vec<DocValuesUpdate> {
        self.updates()
            .filter(|u| matches!(u.value, DocValuesValue::Binary(_)))
            .cloned()
            .collect()
    }

    /// Number of live doc-values updates.
    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    /// Number of term deletes added, repeats included.
    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    /// Approximate RAM held.
    pub fn bytes_used(&self) -> i64 {
        self.bytes_used
    }

    /// Whether anything is buffered.
    pub fn any(&self) -> bool {
        !self.terms.is_empty()
            || !self.queries.is_empty()
            || !self.doc_ids.is_empty()
            || self.num_updates > 0
    }

    /// Drop term deletes, e.g. after they were applied to in-RAM postings.
    pub fn clear_terms(&mut self) {
        for term in self.terms.keys() {
            self.bytes_used -= BYTES_PER_DEL_TERM + term.bytes_used() as i64;
        }
        self.terms.clear();
        self.num_term_deletes = 0;
    }

    /// Remove and return the doc-ID deletes.
    pub fn take_doc_ids(&mut self) -> Vec<u32> {
        self.bytes_used -= BYTES_PER_DEL_DOCID * self.doc_ids.len() as i64;
        std::mem::take(&mut self.doc_ids)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.terms.clear();
        self.queries.clear();
        self.doc_ids.clear();
        self.updates.clear();
        self.update_index.clear();
        self.num_updates = 0;
        self.num_term_deletes = 0;
        self.bytes_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_keeps_larger_limit() {
        let mut buffer = BufferedUpdates::new();
        buffer.add_term(Term::new("id", "1"), 5);
        buffer.add_term(Term::new("id", "1"), 3);
        assert_eq!(buffer.terms()[&Term::new("id", "1")], 5);

        buffer.add_term(Term::new("id", "1"), 9);
        assert_eq!(buffer.terms()[&Term::new("id", "1")], 9);
        assert_eq!(buffer.num_term_deletes(), 2);
    }

    #[test]
    fn test_bytes_follow_contents() {
        let mut buffer = BufferedUpdates::new();
        assert!(!buffer.any());

        buffer.add_term(Term::new("id", "1"), 1);
        buffer.add_doc_id(0);
        buffer.add_query(Query::MatchAll, 2);
        assert!(buffer.bytes_used() > 0);
        assert!(buffer.any());

        buffer.clear_terms();
        assert_eq!(buffer.take_doc_ids(), vec![0]);
        assert_eq!(
            buffer.bytes_used(),
            BYTES_PER_DEL_QUERY + Query::MatchAll.bytes_used() as i64
        );

        buffer.clear();
        assert_eq!(buffer.bytes_used(), 0);
        assert!(!buffer.any());
    }

    #[test]
    fn test_repeated_update_moves_to_end() {
        let mut buffer = BufferedUpdates::new();
        let term = Term::new("id", "1");
        buffer.add_update(DocValuesUpdate::numeric(term.clone(), "price", Some(1)), 4);
        buffer.add_update(
            DocValuesUpdate::numeric(Term::new("id", "2"), "price", Some(2)),
            4,
        );
        buffer.add_update(DocValuesUpdate::numeric(term, "price", Some(3)), 6);

        let updates = buffer.numeric_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].value, DocValuesValue::Numeric(Some(3)));
        assert_eq!(updates[1].doc_id_upto, 6);
        assert!(buffer.binary_updates().is_empty());
    }
}
