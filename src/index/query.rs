//! Queries used to select documents for deletion and lookup.
//!
//! These are matchers, not scorers: a query resolves to the sorted list of
//! document IDs it matches inside one segment.

use serde::{Deserialize, Serialize};

use crate::index::reader::SegmentReader;
use crate::index::term::Term;

/// A document selector evaluated per segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Query {
    /// Documents containing the term.
    Term(Term),

    /// Documents containing any of the terms.
    AnyTerm(Vec<Term>),

    /// Documents whose numeric doc value lies within the inclusive range.
    /// Documents without a value never match.
    NumericRange {
        /// Doc-values field.
        field: String,
        /// Lower bound, unbounded if `None`.
        min: Option<i64>,
        /// Upper bound, unbounded if `None`.
        max: Option<i64>,
    },

    /// Every document.
    MatchAll,
}

impl Query {
    /// A single-term query.
    pub fn term<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Query::Term(Term::new(field, text))
    }

    /// An inclusive numeric range query.
    pub fn numeric_range<F: Into<String>>(field: F, min: Option<i64>, max: Option<i64>) -> Self {
        Query::NumericRange {
            field: field.into(),
            min,
            max,
        }
    }

    /// Sorted, de-duplicated IDs of the matching documents, deleted or not.
    pub fn matching_docs(&self, reader: &SegmentReader) -> Vec<u32> {
        match self {
            Query::Term(term) => reader.postings(term).iter().map(|p| p.doc).collect(),
            Query::AnyTerm(terms) => {
                let mut docs: Vec<u32> = terms
                    .iter()
                    .flat_map(|t| reader.postings(t).iter().map(|p| p.doc))
                    .collect();
                docs.sort_unstable();
                docs.dedup();
                docs
            }
            Query::NumericRange { field, min, max } => (0..reader.max_doc())
                .filter(|&doc| match reader.numeric_value(field, doc) {
                    Some(v) => min.is_none_or(|lo| v >= lo) && max.is_none_or(|hi| v <= hi),
                    None => false,
                })
                .collect(),
            Query::MatchAll => (0..reader.max_doc()).collect(),
        }
    }

    /// Approximate heap bytes held by the query.
    pub fn bytes_used(&self) -> usize {
        let base = std::mem::size_of::<Query>();
        match self {
            Query::Term(term) => base + term.bytes_used(),
            Query::AnyTerm(terms) => base + terms.iter().map(Term::bytes_used).sum::<usize>(),
            Query::NumericRange { field, .. } => base + field.len(),
            Query::MatchAll => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::index::codec::{Posting, SegmentData};
    use crate::index::segment::{SegmentCommitInfo, SegmentInfo};

    fn reader() -> SegmentReader {
        let mut data = SegmentData::new(4);
        let mut terms = BTreeMap::new();
        terms.insert(
            "red".to_string(),
            vec![Posting::new(0, vec![0]), Posting::new(2, vec![1])],
        );
        terms.insert("blue".to_string(), vec![Posting::new(1, vec![0])]);
        data.postings.insert("color".to_string(), terms);
        data.numeric_doc_values
            .insert("price".to_string(), vec![Some(5), Some(15), None, Some(25)]);

        let info = Arc::new(SegmentCommitInfo::new(SegmentInfo::new("_0", 4, "default")));
        SegmentReader::from_data(info, Arc::new(data))
    }

    #[test]
    fn test_term_queries() {
        let reader = reader();
        assert_eq!(Query::term("color", "red").matching_docs(&reader), vec![0, 2]);
        assert!(Query::term("color", "green").matching_docs(&reader).is_empty());

        let any = Query::AnyTerm(vec![Term::new("color", "red"), Term::new("color", "blue")]);
        assert_eq!(any.matching_docs(&reader), vec![0, 1, 2]);
    }

    #[test]
    fn test_numeric_range() {
        let reader = reader();
        let query = Query::numeric_range("price", Some(10), None);
        assert_eq!(query.matching_docs(&reader), vec![1, 3]);

        let query = Query::numeric_range("price", None, Some(15));
        assert_eq!(query.matching_docs(&reader), vec![0, 1]);
    }

    #[test]
    fn test_match_all() {
        assert_eq!(Query::MatchAll.matching_docs(&reader()), vec![0, 1, 2, 3]);
    }
}
