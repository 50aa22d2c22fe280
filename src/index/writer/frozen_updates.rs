//! Immutable, generation-tagged packets of deletes and updates.

use std::sync::OnceLock;

use crate::index::query::Query;
use crate::index::term::Term;
use crate::index::writer::buffered_updates::BufferedUpdates;
use crate::index::writer::doc_values_updates::DocValuesUpdate;

/// A frozen snapshot of a [`BufferedUpdates`].
///
/// Global packets come from the shared delete queue and apply to every
/// segment older than the packet. Segment-private packets carry what a
/// flushed segment could not resolve itself (query deletes and doc-values
/// updates) and apply to that one segment only.
#[derive(Debug)]
pub struct FrozenBufferedUpdates {
    terms: Vec<Term>,
    queries: Vec<(Query, u32)>,
    numeric_updates: Vec<DocValuesUpdate>,
    binary_updates: Vec<DocValuesUpdate>,
    num_term_deletes: usize,
    bytes_used: i64,
    private_segment: Option<String>,
    gen: OnceLock<u64>,
}

impl FrozenBufferedUpdates {
    /// Freeze a buffer. Term deletes are sorted by field then text.
    pub fn new(updates: &BufferedUpdates, private_segment: Option<String>) -> Self {
        debug_assert!(
            private_segment.is_none() || updates.terms().is_empty(),
            "segment-private packets must not carry term deletes"
        );
        let terms: Vec<Term> = updates.terms().keys().cloned().collect();
        let mut queries: Vec<(Query, u32)> = updates
            .queries()
            .iter()
            .map(|(q, upto)| (q.clone(), *upto))
            .collect();
        queries.sort_by_key(|(_, upto)| *upto);

        let numeric_updates = updates.numeric_updates();
        let binary_updates = updates.binary_updates();

        let bytes_used = terms.iter().map(|t| t.bytes_used() as i64).sum::<i64>()
            + queries.iter().map(|(q, _)| q.bytes_used() as i64 + 4).sum::<i64>()
            + numeric_updates
                .iter()
                .chain(&binary_updates)
                .map(|u| u.bytes_used() as i64)
                .sum::<i64>();

        FrozenBufferedUpdates {
            terms,
            queries,
            numeric_updates,
            binary_updates,
            num_term_deletes: updates.num_term_deletes(),
            bytes_used,
            private_segment,
            gen: OnceLock::new(),
        }
    }

    /// Term deletes, sorted.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Query deletes with their doc-ID limits.
    pub fn queries(&self) -> &[(Query, u32)] {
        &self.queries
    }

    /// Numeric doc-values updates in arrival order.
    pub fn numeric_updates(&self) -> &[DocValuesUpdate] {
        &self.numeric_updates
    }

    /// Binary doc-values updates in arrival order.
    pub fn binary_updates(&self) -> &[DocValuesUpdate] {
        &self.binary_updates
    }

    /// Number of term deletes buffered, repeats included.
    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    /// Approximate RAM held.
    pub fn bytes_used(&self) -> i64 {
        self.bytes_used
    }

    /// Name of the owning segment for a private packet.
    pub fn private_segment(&self) -> Option<&str> {
        self.private_segment.as_deref()
    }

    /// Whether the packet belongs to a single flushed segment.
    pub fn is_segment_private(&self) -> bool {
        self.private_segment.is_some()
    }

    /// Whether the packet carries anything.
    pub fn any(&self) -> bool {
        !self.terms.is_empty()
            || !self.queries.is_empty()
            || !self.numeric_updates.is_empty()
            || !self.binary_updates.is_empty()
    }

    /// Whether the packet carries doc-values updates.
    pub fn any_doc_values_updates(&self) -> bool {
        !self.numeric_updates.is_empty() || !self.binary_updates.is_empty()
    }

    /// Generation assigned when the packet was pushed, 0 before.
    pub fn gen(&self) -> u64 {
        self.gen.get().copied().unwrap_or(0)
    }

    /// Assign the generation. A packet is pushed exactly once.
    pub fn set_gen(&self, gen: u64) {
        let assigned = self.gen.set(gen);
        debug_assert!(assigned.is_ok(), "packet generation assigned twice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freeze_sorts_terms() {
        let mut buffer = BufferedUpdates::new();
        buffer.add_term(Term::new("title", "b"), u32::MAX);
        buffer.add_term(Term::new("body", "z"), u32::MAX);
        buffer.add_term(Term::new("body", "a"), u32::MAX);
        buffer.add_query(Query::MatchAll, u32::MAX);

        let packet = FrozenBufferedUpdates::new(&buffer, None);
        assert_eq!(
            packet.terms(),
            &[
                Term::new("body", "a"),
                Term::new("body", "z"),
                Term::new("title", "b")
            ]
        );
        assert_eq!(packet.queries().len(), 1);
        assert!(packet.any());
        assert!(!packet.is_segment_private());
        assert_eq!(packet.gen(), 0);

        packet.set_gen(4);
        assert_eq!(packet.gen(), 4);
    }

    #[test]
    fn test_private_packet() {
        let mut buffer = BufferedUpdates::new();
        buffer.add_update(
            DocValuesUpdate::numeric(Term::new("id", "1"), "price", Some(3)),
            2,
        );
        let packet = FrozenBufferedUpdates::new(&buffer, Some("_2".into()));
        assert!(packet.is_segment_private());
        assert_eq!(packet.private_segment(), Some("_2"));
        assert!(packet.any_doc_values_updates());
        assert_eq!(packet.numeric_updates()[0].doc_id_upto, 2);
    }
}
