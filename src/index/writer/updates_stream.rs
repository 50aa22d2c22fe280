//! The generation-ordered history of frozen delete and update packets.
//!
//! Every packet gets a unique, increasing generation when it is pushed.
//! Every segment records the generation of the newest packet already
//! applied to it. Resolving walks segments and packets newest-first: a
//! packet newer than a segment applies to it and to every older segment;
//! a segment-private packet applies only to the segment flushed with it.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Instant;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::Result;
use crate::index::reader::SegmentReader;
use crate::index::segment::{SegmentCommitInfo, SegmentInfos};
use crate::index::writer::buffered_updates::MAX_DOC_ID_UPTO;
use crate::index::writer::doc_values_updates::{DocValuesUpdate, FieldUpdates};
use crate::index::writer::frozen_updates::FrozenBufferedUpdates;
use crate::index::writer::readers_pool::{ReaderPool, ReadersAndUpdates};

/// Outcome of resolving buffered packets against the live segments.
#[derive(Debug, Default)]
pub struct ApplyDeletesResult {
    /// Whether any document was newly deleted or updated.
    pub any_deletes: bool,
    /// Newest generation pushed when resolution ran.
    pub gen: u64,
    /// Segments whose every document is now deleted.
    pub all_deleted: Vec<Arc<SegmentCommitInfo>>,
}

/// A segment as seen by the planner.
#[derive(Debug, Clone, Copy)]
pub struct PlanSegment<'a> {
    /// Segment name.
    pub name: &'a str,
    /// Newest packet generation already applied.
    pub gen: u64,
}

/// A packet as seen by the planner.
#[derive(Debug, Clone, Copy)]
pub struct PlanPacket<'a> {
    /// Packet generation.
    pub gen: u64,
    /// Owning segment of a private packet.
    pub private_segment: Option<&'a str>,
}

/// One step of a resolution plan. Indices refer to the planner's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStep {
    /// Add a global packet to the accumulator applied to older segments.
    Coalesce(usize),
    /// Apply a private packet and the accumulator to its own segment.
    ApplyPrivate {
        /// Segment index.
        segment: usize,
        /// Packet index.
        packet: usize,
    },
    /// Apply the accumulator to a segment.
    ApplyCoalesced {
        /// Segment index.
        segment: usize,
    },
}

/// Plan a resolution.
///
/// `segments` must be sorted by `(gen, name)` and `packets` by generation,
/// both ascending; the plan walks both newest-first. A packet newer than the
/// current segment is coalesced (private packets are skipped). A private
/// packet with the segment's own generation is applied to that segment
/// alone. Anything else leaves the packet cursor in place and applies the
/// accumulator to the segment, so an equal-generation packet that is not
/// private to the segment is coalesced for the older segments.
pub fn plan(segments: &[PlanSegment<'_>], packets: &[PlanPacket<'_>]) -> Vec<PlanStep> {
    let mut steps = Vec::with_capacity(segments.len() + packets.len());
    let mut seg_idx = segments.len();
    let mut packet_idx = packets.len();

    while seg_idx > 0 {
        let segment = &segments[seg_idx - 1];
        let packet = packet_idx.checked_sub(1).map(|i| (i, &packets[i]));
        match packet {
            Some((i, packet)) if packet.gen > segment.gen => {
                if packet.private_segment.is_none() {
                    steps.push(PlanStep::Coalesce(i));
                }
                packet_idx -= 1;
            }
            Some((i, packet))
                if packet.gen == segment.gen && packet.private_segment == Some(segment.name) =>
            {
                steps.push(PlanStep::ApplyPrivate {
                    segment: seg_idx - 1,
                    packet: i,
                });
                packet_idx -= 1;
                seg_idx -= 1;
            }
            _ => {
                steps.push(PlanStep::ApplyCoalesced {
                    segment: seg_idx - 1,
                });
                seg_idx -= 1;
            }
        }
    }
    steps
}

#[derive(Debug)]
struct StreamState {
    updates: Vec<Arc<FrozenBufferedUpdates>>,
    next_gen: u64,
}

/// Thread-safe history of frozen packets.
#[derive(Debug)]
pub struct BufferedUpdatesStream {
    state: Mutex<StreamState>,
    bytes_used: AtomicI64,
    num_terms: AtomicUsize,
}

impl Default for BufferedUpdatesStream {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedUpdatesStream {
    /// Create an empty stream. The first generation handed out is 1.
    pub fn new() -> Self {
        BufferedUpdatesStream {
            state: Mutex::new(StreamState {
                updates: Vec::new(),
                next_gen: 1,
            }),
            bytes_used: AtomicI64::new(0),
            num_terms: AtomicUsize::new(0),
        }
    }

    /// Append a packet and return the generation it was assigned.
    pub fn push(&self, packet: Arc<FrozenBufferedUpdates>) -> u64 {
        let mut state = self.state.lock();
        let gen = state.next_gen;
        state.next_gen += 1;
        packet.set_gen(gen);
        debug_assert!(packet.any(), "empty packets are never pushed");
        debug_assert!(
            state.updates.last().is_none_or(|last| last.gen() < gen),
            "packet generations must increase"
        );
        self.bytes_used
            .fetch_add(packet.bytes_used(), Ordering::AcqRel);
        self.num_terms
            .fetch_add(packet.num_term_deletes(), Ordering::AcqRel);
        trace!(
            "push packet gen={gen} private={:?} terms={} bytes={}",
            packet.private_segment(),
            packet.num_term_deletes(),
            packet.bytes_used()
        );
        state.updates.push(packet);
        gen
    }

    /// A fresh generation for a flushed segment without a private packet.
    pub fn get_next_gen(&self) -> u64 {
        let mut state = self.state.lock();
        let gen = state.next_gen;
        state.next_gen += 1;
        gen
    }

    /// Drop every packet. Generations keep increasing.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.updates.clear();
        self.bytes_used.store(0, Ordering::Release);
        self.num_terms.store(0, Ordering::Release);
    }

    /// Whether any packet is buffered.
    pub fn any(&self) -> bool {
        self.bytes_used.load(Ordering::Acquire) != 0 || !self.state.lock().updates.is_empty()
    }

    /// Number of packets buffered.
    pub fn num_packets(&self) -> usize {
        self.state.lock().updates.len()
    }

    /// Term deletes buffered across packets.
    pub fn num_terms(&self) -> usize {
        self.num_terms.load(Ordering::Acquire)
    }

    /// Approximate RAM held by buffered packets.
    pub fn bytes_used(&self) -> i64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    /// Resolve every buffered packet against `infos`.
    ///
    /// Each segment touched ends with a buffered-deletes generation of at
    /// least the returned `gen`. Applied private packets leave the stream.
    pub fn apply_deletes_and_updates(
        &self,
        pool: &ReaderPool,
        infos: &[Arc<SegmentCommitInfo>],
    ) -> Result<ApplyDeletesResult> {
        let mut state = self.state.lock();
        let gen = state.next_gen - 1;
        if infos.is_empty() || state.updates.is_empty() {
            return Ok(ApplyDeletesResult {
                gen,
                ..Default::default()
            });
        }
        let start = Instant::now();

        let mut sorted: Vec<Arc<SegmentCommitInfo>> = infos.to_vec();
        sorted.sort_by(|a, b| {
            a.buffered_deletes_gen()
                .cmp(&b.buffered_deletes_gen())
                .then_with(|| a.name().cmp(b.name()))
        });
        let steps = {
            let plan_segments: Vec<PlanSegment<'_>> = sorted
                .iter()
                .map(|s| PlanSegment {
                    name: s.name(),
                    gen: s.buffered_deletes_gen(),
                })
                .collect();
            let plan_packets: Vec<PlanPacket<'_>> = state
                .updates
                .iter()
                .map(|p| PlanPacket {
                    gen: p.gen(),
                    private_segment: p.private_segment(),
                })
                .collect();
            plan(&plan_segments, &plan_packets)
        };

        // newest first, as coalesced
        let mut coalesced: Vec<Arc<FrozenBufferedUpdates>> = Vec::new();
        let mut applied_private = Vec::new();
        let mut result = ApplyDeletesResult {
            gen,
            ..Default::default()
        };

        for step in steps {
            match step {
                PlanStep::Coalesce(i) => coalesced.push(Arc::clone(&state.updates[i])),
                PlanStep::ApplyPrivate { segment, packet } => {
                    let info = &sorted[segment];
                    let private = &state.updates[packet];
                    let outcome = apply_to_segment(pool, info, Some(private), &coalesced)?;
                    result.any_deletes |= outcome.changed;
                    if outcome.all_deleted {
                        result.all_deleted.push(Arc::clone(info));
                    }
                    info.set_buffered_deletes_gen(info.buffered_deletes_gen().max(gen));
                    applied_private.push(packet);
                }
                PlanStep::ApplyCoalesced { segment } => {
                    let info = &sorted[segment];
                    if !coalesced.is_empty() {
                        let outcome = apply_to_segment(pool, info, None, &coalesced)?;
                        result.any_deletes |= outcome.changed;
                        if outcome.all_deleted {
                            result.all_deleted.push(Arc::clone(info));
                        }
                    }
                    info.set_buffered_deletes_gen(info.buffered_deletes_gen().max(gen));
                }
            }
        }

        applied_private.sort_unstable();
        for idx in applied_private.into_iter().rev() {
            let packet = state.updates.remove(idx);
            self.release_packet(&packet);
        }

        debug!(
            "applied deletes to {} segments in {:?}: gen={gen} any_deletes={} all_deleted={}",
            sorted.len(),
            start.elapsed(),
            result.any_deletes,
            result.all_deleted.len()
        );
        Ok(result)
    }

    /// Drop packets no live segment still needs.
    ///
    /// A global packet is kept while some segment is older than it. A
    /// private packet is kept only while its segment is live and has not
    /// seen it yet.
    pub fn prune(&self, infos: &SegmentInfos) {
        let mut state = self.state.lock();
        let min_gen = infos
            .iter()
            .map(|s| s.buffered_deletes_gen())
            .min()
            .unwrap_or(u64::MAX);
        let before = state.updates.len();
        let mut dropped = Vec::new();
        state.updates.retain(|packet| {
            let keep = match packet.private_segment() {
                Some(owner) => infos
                    .get(owner)
                    .is_some_and(|s| s.buffered_deletes_gen() == packet.gen()),
                None => packet.gen() > min_gen,
            };
            if !keep {
                dropped.push(Arc::clone(packet));
            }
            keep
        });
        for packet in &dropped {
            self.release_packet(packet);
        }
        if before != state.updates.len() {
            debug!(
                "pruned {} packets, {} left (min segment gen {min_gen})",
                before - state.updates.len(),
                state.updates.len()
            );
        }
    }

    fn release_packet(&self, packet: &FrozenBufferedUpdates) {
        self.bytes_used
            .fetch_sub(packet.bytes_used(), Ordering::AcqRel);
        self.num_terms
            .fetch_sub(packet.num_term_deletes(), Ordering::AcqRel);
    }
}

struct SegmentOutcome {
    changed: bool,
    all_deleted: bool,
}

fn apply_to_segment(
    pool: &ReaderPool,
    info: &Arc<SegmentCommitInfo>,
    private: Option<&Arc<FrozenBufferedUpdates>>,
    coalesced: &[Arc<FrozenBufferedUpdates>],
) -> Result<SegmentOutcome> {
    let Some(rld) = pool.get(info, true) else {
        return Ok(SegmentOutcome {
            changed: false,
            all_deleted: false,
        });
    };
    let outcome = apply_with_entry(&rld, private, coalesced);
    let wrote = pool.release(rld);
    let outcome = outcome?;
    wrote?;
    Ok(outcome)
}

fn apply_with_entry(
    rld: &ReadersAndUpdates,
    private: Option<&Arc<FrozenBufferedUpdates>>,
    coalesced: &[Arc<FrozenBufferedUpdates>],
) -> Result<SegmentOutcome> {
    let reader = rld.reader()?;
    rld.init_writable_live_docs()?;

    let mut del_count = 0;
    for packet in coalesced {
        del_count += apply_term_deletes(packet, rld, &reader);
        del_count += apply_query_deletes(packet, rld, &reader, true);
    }
    if let Some(private) = private {
        del_count += apply_query_deletes(private, rld, &reader, false);
    }

    let mut field_updates = FieldUpdates::new();
    if let Some(private) = private {
        collect_doc_values_updates(private, &reader, &mut field_updates, false);
    }
    for packet in coalesced.iter().rev() {
        collect_doc_values_updates(packet, &reader, &mut field_updates, true);
    }
    let any_updates = field_updates.any();
    if any_updates {
        rld.write_field_updates(&field_updates)?;
    }

    let all_deleted = rld.num_deleted_docs() == rld.info().max_doc();
    if del_count > 0 {
        trace!("{}: {del_count} new deletes", rld.info().name());
    }
    Ok(SegmentOutcome {
        changed: del_count > 0 || any_updates,
        all_deleted,
    })
}

fn apply_term_deletes(packet: &FrozenBufferedUpdates, rld: &ReadersAndUpdates, reader: &SegmentReader) -> u32 {
    let mut count = 0;
    let mut current_field: Option<&str> = None;
    let mut field_terms = None;
    for term in packet.terms() {
        if current_field != Some(term.field.as_str()) {
            current_field = Some(term.field.as_str());
            field_terms = reader.terms(&term.field);
        }
        let Some(postings) = field_terms.and_then(|terms| terms.get(&term.text)) else {
            continue;
        };
        for posting in postings {
            if rld.delete(posting.doc) {
                count += 1;
            }
        }
    }
    count
}

fn apply_query_deletes(
    packet: &FrozenBufferedUpdates,
    rld: &ReadersAndUpdates,
    reader: &SegmentReader,
    unbounded: bool,
) -> u32 {
    let mut count = 0;
    for (query, upto) in packet.queries() {
        let limit = if unbounded { MAX_DOC_ID_UPTO } else { *upto };
        for doc in query.matching_docs(reader) {
            if doc >= limit {
                break;
            }
            if rld.delete(doc) {
                count += 1;
            }
        }
    }
    count
}

fn collect_doc_values_updates(
    packet: &FrozenBufferedUpdates,
    reader: &SegmentReader,
    out: &mut FieldUpdates,
    unbounded: bool,
) {
    let mut apply = |update: &DocValuesUpdate| {
        let limit = if unbounded { MAX_DOC_ID_UPTO } else { update.doc_id_upto };
        for posting in reader.postings(&update.term) {
            if posting.doc >= limit {
                break;
            }
            out.add(&update.field, posting.doc, &update.value);
        }
    };
    packet.numeric_updates().iter().for_each(&mut apply);
    packet.binary_updates().iter().for_each(&mut apply);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;

    use super::*;
    use crate::index::codec::{Codec, DefaultCodec, Posting, SegmentData};
    use crate::index::query::Query;
    use crate::index::segment::SegmentInfo;
    use crate::index::term::Term;
    use crate::index::writer::buffered_updates::BufferedUpdates;
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;

    fn seg(name: &str, gen: u64) -> PlanSegment<'_> {
        PlanSegment { name, gen }
    }

    fn global(gen: u64) -> PlanPacket<'static> {
        PlanPacket {
            gen,
            private_segment: None,
        }
    }

    #[test]
    fn test_plan_coalesces_newer_packets() {
        let segments = [seg("_0", 4)];
        let packets = [global(5), global(7)];
        assert_eq!(
            plan(&segments, &packets),
            vec![
                PlanStep::Coalesce(1),
                PlanStep::Coalesce(0),
                PlanStep::ApplyCoalesced { segment: 0 }
            ]
        );
    }

    #[test]
    fn test_plan_private_packet_only_hits_its_segment() {
        let segments = [seg("_0", 1), seg("_1", 2)];
        let packets = [PlanPacket {
            gen: 2,
            private_segment: Some("_1"),
        }];
        assert_eq!(
            plan(&segments, &packets),
            vec![
                PlanStep::ApplyPrivate {
                    segment: 1,
                    packet: 0
                },
                PlanStep::ApplyCoalesced { segment: 0 }
            ]
        );
    }

    #[test]
    fn test_plan_equal_gen_global_packet_applies_to_older_segments() {
        let segments = [seg("_0", 1), seg("_1", 3)];
        let packets = [global(3)];
        assert_eq!(
            plan(&segments, &packets),
            vec![
                PlanStep::ApplyCoalesced { segment: 1 },
                PlanStep::Coalesce(0),
                PlanStep::ApplyCoalesced { segment: 0 }
            ]
        );
    }

    fn packet(terms: &[&str]) -> Arc<FrozenBufferedUpdates> {
        let mut buffered = BufferedUpdates::new();
        for text in terms {
            buffered.add_term(Term::new("id", *text), MAX_DOC_ID_UPTO);
        }
        Arc::new(FrozenBufferedUpdates::new(&buffered, None))
    }

    #[test]
    fn test_generations_increase_under_concurrent_push() {
        let stream = Arc::new(BufferedUpdatesStream::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let stream = Arc::clone(&stream);
                thread::spawn(move || {
                    (0..50)
                        .map(|i| stream.push(packet(&[format!("{t}-{i}").as_str()])))
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        let mut all = Vec::new();
        for handle in handles {
            let gens = handle.join().unwrap();
            assert!(gens.windows(2).all(|w| w[0] < w[1]));
            all.extend(gens);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert_eq!(stream.num_terms(), 200);
        assert_eq!(stream.get_next_gen(), 201);
    }

    fn segment_with_ids(storage: &Arc<dyn Storage>, codec: &Arc<dyn Codec>, name: &str, ids: &[&str]) -> Arc<SegmentCommitInfo> {
        let mut data = SegmentData::new(ids.len() as u32);
        let mut postings = BTreeMap::new();
        for (doc, id) in ids.iter().enumerate() {
            postings.insert(id.to_string(), vec![Posting::new(doc as u32, vec![0])]);
        }
        data.postings.insert("id".into(), postings);
        data.numeric_doc_values
            .insert("n".into(), vec![Some(0); ids.len()]);
        let mut info = SegmentInfo::new(name, ids.len() as u32, codec.name());
        info.files = codec.write_segment(storage.as_ref(), name, &data).unwrap();
        Arc::new(SegmentCommitInfo::new(info))
    }

    fn setup() -> (Arc<dyn Storage>, Arc<dyn Codec>) {
        (Arc::new(MemoryStorage::new()), Arc::new(DefaultCodec::new()))
    }

    #[test]
    fn test_packets_newer_than_segment_are_applied() {
        let (storage, codec) = setup();
        let pool = ReaderPool::new(Arc::clone(&storage), Arc::clone(&codec), true);
        let stream = BufferedUpdatesStream::new();

        let info = segment_with_ids(&storage, &codec, "_0", &["a", "b", "c"]);
        for _ in 0..4 {
            stream.get_next_gen();
        }
        info.set_buffered_deletes_gen(4);
        assert_eq!(stream.push(packet(&["a"])), 5);
        stream.get_next_gen();
        assert_eq!(stream.push(packet(&["c"])), 7);

        let result = stream
            .apply_deletes_and_updates(&pool, &[Arc::clone(&info)])
            .unwrap();
        assert!(result.any_deletes);
        assert_eq!(result.gen, 7);
        assert!(result.all_deleted.is_empty());
        assert_eq!(info.buffered_deletes_gen(), 7);

        let rld = pool.get(&info, false).unwrap();
        assert_eq!(rld.pending_delete_count(), 2);
        let reader = rld.read_only_clone().unwrap();
        assert!(!reader.is_live(0));
        assert!(reader.is_live(1));
        assert!(!reader.is_live(2));

        let again = stream
            .apply_deletes_and_updates(&pool, &[Arc::clone(&info)])
            .unwrap();
        assert!(!again.any_deletes);
    }

    #[test]
    fn test_older_packets_skip_newer_segment() {
        let (storage, codec) = setup();
        let pool = ReaderPool::new(Arc::clone(&storage), Arc::clone(&codec), true);
        let stream = BufferedUpdatesStream::new();

        let old = segment_with_ids(&storage, &codec, "_0", &["a"]);
        old.set_buffered_deletes_gen(stream.get_next_gen());
        stream.push(packet(&["a"]));
        let new = segment_with_ids(&storage, &codec, "_1", &["a"]);
        new.set_buffered_deletes_gen(stream.get_next_gen());

        let result = stream
            .apply_deletes_and_updates(&pool, &[Arc::clone(&old), Arc::clone(&new)])
            .unwrap();
        assert_eq!(result.all_deleted.len(), 1);
        assert_eq!(result.all_deleted[0].name(), "_0");
        assert_eq!(pool.num_deleted_docs(&new), 0);
        assert_eq!(new.buffered_deletes_gen(), 3);
    }

    #[test]
    fn test_private_packet_query_limit_and_updates() {
        let (storage, codec) = setup();
        let pool = ReaderPool::new(Arc::clone(&storage), Arc::clone(&codec), true);
        let stream = BufferedUpdatesStream::new();
        let info = segment_with_ids(&storage, &codec, "_0", &["a", "b", "c"]);

        let mut buffered = BufferedUpdates::new();
        buffered.add_query(Query::MatchAll, 1);
        buffered.add_update(DocValuesUpdate::numeric(Term::new("id", "b"), "n", Some(5)), 2);
        let private = Arc::new(FrozenBufferedUpdates::new(&buffered, Some("_0".into())));
        let gen = stream.push(private);
        info.set_buffered_deletes_gen(gen);

        let mut global = BufferedUpdates::new();
        global.add_update(DocValuesUpdate::numeric(Term::new("id", "b"), "n", Some(9)), MAX_DOC_ID_UPTO);
        stream.push(Arc::new(FrozenBufferedUpdates::new(&global, None)));

        let result = stream
            .apply_deletes_and_updates(&pool, &[Arc::clone(&info)])
            .unwrap();
        assert!(result.any_deletes);
        assert_eq!(stream.num_packets(), 1);

        let reader = pool.get(&info, false).unwrap().read_only_clone().unwrap();
        assert!(!reader.is_live(0));
        assert!(reader.is_live(1));
        assert_eq!(reader.numeric_value("n", 1), Some(9));
        assert_eq!(reader.numeric_value("n", 2), Some(0));
    }

    #[test]
    fn test_prune_drops_applied_and_orphaned_packets() {
        let (storage, codec) = setup();
        let stream = BufferedUpdatesStream::new();
        let info = segment_with_ids(&storage, &codec, "_0", &["a"]);

        stream.push(packet(&["x"]));
        let orphan = {
            let mut buffered = BufferedUpdates::new();
            buffered.add_query(Query::MatchAll, 1);
            Arc::new(FrozenBufferedUpdates::new(&buffered, Some("_gone".into())))
        };
        stream.push(orphan);
        stream.push(packet(&["y"]));
        info.set_buffered_deletes_gen(2);

        let mut infos = SegmentInfos::new();
        infos.add(info);
        stream.prune(&infos);
        assert_eq!(stream.num_packets(), 1);
        assert_eq!(stream.num_terms(), 1);

        stream.clear();
        assert!(!stream.any());
        assert_eq!(stream.bytes_used(), 0);
    }
}
