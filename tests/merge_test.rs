use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use strata::document::Document;
use strata::error::Result;
use strata::index::codec::{Codec, DefaultCodec, DocValuesColumns, SegmentData};
use strata::index::live_docs::LiveDocs;
use strata::index::merge::{ConcurrentMergeScheduler, LogDocMergePolicy, SerialMergeScheduler};
use strata::index::segment::SegmentInfo;
use strata::index::{IndexWriter, IndexWriterConfig, Query, Term};
use strata::storage::Storage;
use strata::storage::memory::MemoryStorage;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Blocks the next segment write once armed, until the test lets it go.
#[derive(Debug)]
struct GatedCodec {
    inner: DefaultCodec,
    armed: AtomicBool,
    entered: Sender<String>,
    release: Receiver<()>,
}

impl Codec for GatedCodec {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn write_segment(&self, storage: &dyn Storage, segment: &str, data: &SegmentData) -> Result<BTreeSet<String>> {
        if self.armed.swap(false, Ordering::AcqRel) {
            let _ = self.entered.send(segment.to_string());
            let _ = self.release.recv_timeout(Duration::from_secs(30));
        }
        self.inner.write_segment(storage, segment, data)
    }

    fn open_segment(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<SegmentData> {
        self.inner.open_segment(storage, info)
    }

    fn write_live_docs(&self, storage: &dyn Storage, segment: &str, del_gen: i64, live_docs: &LiveDocs) -> Result<String> {
        self.inner.write_live_docs(storage, segment, del_gen, live_docs)
    }

    fn read_live_docs(&self, storage: &dyn Storage, segment: &str, del_gen: i64, max_doc: u32) -> Result<LiveDocs> {
        self.inner.read_live_docs(storage, segment, del_gen, max_doc)
    }

    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        segment: &str,
        gen: i64,
        columns: &DocValuesColumns,
    ) -> Result<String> {
        self.inner.write_field_updates(storage, segment, gen, columns)
    }

    fn read_field_updates(&self, storage: &dyn Storage, file: &str) -> Result<DocValuesColumns> {
        self.inner.read_field_updates(storage, file)
    }
}

fn item(id: &str, rank: i64) -> Document {
    Document::builder()
        .add_keyword("id", id)
        .add_text("body", "merge carry test")
        .add_numeric("rank", rank)
        .build()
}

#[test]
fn test_changes_during_merge_are_carried_into_merged_segment() {
    init_logger();
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let codec = Arc::new(GatedCodec {
        inner: DefaultCodec::new(),
        armed: AtomicBool::new(false),
        entered: entered_tx,
        release: release_rx,
    });
    let config = IndexWriterConfig::default()
        .with_codec(Arc::clone(&codec) as Arc<dyn Codec>)
        .with_merge_scheduler(Arc::new(ConcurrentMergeScheduler::default()));
    let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), config).unwrap();

    for segment in 0..3 {
        writer.add_document(&item(&format!("d{}", segment * 2), 1)).unwrap();
        writer.add_document(&item(&format!("d{}", segment * 2 + 1), 1)).unwrap();
        writer.flush().unwrap();
    }
    writer.commit().unwrap();
    assert_eq!(writer.segment_count(), 3);

    codec.armed.store(true, Ordering::Release);
    writer.force_merge(1, false).unwrap();
    let merged_name = entered_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("merge should reach the segment write");

    // the merge has read its sources; these changes land on the old segments
    writer.delete_terms(vec![Term::new("id", "d1")]).unwrap();
    writer
        .update_numeric_doc_value(Term::new("id", "d4"), "rank", Some(42))
        .unwrap();
    let during = writer.get_reader(true).unwrap();
    assert_eq!(during.segment_readers().len(), 3);
    assert_eq!(during.num_docs(), 5);

    release_tx.send(()).unwrap();
    writer.wait_for_merges().unwrap();

    assert_eq!(writer.segment_names(), vec![merged_name]);
    let after = writer.get_reader(true).unwrap();
    assert_eq!(after.max_doc(), 6);
    assert_eq!(after.num_docs(), 5);
    assert!(after.search(&Query::term("id", "d1")).is_empty());
    let hits = after.search(&Query::numeric_range("rank", Some(42), Some(42)));
    assert_eq!(hits.len(), 1);
    assert_eq!(after.stored_fields(hits[0])[0].value.as_text(), Some("d4"));
    writer.close().unwrap();
}

#[test]
fn test_natural_merges_keep_every_live_document() {
    init_logger();
    let config = IndexWriterConfig::default()
        .with_max_buffered_docs(Some(10))
        .with_merge_policy(Arc::new(LogDocMergePolicy::default()))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()));
    let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), config).unwrap();
    for i in 0..300 {
        writer.add_document(&item(&format!("n{i}"), i)).unwrap();
    }
    writer
        .delete_queries(vec![Query::numeric_range("rank", Some(0), Some(49))])
        .unwrap();
    writer.commit().unwrap();

    assert!(writer.segment_count() < 30);
    let snapshot = writer.get_reader(true).unwrap();
    assert_eq!(snapshot.num_docs(), 250);
    assert!(snapshot.search(&Query::term("id", "n10")).is_empty());
    assert_eq!(snapshot.search(&Query::term("id", "n299")).len(), 1);
    writer.close().unwrap();
}

#[test]
fn test_force_merge_deletes_reclaims_deleted_documents() {
    init_logger();
    let writer = IndexWriter::open(
        Arc::new(MemoryStorage::new()),
        IndexWriterConfig::default().with_merge_scheduler(Arc::new(SerialMergeScheduler::new())),
    )
    .unwrap();
    for segment in 0..2 {
        for i in 0..10 {
            writer.add_document(&item(&format!("s{segment}-{i}"), i)).unwrap();
        }
        writer.flush().unwrap();
    }
    let doomed: Vec<Term> = (0..6).map(|i| Term::new("id", format!("s0-{i}"))).collect();
    writer.delete_terms(doomed).unwrap();
    writer.force_merge_deletes(true).unwrap();

    let snapshot = writer.get_reader(true).unwrap();
    assert_eq!(snapshot.num_docs(), 14);
    assert_eq!(snapshot.max_doc(), 14);
    writer.close().unwrap();
}
