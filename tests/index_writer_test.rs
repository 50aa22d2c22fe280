use std::sync::Arc;
use std::thread;

use strata::analysis::analyzer::KeywordAnalyzer;
use strata::document::Document;
use strata::index::merge::{LogDocMergePolicy, NoMergePolicy, SerialMergeScheduler};
use strata::index::writer::indexing_chain::MAX_TERM_LENGTH;
use strata::index::{DocAddress, IndexSnapshot, IndexWriter, IndexWriterConfig, OpenMode, Query, Term};
use strata::storage::Storage;
use strata::storage::file::{FileStorage, FileStorageConfig};
use strata::storage::memory::MemoryStorage;
use tempfile::TempDir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn serial_config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
}

fn product(id: &str, title: &str, price: i64) -> Document {
    Document::builder()
        .add_keyword("id", id)
        .add_text("title", title)
        .add_numeric("price", price)
        .add_binary("sku", id.as_bytes().to_vec())
        .build()
}

fn find(snapshot: &IndexSnapshot, id: &str) -> Option<DocAddress> {
    snapshot.search(&Query::term("id", id)).into_iter().next()
}

#[test]
fn test_delete_applies_to_earlier_documents_only() {
    init_logger();
    let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), serial_config()).unwrap();

    writer
        .add_document(&Document::builder().add_keyword("id", "d1").add_keyword("color", "red").build())
        .unwrap();
    writer
        .add_document(&Document::builder().add_keyword("id", "d2").add_keyword("color", "red").build())
        .unwrap();
    writer.delete_terms(vec![Term::new("color", "red")]).unwrap();
    writer
        .add_document(&Document::builder().add_keyword("id", "d3").add_keyword("color", "red").build())
        .unwrap();

    let snapshot = writer.get_reader(true).unwrap();
    assert!(find(&snapshot, "d1").is_none());
    assert!(find(&snapshot, "d2").is_none());
    assert!(find(&snapshot, "d3").is_some());
    assert_eq!(snapshot.num_docs(), 1);
    writer.close().unwrap();
}

#[test]
fn test_flushed_segment_carries_buffered_deletes() {
    init_logger();
    let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), serial_config()).unwrap();
    for i in 0..10 {
        writer.add_document(&product(&format!("p{i}"), "widget", i)).unwrap();
    }
    writer
        .delete_terms(vec![Term::new("id", "p3"), Term::new("id", "p7")])
        .unwrap();
    writer.flush().unwrap();

    let snapshot = writer.get_reader(false).unwrap();
    assert_eq!(snapshot.segment_readers().len(), 1);
    let segment = &snapshot.segment_readers()[0];
    assert_eq!(segment.max_doc(), 10);
    assert_eq!(segment.num_docs(), 8);
    assert!(!segment.is_live(3));
    assert!(!segment.is_live(7));
    writer.close().unwrap();
}

#[test]
fn test_bad_document_is_skipped_and_neighbours_survive() {
    init_logger();
    let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), serial_config()).unwrap();
    writer.add_document(&product("before", "first", 1)).unwrap();
    let err = writer
        .add_document(
            &Document::builder()
                .add_keyword("id", "x".repeat(MAX_TERM_LENGTH + 1))
                .build(),
        )
        .unwrap_err();
    assert!(!err.is_aborting());
    writer.add_document(&product("after", "third", 3)).unwrap();

    let snapshot = writer.get_reader(true).unwrap();
    assert_eq!(snapshot.max_doc(), 3);
    assert_eq!(snapshot.num_docs(), 2);
    assert!(find(&snapshot, "before").is_some());
    assert!(find(&snapshot, "after").is_some());
    writer.close().unwrap();
}

#[test]
fn test_snapshot_is_point_in_time() {
    init_logger();
    let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), serial_config()).unwrap();
    writer.add_document(&product("a", "alpha", 1)).unwrap();
    writer.add_document(&product("b", "beta", 2)).unwrap();
    let before = writer.get_reader(true).unwrap();

    writer.delete_terms(vec![Term::new("id", "a")]).unwrap();
    writer.add_document(&product("c", "gamma", 3)).unwrap();
    let after = writer.get_reader(true).unwrap();

    assert_eq!(before.num_docs(), 2);
    assert!(find(&before, "a").is_some());
    assert_eq!(after.num_docs(), 2);
    assert!(find(&after, "a").is_none());
    assert!(after.version() > before.version());
    writer.close().unwrap();
}

#[test]
fn test_doc_values_updates_follow_term_order() {
    init_logger();
    let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), serial_config()).unwrap();
    writer.add_document(&product("a", "alpha", 10)).unwrap();
    writer.add_document(&product("b", "beta", 20)).unwrap();
    writer.flush().unwrap();

    writer
        .update_numeric_doc_value(Term::new("id", "a"), "price", Some(11))
        .unwrap();
    writer
        .update_numeric_doc_value(Term::new("id", "a"), "price", Some(12))
        .unwrap();
    writer
        .update_binary_doc_value(Term::new("id", "b"), "sku", None)
        .unwrap();
    // documents added after the update keep their own value
    writer.add_document(&product("a", "alpha again", 99)).unwrap();

    let snapshot = writer.get_reader(true).unwrap();
    let hits = snapshot.search(&Query::term("id", "a"));
    assert_eq!(hits.len(), 2);
    let mut prices: Vec<i64> = hits
        .iter()
        .filter_map(|addr| snapshot.numeric_value("price", *addr))
        .collect();
    prices.sort();
    assert_eq!(prices, vec![12, 99]);

    let b = find(&snapshot, "b").unwrap();
    assert_eq!(snapshot.binary_value("sku", b), None);
    assert!(
        writer
            .update_binary_doc_value(Term::new("id", "a"), "price", Some(vec![1]))
            .is_err()
    );
    writer.close().unwrap();
}

#[test]
fn test_concurrent_indexing_with_background_merges() {
    init_logger();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexWriterConfig::default()
        .with_max_buffered_docs(Some(25))
        .with_merge_policy(Arc::new(LogDocMergePolicy::default()));
    let writer = Arc::new(IndexWriter::open(Arc::clone(&storage), config).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                for i in 0..200 {
                    let id = format!("t{t}-{i}");
                    writer.add_document(&product(&id, "concurrent widget", i)).unwrap();
                    if i % 10 == 9 {
                        writer.delete_terms(vec![Term::new("id", id)]).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    writer.commit().unwrap();
    writer.wait_for_merges().unwrap();
    let snapshot = writer.get_reader(true).unwrap();
    assert_eq!(snapshot.num_docs(), 4 * 180);
    assert!(find(&snapshot, "t2-9").is_none());
    assert!(find(&snapshot, "t2-8").is_some());
    writer.close().unwrap();

    let reopened = IndexWriter::open(storage, serial_config().with_open_mode(OpenMode::Append)).unwrap();
    assert_eq!(reopened.num_docs(), 4 * 180);
    reopened.rollback().unwrap();
}

#[test]
fn test_commit_and_reopen_on_disk() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let open_storage = || -> Arc<dyn Storage> {
        Arc::new(FileStorage::new(dir.path(), FileStorageConfig::default()).unwrap())
    };

    {
        let writer = IndexWriter::open(open_storage(), serial_config()).unwrap();
        writer.add_document(&product("a", "red shoes", 100)).unwrap();
        writer.add_document(&product("b", "blue shoes", 200)).unwrap();
        writer.flush().unwrap();
        writer.add_document(&product("c", "green hat", 300)).unwrap();
        writer.delete_terms(vec![Term::new("id", "b")]).unwrap();
        writer
            .update_numeric_doc_value(Term::new("id", "a"), "price", Some(150))
            .unwrap();
        writer.close().unwrap();
    }

    let writer = IndexWriter::open(open_storage(), serial_config().with_open_mode(OpenMode::Append)).unwrap();
    assert_eq!(writer.segment_count(), 2);
    assert_eq!(writer.num_docs(), 2);
    let snapshot = writer.get_reader(true).unwrap();
    assert!(find(&snapshot, "b").is_none());
    let a = find(&snapshot, "a").unwrap();
    assert_eq!(snapshot.numeric_value("price", a), Some(150));
    let c = find(&snapshot, "c").unwrap();
    assert_eq!(snapshot.binary_value("sku", c), Some(&b"c"[..]));
    assert_eq!(snapshot.search(&Query::term("title", "shoes")).len(), 1);
    writer.rollback().unwrap();

    let writer = IndexWriter::open(open_storage(), serial_config().with_open_mode(OpenMode::Create)).unwrap();
    assert_eq!(writer.max_doc(), 0);
    writer.close().unwrap();
    let writer = IndexWriter::open(open_storage(), serial_config().with_open_mode(OpenMode::Append)).unwrap();
    assert_eq!(writer.max_doc(), 0);
    writer.rollback().unwrap();
}

#[test]
fn test_unreferenced_files_are_removed_after_merge_and_commit() {
    init_logger();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let writer = IndexWriter::open(
        Arc::clone(&storage),
        IndexWriterConfig::default().with_merge_scheduler(Arc::new(SerialMergeScheduler::new())),
    )
    .unwrap();
    for i in 0..5 {
        writer.add_document(&product(&format!("s{i}"), "segment", i)).unwrap();
        writer.flush().unwrap();
    }
    writer.commit().unwrap();
    let before = writer.segment_names();
    writer.force_merge(1, true).unwrap();
    writer.commit().unwrap();

    let files = storage.list_files().unwrap();
    for name in &before {
        assert!(
            !files.iter().any(|f| f.starts_with(&format!("{name}."))),
            "files of merged segment {name} should be gone: {files:?}"
        );
    }
    assert_eq!(files.iter().filter(|f| f.starts_with("segments_")).count(), 1);
    writer.close().unwrap();
}

#[test]
fn test_configured_analyzer_is_used_for_text_fields() {
    init_logger();
    let config = serial_config().with_analyzer(Arc::new(KeywordAnalyzer::new()));
    let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), config).unwrap();
    writer.add_document(&product("k", "Whole Title", 1)).unwrap();

    let snapshot = writer.get_reader(true).unwrap();
    assert_eq!(snapshot.search(&Query::term("title", "Whole Title")).len(), 1);
    assert!(snapshot.search(&Query::term("title", "whole")).is_empty());
    writer.close().unwrap();
}
