//! The per-thread document buffer.
//!
//! A [`PerThreadWriter`] owns one in-memory segment in progress. It is only
//! ever used by the thread that checked it out of the pool, so indexing
//! into it takes no lock. Deletes that arrive while it is buffering are
//! picked up through its [`DeleteSlice`] on every finished document.

use std::sync::Arc;

use log::debug;

use crate::analysis::Analyzer;
use crate::document::Document;
use crate::error::Result;
use crate::index::codec::{Codec, SegmentData};
use crate::index::field_infos::{FieldInfos, FieldNumbers};
use crate::index::live_docs::LiveDocs;
use crate::index::segment::{SOURCE_DIAGNOSTIC, SegmentCommitInfo, SegmentInfo};
use crate::index::term::Term;
use crate::index::writer::buffered_updates::BufferedUpdates;
use crate::index::writer::delete_queue::{DeleteQueue, DeleteSlice};
use crate::index::writer::frozen_updates::FrozenBufferedUpdates;
use crate::index::writer::indexing_chain::IndexingChain;
use crate::storage::Storage;

/// The result of flushing a buffer.
#[derive(Debug)]
pub struct FlushedSegment {
    /// The new segment.
    pub segment: Arc<SegmentCommitInfo>,
    /// Its field metadata.
    pub field_infos: FieldInfos,
    /// Documents deleted at flush time, if any.
    pub live_docs: Option<LiveDocs>,
    /// Number of deleted documents.
    pub del_count: u32,
    /// Query deletes and doc-values updates this segment still has to apply.
    pub private_updates: Option<FrozenBufferedUpdates>,
}

/// One in-memory segment in progress.
#[derive(Debug)]
pub struct PerThreadWriter {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    delete_queue: Arc<DeleteQueue>,
    delete_slice: DeleteSlice,
    pending_updates: BufferedUpdates,
    chain: IndexingChain,
    segment_name: String,
    num_docs: u32,
    aborted: bool,
}

impl PerThreadWriter {
    /// Create a buffer bound to a delete queue.
    pub fn new(
        segment_name: String,
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        field_numbers: Arc<FieldNumbers>,
        delete_queue: Arc<DeleteQueue>,
    ) -> Self {
        let delete_slice = delete_queue.new_slice();
        PerThreadWriter {
            storage,
            codec,
            delete_slice,
            delete_queue,
            pending_updates: BufferedUpdates::new(),
            chain: IndexingChain::new(field_numbers),
            segment_name,
            num_docs: 0,
            aborted: false,
        }
    }

    /// Name the segment will be flushed under.
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Documents buffered, including documents deleted by a failure.
    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    /// The delete queue this buffer follows.
    pub fn delete_queue(&self) -> &Arc<DeleteQueue> {
        &self.delete_queue
    }

    /// Approximate RAM held by the buffered documents and updates.
    pub fn bytes_used(&self) -> i64 {
        self.chain.bytes_used() + self.pending_updates.bytes_used()
    }

    /// Number of term deletes waiting for this buffer's flush.
    pub fn num_pending_term_deletes(&self) -> usize {
        self.pending_updates.num_term_deletes()
    }

    /// Whether the buffer was aborted since the flag was last cleared.
    pub fn check_and_reset_aborted(&mut self) -> bool {
        std::mem::replace(&mut self.aborted, false)
    }

    /// Index one document, optionally deleting older documents matching
    /// `delete_term` first.
    ///
    /// A non-aborting failure marks the document deleted and still consumes
    /// its doc ID; an aborting failure discards the whole buffer.
    pub fn update_document(
        &mut self,
        doc: &Document,
        analyzer: &dyn Analyzer,
        delete_term: Option<Term>,
    ) -> Result<()> {
        let doc_id = self.num_docs;
        if let Err(e) = self.chain.process_document(doc_id, doc, analyzer) {
            if e.is_aborting() {
                self.abort();
            } else {
                self.delete_doc_id(doc_id);
                self.num_docs += 1;
            }
            return Err(e);
        }
        self.finish_document(delete_term);
        Ok(())
    }

    /// Index a block of documents atomically.
    ///
    /// If any document fails, every document of the block is deleted. The
    /// delete term only affects documents indexed before the block.
    pub fn update_documents(
        &mut self,
        docs: &[Document],
        analyzer: &dyn Analyzer,
        delete_term: Option<Term>,
    ) -> Result<()> {
        let mut doc_count = 0u32;
        for doc in docs {
            let doc_id = self.num_docs;
            doc_count += 1;
            if let Err(e) = self.chain.process_document(doc_id, doc, analyzer) {
                if e.is_aborting() {
                    self.abort();
                } else {
                    self.num_docs += 1;
                    let first = self.num_docs - doc_count;
                    for id in first..self.num_docs {
                        self.delete_doc_id(id);
                    }
                }
                return Err(e);
            }
            self.finish_document(None);
        }

        if let Some(term) = delete_term {
            self.delete_queue.add(term, &mut self.delete_slice);
            self.delete_slice
                .apply(&mut self.pending_updates, self.num_docs - doc_count);
        }
        Ok(())
    }

    fn finish_document(&mut self, delete_term: Option<Term>) {
        // a first document has nothing older to delete
        let mut apply_slice = self.num_docs != 0;
        match delete_term {
            Some(term) => {
                self.delete_queue.add(term, &mut self.delete_slice);
            }
            None => {
                apply_slice &= self.delete_queue.update_slice(&mut self.delete_slice);
            }
        }

        if apply_slice {
            self.delete_slice
                .apply(&mut self.pending_updates, self.num_docs);
        } else {
            self.delete_slice.reset();
        }
        self.num_docs += 1;
    }

    fn delete_doc_id(&mut self, doc_id: u32) {
        self.pending_updates.add_doc_id(doc_id);
    }

    /// Freeze the global buffer and catch up with the delete queue.
    ///
    /// Must run under the ticket-queue lock so packets are frozen in ticket
    /// order. Returns the global packet, if anything was pending.
    pub fn prepare_flush(&mut self) -> Option<FrozenBufferedUpdates> {
        let global = self
            .delete_queue
            .freeze_global_buffer(Some(&mut self.delete_slice));
        self.delete_slice
            .apply(&mut self.pending_updates, self.num_docs);
        global
    }

    /// Write the buffered documents as a new segment.
    ///
    /// Buffered term deletes are resolved against the in-memory postings,
    /// doc-ID deletes become the segment's first live-docs generation and
    /// what is left (query deletes, doc-values updates) is returned as a
    /// segment-private packet. Any failure aborts the buffer.
    pub fn flush(&mut self) -> Result<FlushedSegment> {
        debug_assert!(self.num_docs > 0, "flushing an empty buffer");
        debug_assert!(self.delete_slice.is_empty(), "flush before prepare_flush");
        match self.flush_segment() {
            Ok(flushed) => Ok(flushed),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn flush_segment(&mut self) -> Result<FlushedSegment> {
        let num_docs = self.num_docs;
        let mut live_docs: Option<LiveDocs> = None;

        let doc_ids = self.pending_updates.take_doc_ids();
        if !doc_ids.is_empty() {
            let bits = live_docs.get_or_insert_with(|| LiveDocs::all_live(num_docs));
            for doc in doc_ids {
                bits.delete(doc);
            }
        }

        let data = self.chain.flush(num_docs)?;
        self.apply_term_deletes(&data, &mut live_docs);

        let field_infos = data.field_infos.clone();
        let mut info = SegmentInfo::new(&self.segment_name, num_docs, self.codec.name())
            .with_diagnostic(SOURCE_DIAGNOSTIC, "flush");
        info.files = self
            .codec
            .write_segment(self.storage.as_ref(), &self.segment_name, &data)?;
        let segment = Arc::new(SegmentCommitInfo::new(info));

        let del_count = live_docs.as_ref().map_or(0, LiveDocs::num_deleted);
        if let Some(bits) = live_docs.as_ref().filter(|_| del_count > 0) {
            let del_gen = segment.next_write_del_gen();
            self.codec
                .write_live_docs(self.storage.as_ref(), &self.segment_name, del_gen, bits)?;
            segment.advance_del_gen();
            segment.set_del_count(del_count)?;
        }

        let private_updates = if self.pending_updates.any() {
            let packet =
                FrozenBufferedUpdates::new(&self.pending_updates, Some(self.segment_name.clone()));
            self.pending_updates.clear();
            Some(packet)
        } else {
            None
        };

        debug!(
            "flushed segment {}: {} docs, {} deleted, private updates: {}",
            self.segment_name,
            num_docs,
            del_count,
            private_updates.is_some()
        );

        Ok(FlushedSegment {
            segment,
            field_infos,
            live_docs,
            del_count,
            private_updates,
        })
    }

    fn apply_term_deletes(&mut self, data: &SegmentData, live_docs: &mut Option<LiveDocs>) {
        if self.pending_updates.terms().is_empty() {
            return;
        }
        for (term, &doc_id_upto) in self.pending_updates.terms() {
            let Some(postings) = data
                .postings
                .get(&term.field)
                .and_then(|terms| terms.get(&term.text))
            else {
                continue;
            };
            for posting in postings.iter().filter(|p| p.doc < doc_id_upto) {
                live_docs
                    .get_or_insert_with(|| LiveDocs::all_live(data.max_doc))
                    .delete(posting.doc);
            }
        }
        self.pending_updates.clear_terms();
    }

    /// Discard every buffered document and update.
    pub fn abort(&mut self) {
        debug!(
            "aborting buffer {} with {} docs",
            self.segment_name, self.num_docs
        );
        self.aborted = true;
        self.chain.abort();
        self.pending_updates.clear();
        self.delete_slice.reset();
        self.num_docs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyzer::StandardAnalyzer;
    use crate::index::codec::DefaultCodec;
    use crate::index::query::Query;
    use crate::storage::memory::MemoryStorage;

    fn writer(queue: &Arc<DeleteQueue>) -> PerThreadWriter {
        PerThreadWriter::new(
            "_0".to_string(),
            Arc::new(MemoryStorage::new()),
            Arc::new(DefaultCodec::new()),
            Arc::new(FieldNumbers::new()),
            Arc::clone(queue),
        )
    }

    fn doc(id: &str) -> Document {
        Document::builder()
            .add_keyword("id", id)
            .add_text("body", "some text")
            .build()
    }

    #[test]
    fn test_delete_term_applies_to_earlier_docs_only() {
        let queue = Arc::new(DeleteQueue::new(0));
        let mut dwpt = writer(&queue);
        let analyzer = StandardAnalyzer::new();

        dwpt.update_document(&doc("1"), &analyzer, None).unwrap();
        dwpt.update_document(&doc("1"), &analyzer, None).unwrap();
        queue.add_delete(vec![Term::new("id", "1")]);
        dwpt.update_document(&doc("1"), &analyzer, None).unwrap();

        assert!(dwpt.prepare_flush().is_some());
        let flushed = dwpt.flush().unwrap();
        let live = flushed.live_docs.unwrap();
        assert!(!live.is_live(0));
        assert!(!live.is_live(1));
        assert!(live.is_live(2));
        assert_eq!(flushed.del_count, 2);
        assert_eq!(flushed.segment.del_gen(), 1);
        assert_eq!(flushed.segment.del_count(), 2);
    }

    #[test]
    fn test_update_replaces_previous_version() {
        let queue = Arc::new(DeleteQueue::new(0));
        let mut dwpt = writer(&queue);
        let analyzer = StandardAnalyzer::new();

        dwpt.update_document(&doc("a"), &analyzer, None).unwrap();
        dwpt.update_document(&doc("a"), &analyzer, Some(Term::new("id", "a")))
            .unwrap();
        dwpt.prepare_flush();
        let flushed = dwpt.flush().unwrap();

        let live = flushed.live_docs.unwrap();
        assert!(!live.is_live(0));
        assert!(live.is_live(1));
    }

    #[test]
    fn test_failed_document_is_deleted() {
        let queue = Arc::new(DeleteQueue::new(0));
        let mut dwpt = writer(&queue);
        let analyzer = StandardAnalyzer::new();
        let bad = Document::builder()
            .add_keyword("id", "x".repeat(40_000))
            .build();

        dwpt.update_document(&doc("1"), &analyzer, None).unwrap();
        assert!(dwpt.update_document(&bad, &analyzer, None).is_err());
        dwpt.update_document(&doc("3"), &analyzer, None).unwrap();
        assert_eq!(dwpt.num_docs(), 3);

        dwpt.prepare_flush();
        let flushed = dwpt.flush().unwrap();
        let live = flushed.live_docs.unwrap();
        assert!(live.is_live(0));
        assert!(!live.is_live(1));
        assert!(live.is_live(2));
    }

    #[test]
    fn test_flush_writes_doc_id_deletes_as_live_docs() {
        let queue = Arc::new(DeleteQueue::new(0));
        let mut dwpt = writer(&queue);
        let analyzer = StandardAnalyzer::new();
        let bad = Document::builder()
            .add_keyword("id", "x".repeat(40_000))
            .build();

        for i in 0..10 {
            if i == 3 || i == 7 {
                assert!(dwpt.update_document(&bad, &analyzer, None).is_err());
            } else {
                dwpt.update_document(&doc(&i.to_string()), &analyzer, None).unwrap();
            }
        }
        assert_eq!(dwpt.num_docs(), 10);

        dwpt.prepare_flush();
        let flushed = dwpt.flush().unwrap();
        let live = flushed.live_docs.unwrap();
        assert_eq!(live.max_doc(), 10);
        assert_eq!(live.num_live(), 8);
        assert!(!live.is_live(3));
        assert!(!live.is_live(7));
        assert_eq!(flushed.del_count, 2);
        assert_eq!(flushed.segment.del_count(), 2);
        assert_eq!(flushed.segment.del_gen(), 1);
    }

    #[test]
    fn test_failed_block_deletes_every_block_doc() {
        let queue = Arc::new(DeleteQueue::new(0));
        let mut dwpt = writer(&queue);
        let analyzer = StandardAnalyzer::new();
        let bad = Document::builder()
            .add_numeric("n", 1)
            .add_numeric("n", 2)
            .build();

        dwpt.update_document(&doc("0"), &analyzer, None).unwrap();
        let block = vec![doc("1"), doc("2"), bad];
        assert!(dwpt.update_documents(&block, &analyzer, None).is_err());
        assert_eq!(dwpt.num_docs(), 4);

        dwpt.prepare_flush();
        let flushed = dwpt.flush().unwrap();
        assert_eq!(flushed.del_count, 3);
        assert!(flushed.live_docs.unwrap().is_live(0));
    }

    #[test]
    fn test_queries_become_private_packet() {
        let queue = Arc::new(DeleteQueue::new(0));
        let mut dwpt = writer(&queue);
        let analyzer = StandardAnalyzer::new();

        dwpt.update_document(&doc("1"), &analyzer, None).unwrap();
        queue.add_delete_queries(vec![Query::term("id", "1")]);
        dwpt.update_document(&doc("2"), &analyzer, None).unwrap();

        dwpt.prepare_flush();
        let flushed = dwpt.flush().unwrap();
        assert!(flushed.live_docs.is_none());
        let packet = flushed.private_updates.unwrap();
        assert_eq!(packet.private_segment(), Some("_0"));
        assert_eq!(packet.queries()[0].1, 1);
    }

    #[test]
    fn test_abort_discards_documents() {
        let queue = Arc::new(DeleteQueue::new(0));
        let mut dwpt = writer(&queue);
        let analyzer = StandardAnalyzer::new();

        dwpt.update_document(&doc("1"), &analyzer, None).unwrap();
        dwpt.abort();
        assert_eq!(dwpt.num_docs(), 0);
        assert_eq!(dwpt.bytes_used(), 0);
        assert!(dwpt.check_and_reset_aborted());
        assert!(!dwpt.check_and_reset_aborted());
    }
}
