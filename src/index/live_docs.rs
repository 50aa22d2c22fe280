//! Live-document bitsets.

use bit_vec::BitVec;

use crate::error::{Result, StrataError};

/// A bitset over a segment's documents; a set bit means the document is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDocs {
    bits: BitVec,
    deleted: u32,
}

impl LiveDocs {
    /// All documents live.
    pub fn all_live(max_doc: u32) -> Self {
        LiveDocs {
            bits: BitVec::from_elem(max_doc as usize, true),
            deleted: 0,
        }
    }

    /// Whether a document is live. Out-of-range documents are not.
    pub fn is_live(&self, doc: u32) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Clear a document's bit. Returns true if it was live before.
    pub fn delete(&mut self, doc: u32) -> bool {
        if self.is_live(doc) {
            self.bits.set(doc as usize, false);
            self.deleted += 1;
            true
        } else {
            false
        }
    }

    /// Number of documents covered.
    pub fn max_doc(&self) -> u32 {
        self.bits.len() as u32
    }

    /// Number of cleared bits.
    pub fn num_deleted(&self) -> u32 {
        self.deleted
    }

    /// Number of set bits.
    pub fn num_live(&self) -> u32 {
        self.max_doc() - self.deleted
    }

    /// The raw bitset bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    /// Rebuild from raw bytes.
    pub fn from_bytes(bytes: &[u8], max_doc: u32) -> Result<Self> {
        let mut bits = BitVec::from_bytes(bytes);
        if bits.len() < max_doc as usize {
            return Err(StrataError::storage(format!(
                "live docs hold {} bits, expected {max_doc}",
                bits.len()
            )));
        }
        bits.truncate(max_doc as usize);
        let live = bits.iter().filter(|b| *b).count() as u32;
        Ok(LiveDocs {
            bits,
            deleted: max_doc - live,
        })
    }
}
