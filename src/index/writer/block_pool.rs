//! Append-only byte storage in fixed-size blocks.

/// Size of one block.
pub const BYTE_BLOCK_SIZE: usize = 1 << 15;

/// A pool of byte blocks. Appended data may span block boundaries.
#[derive(Debug, Default)]
pub struct ByteBlockPool {
    blocks: Vec<Box<[u8]>>,
    /// Write offset inside the last block.
    upto: usize,
}

impl ByteBlockPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes allocated.
    pub fn bytes_allocated(&self) -> usize {
        self.blocks.len() * BYTE_BLOCK_SIZE
    }

    /// Absolute offset the next append writes at.
    pub fn position(&self) -> usize {
        match self.blocks.len() {
            0 => 0,
            n => (n - 1) * BYTE_BLOCK_SIZE + self.upto,
        }
    }

    /// Append bytes and return the absolute offset they start at.
    pub fn append(&mut self, mut data: &[u8]) -> usize {
        let start = self.position();
        while !data.is_empty() {
            if self.blocks.is_empty() || self.upto == BYTE_BLOCK_SIZE {
                self.blocks.push(vec![0u8; BYTE_BLOCK_SIZE].into_boxed_slice());
                self.upto = 0;
            }
            let block = self.blocks.len() - 1;
            let n = data.len().min(BYTE_BLOCK_SIZE - self.upto);
            self.blocks[block][self.upto..self.upto + n].copy_from_slice(&data[..n]);
            self.upto += n;
            data = &data[n..];
        }
        start
    }

    /// Copy `len` bytes starting at an absolute offset. Returns `None` if
    /// the range was never written.
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        if offset + len > self.position() {
            return None;
        }
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while out.len() < len {
            let block = pos / BYTE_BLOCK_SIZE;
            let inner = pos % BYTE_BLOCK_SIZE;
            let n = (len - out.len()).min(BYTE_BLOCK_SIZE - inner);
            out.extend_from_slice(&self.blocks[block][inner..inner + n]);
            pos += n;
        }
        Some(out)
    }

    /// Drop all blocks.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.upto = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_across_blocks() {
        let mut pool = ByteBlockPool::new();
        let first = pool.append(&vec![1u8; BYTE_BLOCK_SIZE - 3]);
        let second = pool.append(&[7, 8, 9, 10, 11]);

        assert_eq!(first, 0);
        assert_eq!(second, BYTE_BLOCK_SIZE - 3);
        assert_eq!(pool.bytes_allocated(), 2 * BYTE_BLOCK_SIZE);
        assert_eq!(pool.read(second, 5).unwrap(), vec![7, 8, 9, 10, 11]);
        assert!(pool.read(second, 6).is_none());

        pool.reset();
        assert_eq!(pool.position(), 0);
        assert_eq!(pool.bytes_allocated(), 0);
    }
}
