use std::sync::Arc;

// Chunks wrap an `Arc<[u8]>` together with a window into it. Cloning a chunk
// never copies payload bytes, which is what lets segment text, retransmitted
// ranges, and caller-owned send links all refer to one allocation.

/// A contiguous piece of a [`Message`](super::Message).
#[derive(Debug, Clone)]
pub struct Chunk {
    pub(super) start: usize,
    pub(super) end: usize,
    pub(super) bytes: Arc<[u8]>,
}

impl Chunk {
    /// Returns a new chunk containing the given bytes.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            start: 0,
            end: bytes.len(),
            bytes,
        }
    }

    /// The visible bytes of the chunk.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }

    /// The number of visible bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The capacity of the backing allocation. A chunk created over a prefix
    /// of a larger buffer can later be widened up to this bound.
    pub fn storage_len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns a chunk viewing `range` within this chunk's visible bytes,
    /// sharing the same allocation.
    pub fn view(&self, start: usize, len: usize) -> Self {
        assert!(start + len <= self.len());
        Self {
            start: self.start + start,
            end: self.start + start + len,
            bytes: self.bytes.clone(),
        }
    }

    /// Grows the visible window by `n` bytes into the backing allocation.
    /// Fails without changing anything if the allocation is too small.
    pub fn widen(&mut self, n: usize) -> bool {
        if self.end + n <= self.bytes.len() {
            self.end += n;
            true
        } else {
            false
        }
    }

    /// Whether two chunks are backed by the same allocation. This is identity,
    /// not equality: the application uses it to recognize a buffer it handed
    /// to the stack when the buffer comes back.
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice().eq(other.as_slice())
    }
}

impl Eq for Chunk {}

impl From<Vec<u8>> for Chunk {
    fn from(vector: Vec<u8>) -> Self {
        Self::new(vector)
    }
}

impl From<&[u8]> for Chunk {
    fn from(slice: &[u8]) -> Self {
        Self::new(slice.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(array: &[u8; N]) -> Self {
        Self::new(array.to_vec())
    }
}
