//! The receive side: sequence space and the reassembly ring.

use crate::config::bitmap_bytes;
use crate::error::Error;

//     1          2          3
// ----------|----------|----------
//        RCV.NXT    RCV.NXT
//                  +RCV.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers allowed for new reception
// 3 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct ReceiveSequenceSpace {
    /// Initial receive sequence number
    pub irs: u32,
    /// Next sequence number expected on an incoming segment; the left edge
    /// of the receive window
    pub nxt: u32,
    /// The right edge of the window most recently advertised to the peer
    pub adv: u32,
}

/// Caller-provided receive memory, used as a byte ring with an out-of-order
/// bitmap in its tail.
///
/// The ring holds `capacity` data bytes; the remaining `⌈capacity/8⌉` bytes
/// of the provided storage track which positions past the contiguous head
/// have been filled by out-of-order arrivals. Position `i` of the ring owns
/// bit `i % 8` of bitmap byte `i / 8`. Bits are set by [`write_at`], cleared
/// as [`advance`] folds them into the contiguous region, and never exist
/// below `head + available`.
///
/// [`write_at`]: ReceiveBuffer::write_at
/// [`advance`]: ReceiveBuffer::advance
#[derive(Debug)]
pub struct ReceiveBuffer {
    storage: Vec<u8>,
    /// Data bytes the ring can hold; the bitmap lives at `capacity..`.
    capacity: usize,
    /// Ring index of the first byte the application has not consumed.
    head: usize,
    /// Contiguous bytes available to the application.
    available: usize,
    /// Bytes past the contiguous edge at which the end-of-stream marker
    /// sits, once a FIN has been sequenced.
    fin_offset: Option<usize>,
    /// Offset range (relative to the contiguous edge) of the most recent
    /// write, kept so the first SACK block reports the newest data.
    recent_write: Option<(usize, usize)>,
}

impl ReceiveBuffer {
    /// Adopts `storage`, splitting it into ring and bitmap. Fails if the
    /// storage cannot hold at least `min_ring` data bytes plus the bitmap
    /// that tracks them.
    pub fn new(storage: Vec<u8>, min_ring: usize) -> Result<Self, Error> {
        let total = storage.len();
        let mut capacity = total.saturating_sub(bitmap_bytes(total));
        while capacity > 0 && capacity + bitmap_bytes(capacity) > total {
            capacity -= 1;
        }
        if capacity < min_ring {
            return Err(Error::InvalidArgs);
        }
        let mut buffer = Self {
            storage,
            capacity,
            head: 0,
            available: 0,
            fin_offset: None,
            recent_write: None,
        };
        buffer.storage[buffer.capacity..].fill(0);
        Ok(buffer)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Contiguous bytes ready for the application.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Bytes of window to advertise: capacity not yet held for the
    /// application.
    pub fn window(&self) -> usize {
        self.capacity - self.available
    }

    /// Whether the end-of-stream marker has reached the contiguous edge.
    pub fn end_of_stream_reached(&self) -> bool {
        self.fin_offset == Some(0)
    }

    pub fn fin_offset(&self) -> Option<usize> {
        self.fin_offset
    }

    /// Records the end-of-stream marker `offset` bytes past the contiguous
    /// edge.
    pub fn mark_fin(&mut self, offset: usize) {
        if self.fin_offset.is_none() {
            self.fin_offset = Some(offset);
        }
    }

    /// Writes bytes starting `offset` past the contiguous edge, marking
    /// their positions filled. Bytes that would land outside the window are
    /// discarded. Returns how many bytes were stored.
    pub fn write_at(&mut self, offset: usize, text: impl Iterator<Item = u8>) -> usize {
        let window = self.window();
        let mut stored = 0;
        for (i, byte) in text.enumerate() {
            let position = offset + i;
            if position >= window {
                break;
            }
            let index = self.ring_index(self.available + position);
            self.storage[index] = byte;
            self.set_bit(index);
            stored += 1;
        }
        if stored > 0 {
            self.recent_write = Some((offset, offset + stored));
        }
        stored
    }

    /// Folds newly contiguous bytes into the available region, clearing
    /// their bitmap bits. Returns the number of bytes that became available.
    pub fn advance(&mut self) -> usize {
        let mut advanced = 0;
        loop {
            if self.fin_offset == Some(advanced) {
                break;
            }
            if self.available + advanced >= self.capacity {
                break;
            }
            let index = self.ring_index(self.available + advanced);
            if !self.get_bit(index) {
                break;
            }
            self.clear_bit(index);
            advanced += 1;
        }
        self.available += advanced;
        if let Some(fin) = self.fin_offset.as_mut() {
            *fin -= advanced;
        }
        self.shift_recent_write(advanced);
        advanced
    }

    /// Consumes `n` bytes from the head of the available region.
    pub fn commit(&mut self, n: usize) -> Result<(), Error> {
        if n > self.available {
            return Err(Error::InvalidArgs);
        }
        self.head = self.ring_index(n);
        self.available -= n;
        Ok(())
    }

    /// The available bytes as at most two slices; the second is nonempty
    /// only when the ring wraps.
    pub fn slices(&self) -> [&[u8]; 2] {
        let first_len = self.available.min(self.capacity - self.head);
        let first = &self.storage[self.head..self.head + first_len];
        let second = &self.storage[..self.available - first_len];
        [first, second]
    }

    /// Rotates the ring so the available bytes start at index zero and the
    /// first slice of [`slices`](ReceiveBuffer::slices) is the whole of them.
    pub fn contiguify(&mut self) {
        if self.head == 0 {
            return;
        }
        let head = self.head;
        let capacity = self.capacity;
        self.storage[..capacity].rotate_left(head);

        // Out-of-order positions move with the data; re-seat their bits.
        let set: Vec<usize> = (0..capacity).filter(|&i| self.get_bit(i)).collect();
        self.storage[capacity..].fill(0);
        for index in set {
            self.set_bit((index + capacity - head) % capacity);
        }
        self.head = 0;
    }

    /// Ranges of out-of-order bytes relative to the contiguous edge, the
    /// most recently written range first, at most `max` of them.
    pub fn sack_ranges(&self, max: usize) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        let limit = self.capacity - self.available;
        let mut i = 0;
        while i < limit && ranges.len() < max + 1 {
            if self.get_bit(self.ring_index(self.available + i)) {
                let start = i;
                while i < limit && self.get_bit(self.ring_index(self.available + i)) {
                    i += 1;
                }
                ranges.push((start, i));
            } else {
                i += 1;
            }
        }
        if let Some((recent_start, _)) = self.recent_write {
            if let Some(position) = ranges
                .iter()
                .position(|&(start, end)| start <= recent_start && recent_start < end)
            {
                ranges.swap(0, position);
            }
        }
        ranges.truncate(max);
        ranges
    }

    /// Clears all reassembly state so the storage can serve a new
    /// connection on the same endpoint.
    pub fn reset(&mut self) {
        self.head = 0;
        self.available = 0;
        self.fin_offset = None;
        self.recent_write = None;
        let capacity = self.capacity;
        self.storage[capacity..].fill(0);
    }

    /// Returns the underlying storage to the caller.
    pub fn into_storage(self) -> Vec<u8> {
        self.storage
    }

    fn ring_index(&self, offset: usize) -> usize {
        (self.head + offset) % self.capacity
    }

    fn get_bit(&self, index: usize) -> bool {
        self.storage[self.capacity + index / 8] & (1 << (index % 8)) != 0
    }

    fn set_bit(&mut self, index: usize) {
        self.storage[self.capacity + index / 8] |= 1 << (index % 8);
    }

    fn clear_bit(&mut self, index: usize) {
        self.storage[self.capacity + index / 8] &= !(1 << (index % 8));
    }

    fn shift_recent_write(&mut self, advanced: usize) {
        self.recent_write = self.recent_write.and_then(|(start, end)| {
            if end <= advanced {
                None
            } else {
                (start.saturating_sub(advanced), end - advanced).into()
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(total: usize) -> ReceiveBuffer {
        ReceiveBuffer::new(vec![0; total], 8).unwrap()
    }

    #[test]
    fn splits_storage_into_ring_and_bitmap() {
        let buffer = buffer(90);
        assert_eq!(buffer.capacity(), 80);
        assert_eq!(buffer.window(), 80);
    }

    #[test]
    fn rejects_storage_too_small_for_the_ring() {
        assert!(ReceiveBuffer::new(vec![0; 8], 8).is_err());
    }

    #[test]
    fn in_order_bytes_become_available() {
        let mut buffer = buffer(90);
        assert_eq!(buffer.write_at(0, b"hello".iter().copied()), 5);
        assert_eq!(buffer.advance(), 5);
        assert_eq!(buffer.available(), 5);
        assert_eq!(buffer.slices()[0], b"hello");
    }

    #[test]
    fn out_of_order_bytes_wait_for_the_gap() {
        let mut buffer = buffer(90);
        buffer.write_at(5, b"world".iter().copied());
        assert_eq!(buffer.advance(), 0);
        buffer.write_at(0, b"hello".iter().copied());
        assert_eq!(buffer.advance(), 10);
        assert_eq!(buffer.slices()[0], b"helloworld");
    }

    #[test]
    fn commit_frees_window_and_wraps() {
        let mut buffer = buffer(18); // capacity 16
        assert_eq!(buffer.capacity(), 16);
        buffer.write_at(0, b"0123456789".iter().copied());
        buffer.advance();
        buffer.commit(8).unwrap();
        assert_eq!(buffer.available(), 2);
        assert_eq!(buffer.window(), 14);

        // Write enough to wrap the ring.
        buffer.write_at(0, b"abcdefghijkl".iter().copied());
        buffer.advance();
        let [first, second] = buffer.slices();
        let mut collected = first.to_vec();
        collected.extend_from_slice(second);
        assert_eq!(collected, b"89abcdefghijkl");
    }

    #[test]
    fn contiguify_straightens_a_wrapped_ring() {
        let mut buffer = buffer(18);
        buffer.write_at(0, b"0123456789".iter().copied());
        buffer.advance();
        buffer.commit(8).unwrap();
        buffer.write_at(0, b"abcdefghijkl".iter().copied());
        buffer.advance();
        assert!(!buffer.slices()[1].is_empty());
        buffer.contiguify();
        assert_eq!(buffer.slices()[0], b"89abcdefghijkl");
        assert!(buffer.slices()[1].is_empty());
    }

    #[test]
    fn fin_stops_advance_and_reports_end_of_stream() {
        let mut buffer = buffer(90);
        buffer.write_at(0, b"bye".iter().copied());
        buffer.mark_fin(3);
        assert_eq!(buffer.advance(), 3);
        assert!(buffer.end_of_stream_reached());
        assert_eq!(buffer.advance(), 0);
    }

    #[test]
    fn sack_ranges_report_holes_newest_first() {
        let mut buffer = buffer(90);
        buffer.write_at(10, b"aaaa".iter().copied());
        buffer.write_at(20, b"bbbb".iter().copied());
        let ranges = buffer.sack_ranges(3);
        assert_eq!(ranges, vec![(20, 24), (10, 14)]);
    }

    #[test]
    fn writes_outside_the_window_are_discarded() {
        let mut buffer = buffer(18); // capacity 16
        let stored = buffer.write_at(14, b"xyz".iter().copied());
        assert_eq!(stored, 2);
    }
}
