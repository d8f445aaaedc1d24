//! The send side: sequence space, congestion variables, and the queue of
//! caller-owned linked buffers.

use std::collections::VecDeque;

use crate::error::Error;
use crate::message::{Chunk, Message};

use super::seq::mod_leq;

//      1         2          3          4
// ----------|----------|----------|----------
//        SND.UNA    SND.NXT    SND.UNA
//                             +SND.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers of unacknowledged data
// 3 - sequence numbers allowed for new data transmission (send window)
// 4 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct SendSequenceSpace {
    /// Initial send sequence number
    pub iss: u32,
    /// Oldest unacknowledged sequence number
    pub una: u32,
    /// Next sequence number to be sent
    pub nxt: u32,
    /// Highest sequence number ever sent; `nxt` falls below this during
    /// retransmission
    pub max: u32,
    /// The peer's advertised window, scaled
    pub wnd: u32,
    /// Segment sequence number used for last window update
    pub wl1: u32,
    /// Segment acknowledgment number used for last window update
    pub wl2: u32,
    /// The largest window the peer has ever advertised
    pub max_wnd: u32,
    /// Congestion window
    pub cwnd: u32,
    /// Slow-start threshold
    pub ssthresh: u32,
    /// Consecutive duplicate acknowledgments seen
    pub dup_acks: u8,
    /// `snd.max` at the moment fast retransmit began; acknowledgments below
    /// this are partial during NewReno recovery
    pub recover: u32,
}

impl SendSequenceSpace {
    /// Bytes (and control bits) in flight.
    pub fn flight_size(&self) -> u32 {
        self.nxt.wrapping_sub(self.una)
    }

    /// Whether everything sent has been acknowledged.
    pub fn all_acked(&self) -> bool {
        self.una == self.max
    }

    /// Whether our SYN has been acknowledged yet.
    pub fn syn_acked(&self) -> bool {
        !mod_leq(self.una, self.iss)
    }

    /// The sequence number of the first byte in the send queue.
    pub fn data_start(&self) -> u32 {
        if self.syn_acked() {
            self.una
        } else {
            self.iss.wrapping_add(1)
        }
    }

    /// Whether NewReno fast recovery is in progress.
    pub fn in_recovery(&self) -> bool {
        self.dup_acks >= super::DUP_ACK_THRESHOLD
    }
}

/// A caller-owned byte range handed to the stack for transmission.
///
/// The stack never copies or mutates the referenced bytes; it slices views
/// of the same allocation into outbound segments. The exact buffer comes
/// back through the send-done event once every byte it covers has been
/// acknowledged (or the connection is torn down), and
/// [`shares_storage`](Chunk::shares_storage) lets the application recognize
/// it.
#[derive(Debug, Clone)]
pub struct LinkedBuffer {
    chunk: Chunk,
}

impl LinkedBuffer {
    /// Wraps a byte region, all of it active.
    pub fn new(data: impl Into<Chunk>) -> Self {
        Self { chunk: data.into() }
    }

    /// Wraps a byte region with only the first `len` bytes active. The rest
    /// can be activated later through `send_by_extension`.
    pub fn with_prefix(data: impl Into<Chunk>, len: usize) -> Self {
        let chunk: Chunk = data.into();
        let len = len.min(chunk.len());
        Self {
            chunk: chunk.view(0, len),
        }
    }

    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    fn view(&self, start: usize, len: usize) -> Chunk {
        self.chunk.view(start, len)
    }
}

/// A fully acknowledged or torn-down linked buffer on its way back to the
/// application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte of the buffer was acknowledged by the peer.
    Acked,
    /// The connection was aborted; delivery is unknown.
    Aborted,
}

/// The chain of linked buffers awaiting transmission and acknowledgment.
///
/// The queue always begins at the first unacknowledged byte: acknowledged
/// prefixes are trimmed eagerly, and fully covered links are detached in
/// order for return to the application.
#[derive(Debug, Default)]
pub struct SendQueue {
    links: VecDeque<LinkedBuffer>,
    /// Bytes of the head link that have been acknowledged.
    head_acked: usize,
    /// Unacknowledged bytes across all links.
    len: usize,
}

impl SendQueue {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, link: LinkedBuffer) {
        self.len += link.len();
        self.links.push_back(link);
    }

    /// Grows the final link by `n` bytes. Fails if the queue is empty or the
    /// link's allocation cannot hold `n` more bytes.
    pub fn extend_tail(&mut self, n: usize) -> Result<(), Error> {
        let tail = self.links.back_mut().ok_or(Error::InvalidState)?;
        if !tail.chunk.widen(n) {
            return Err(Error::InvalidArgs);
        }
        self.len += n;
        Ok(())
    }

    /// Collects `len` bytes starting `offset` past the first unacknowledged
    /// byte into a message of borrowed views. Panics if the range runs off
    /// the queue; callers bound it by `len()`.
    pub fn peek(&self, offset: usize, len: usize) -> Message {
        debug_assert!(offset + len <= self.len);
        let mut message = Message::default();
        let mut skip = self.head_acked + offset;
        let mut remaining = len;
        for link in &self.links {
            if remaining == 0 {
                break;
            }
            if skip >= link.len() {
                skip -= link.len();
                continue;
            }
            let take = remaining.min(link.len() - skip);
            message.push_chunk(link.view(skip, take));
            remaining -= take;
            skip = 0;
        }
        debug_assert_eq!(remaining, 0);
        message
    }

    /// Consumes `n` acknowledged bytes from the front, returning each link
    /// that became fully acknowledged, in order.
    pub fn ack(&mut self, n: usize) -> Vec<LinkedBuffer> {
        debug_assert!(n <= self.len);
        self.len -= n;
        let mut remaining = n;
        let mut done = Vec::new();
        while remaining > 0 {
            let head_len = self.links[0].len() - self.head_acked;
            if remaining >= head_len {
                remaining -= head_len;
                self.head_acked = 0;
                done.push(self.links.pop_front().unwrap());
            } else {
                self.head_acked += remaining;
                remaining = 0;
            }
        }
        done
    }

    /// Empties the queue, returning every remaining link in order. Used by
    /// abort paths, where partially acknowledged links also go back to the
    /// application.
    pub fn drain(&mut self) -> Vec<LinkedBuffer> {
        self.len = 0;
        self.head_acked = 0;
        self.links.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(bytes: &[u8]) -> LinkedBuffer {
        LinkedBuffer::new(bytes)
    }

    #[test]
    fn peek_crosses_link_boundaries() {
        let mut queue = SendQueue::default();
        queue.push(link(b"abc"));
        queue.push(link(b"defg"));
        assert_eq!(queue.peek(1, 5).to_vec(), b"bcdef");
    }

    #[test]
    fn ack_detaches_links_in_order() {
        let mut queue = SendQueue::default();
        let first = link(b"abc");
        let second = link(b"defg");
        let first_chunk = first.chunk().clone();
        queue.push(first);
        queue.push(second);

        let done = queue.ack(2);
        assert!(done.is_empty());
        assert_eq!(queue.len(), 5);

        let done = queue.ack(3);
        assert_eq!(done.len(), 1);
        assert!(done[0].chunk().shares_storage(&first_chunk));
        assert_eq!(queue.peek(0, queue.len()).to_vec(), b"efg");
    }

    #[test]
    fn extend_tail_activates_reserved_bytes() {
        let mut queue = SendQueue::default();
        queue.push(LinkedBuffer::with_prefix(b"hello world", 5));
        assert_eq!(queue.len(), 5);
        queue.extend_tail(6).unwrap();
        assert_eq!(queue.len(), 11);
        assert_eq!(queue.peek(0, 11).to_vec(), b"hello world");
    }

    #[test]
    fn extend_tail_requires_a_tail() {
        let mut queue = SendQueue::default();
        assert_eq!(queue.extend_tail(1), Err(Error::InvalidState));
    }

    #[test]
    fn extend_tail_is_bounded_by_the_allocation() {
        let mut queue = SendQueue::default();
        queue.push(link(b"full"));
        assert_eq!(queue.extend_tail(1), Err(Error::InvalidArgs));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn drain_returns_everything() {
        let mut queue = SendQueue::default();
        queue.push(link(b"abc"));
        queue.push(link(b"def"));
        queue.ack(1);
        let links = queue.drain();
        assert_eq!(links.len(), 2);
        assert!(queue.is_empty());
    }
}
