//! The seam between the engine and its embedding.
//!
//! The engine never talks to the network, a clock, or a timer wheel
//! directly. The host hands all three in through this trait and drives the
//! engine from a single execution context: application calls, received
//! datagrams, and timer expiries all happen serially and none may block.

use crate::ip6::Ipv6Address;
use crate::message::Message;
use crate::tcp::EndpointId;
use crate::tcp::TimerSlot;

/// Addressing metadata for one IPv6 datagram. The next header is always TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramInfo {
    pub source: Ipv6Address,
    pub destination: Ipv6Address,
}

/// The engine could not hand a datagram to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("datagram emission failed")]
pub struct SendDatagramError;

/// Services the embedding provides to the engine.
pub trait Host {
    /// Emits one TCP segment as an IPv6 datagram.
    fn send_datagram(
        &mut self,
        message: Message,
        info: &DatagramInfo,
    ) -> Result<(), SendDatagramError>;

    /// Chooses a source address for reaching `peer`, or `None` if the node
    /// has no route.
    fn select_source_address(&mut self, peer: Ipv6Address) -> Option<Ipv6Address>;

    /// Milliseconds of monotonic time. Wraps modulo 2^32.
    fn now_millis(&mut self) -> u32;

    /// Arms a one-shot timer. The host must call
    /// [`Tcp::handle_timer`](crate::tcp::Tcp::handle_timer) with the same
    /// identifiers exactly once after `delay_ms`, unless the slot is
    /// re-armed or cancelled first. Re-arming replaces the pending expiry.
    fn arm_timer(&mut self, endpoint: EndpointId, slot: TimerSlot, delay_ms: u32);

    /// Cancels a previously armed timer. Cancelling an idle slot is a no-op.
    fn cancel_timer(&mut self, endpoint: EndpointId, slot: TimerSlot);

    /// Produces an empty outbound message container. Hosts that pool message
    /// storage can override this.
    fn new_message(&mut self) -> Message {
        Message::default()
    }

    /// Releases an inbound message the engine has finished with.
    fn free_message(&mut self, message: Message) {
        drop(message);
    }
}
