//! A user-space TCP engine for IPv6, built for constrained mesh nodes.
//!
//! # Uses
//!
//! - Host networking frameworks embed the engine as their TCP layer: they
//!   deliver inbound IPv6 datagrams, drive one-shot timers, and accept
//!   outbound datagrams, all on a single cooperative execution context.
//! - Applications talk to the engine through zero-copy operations: sends
//!   hand over caller-owned [`LinkedBuffer`]s that come back once
//!   acknowledged, and receives expose the reassembly ring directly.
//!
//! # Organization
//!
//! - [`message`] provides the shared byte containers ([`Message`],
//!   [`message::Chunk`]) that keep payload bytes uncopied end to end
//! - [`tcp::Tcp`] is the engine: registries, application operations, and
//!   segment/timer demultiplexing
//! - [`tcp::tcb`] holds the per-connection state machine
//! - [`Host`] is the seam to the embedding; [`Config`] enumerates the
//!   tunables
//!
//! The engine never allocates behind the application's back for payload
//! data: receive memory is adopted at endpoint initialization and send
//! buffers remain application property merely lent to the stack.

pub mod message;
pub use message::Message;

pub mod ip6;
pub use ip6::{Endpoints, Ipv6Address, SocketAddr};

mod error;
pub use error::Error;

pub mod config;
pub use config::Config;

pub mod host;
pub use host::{DatagramInfo, Host, SendDatagramError};

pub mod tcp;
pub use tcp::{
    AcceptDecision, ConnectFlags, DisconnectReason, EndpointId, EndpointObserver, LinkedBuffer,
    ListenerId, ListenerObserver, ReceiveChain, Reclaimed, SendFlags, SendOutcome, State, Tcp,
    TimerSlot,
};
