//! End-to-end scenarios exercising the engine over the simulated wire.
//!
//! Each scenario is an ordinary function with a `#[test]` wrapper so the
//! suites run under `cargo test` and can also be driven manually with
//! logging enabled.

mod support;

mod api_contracts;
mod close;
mod fast_open;
mod handshake;
mod lossy_transfer;
mod reassembly;
mod recovery;
mod zero_window;

pub use api_contracts::api_contracts;
pub use close::{abort_resets_the_peer, graceful_close};
pub use fast_open::fast_open_deferred_send;
pub use handshake::{refused_connection, three_way_handshake};
pub use lossy_transfer::lossy_transfer;
pub use reassembly::ordered_reassembly;
pub use recovery::fast_retransmit_recovers_a_loss;
pub use zero_window::zero_window_persist;
