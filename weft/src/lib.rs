//! Host harness for the `weft-core` TCP engine: an in-memory IPv6 wire
//! with a virtual clock, impairment controls (loss and reordering jitter),
//! observer applications, and end-to-end scenario suites.
//!
//! Everything here is synchronous and deterministic: time only moves when
//! the simulation advances it, and all randomness flows from a seed, so a
//! failing scenario replays exactly.

pub mod applications;
pub mod simulations;
pub mod wire;

use tracing::Level;

/// Installs a terse subscriber for simulation logs. Safe to call from
/// every test; only the first call wins.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}
