//! The round-trip property: whatever the wire does short of partitioning
//! it, the byte stream arrives intact and in order.

use weft_core::ConnectFlags;

use super::support::{install_client, install_server, patterned, sim, SinkKind};

pub fn lossy_transfer() {
    crate::init_logging();
    for seed in [7, 8, 9] {
        let mut sim = sim(seed);
        let server = install_server(&mut sim.b, SinkKind::Auto);
        let payload = patterned(5_000);
        let (_client, client_log) = install_client(
            &mut sim.a,
            Some(payload.clone()),
            false,
            ConnectFlags { no_fast_open: true },
        );

        // One segment in ten vanishes and jitter beyond the base latency
        // reorders the survivors.
        sim.set_impairments(0.10, 40);
        sim.run_for(600_000);

        assert_eq!(
            server.log.borrow().received,
            payload,
            "stream corrupted at seed {seed}"
        );
        assert_eq!(client_log.borrow().bytes_acked, payload.len());
        assert_eq!(client_log.borrow().send_done, 1);
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn lossy_transfer() {
        super::lossy_transfer();
    }
}
