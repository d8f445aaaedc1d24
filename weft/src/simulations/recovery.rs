//! A single dropped segment is repaired by fast retransmit, not a
//! timeout.

use weft_core::ConnectFlags;

use super::support::{install_client, install_server, patterned, sim, SinkKind};

pub fn fast_retransmit_recovers_a_loss() {
    crate::init_logging();
    let mut sim = sim(5);
    let server = install_server(&mut sim.b, SinkKind::Auto);
    // Six segments: enough survivors past the hole for three duplicate
    // acknowledgments.
    let payload = patterned(600);
    let (_client, client_log) = install_client(
        &mut sim.a,
        Some(payload.clone()),
        false,
        ConnectFlags { no_fast_open: true },
    );

    // Exactly one casualty: the second data-bearing segment.
    sim.set_drop_filter(|_, ordinal| ordinal == 2);

    // Well under the one-second retransmission floor: recovery has to
    // come from duplicate acknowledgments.
    sim.run_for(900);

    assert_eq!(server.log.borrow().received, payload);
    assert_eq!(client_log.borrow().bytes_acked, payload.len());

    // The lost range went out twice: once dropped, once retransmitted.
    let data_seqs: Vec<u32> = sim
        .log
        .iter()
        .filter(|record| record.len > 0)
        .map(|record| record.seq)
        .collect();
    let retransmitted = data_seqs
        .iter()
        .any(|seq| data_seqs.iter().filter(|&&other| other == *seq).count() >= 2);
    assert!(retransmitted, "expected a retransmission in the wire log");
}

#[cfg(test)]
mod tests {
    #[test]
    fn fast_retransmit_recovers_a_loss() {
        super::fast_retransmit_recovers_a_loss();
    }
}
