//! A stalled reader drives the peer into persist mode; a window update
//! revives the flow.

use weft_core::ConnectFlags;

use super::support::{install_client, install_server, patterned, sim, SinkKind};

pub fn zero_window_persist() {
    crate::init_logging();
    let mut sim = sim(4);
    let server = install_server(&mut sim.b, SinkKind::Held);
    let payload = patterned(5_000);
    let (client, client_log) = install_client(
        &mut sim.a,
        Some(payload.clone()),
        false,
        ConnectFlags { no_fast_open: true },
    );

    // The server never reads, so the sender fills the window and stalls.
    // Leave enough virtual time for several persist expiries.
    sim.run_for(60_000);

    let capacity = 4096; // receive storage, part of it bitmap
    assert!(client_log.borrow().bytes_acked < payload.len());
    let server_records: Vec<_> = sim
        .log
        .iter()
        .filter(|record| record.src_port == super::support::SERVER_PORT)
        .collect();
    // The advertised window never exceeds the receive memory and
    // eventually pins at zero.
    assert!(server_records
        .iter()
        .all(|record| (record.wnd as usize) <= capacity));
    assert!(server_records.iter().any(|record| record.wnd == 0));
    // One-byte window probes went out.
    assert!(sim
        .log
        .iter()
        .any(|record| record.len == 1 && record.src_port != super::support::SERVER_PORT));

    // The reader finally drains its buffer; the window update restarts
    // the transfer and the rest of the payload flows.
    let mut delivered = Vec::new();
    loop {
        // Straightening the ring first means a single read covers it all.
        sim.b.tcp.receive_contiguify(server.endpoint).unwrap();
        let chain = sim.b.tcp.receive_by_reference(server.endpoint).unwrap();
        if chain.is_empty() {
            break;
        }
        assert!(chain.second.is_empty());
        delivered.extend(chain.iter());
        let taken = chain.len();
        sim.b.tcp.commit_receive(server.endpoint, taken).unwrap();
        sim.run_for(30_000);
    }

    assert_eq!(delivered, payload);
    assert_eq!(client_log.borrow().bytes_acked, payload.len());
    assert_eq!(client_log.borrow().send_done, 1);
}

#[cfg(test)]
mod tests {
    #[test]
    fn zero_window_persist() {
        super::zero_window_persist();
    }
}
