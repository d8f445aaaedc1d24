//! Fast open: `connect` records the peer and the first send carries the
//! SYN.

use weft_core::{ConnectFlags, LinkedBuffer, SendFlags, State};

use super::support::{install_client, install_server, sim, SinkKind};

pub fn fast_open_deferred_send() {
    crate::init_logging();
    let mut sim = sim(2);
    let server = install_server(&mut sim.b, SinkKind::Auto);
    let (client, client_log) = install_client(&mut sim.a, None, false, ConnectFlags::default());

    // The connect itself puts nothing on the wire.
    sim.run_for(2_000);
    assert!(sim.log.is_empty());
    assert_eq!(sim.a.tcp.endpoint_state(client).unwrap(), None);

    // The first send triggers the handshake, data on the SYN.
    sim.a
        .tcp
        .send_by_reference(client, LinkedBuffer::new(b"hi"), SendFlags::default())
        .unwrap();
    sim.run_for(5_000);

    let syn = &sim.log[0];
    assert!(syn.syn);
    assert_eq!(syn.len, 2);

    assert_eq!(
        sim.a.tcp.endpoint_state(client).unwrap(),
        Some(State::Established)
    );
    assert_eq!(client_log.borrow().established, 1);
    assert_eq!(client_log.borrow().send_done, 1);
    assert_eq!(server.log.borrow().received, b"hi");
}

#[cfg(test)]
mod tests {
    #[test]
    fn fast_open_deferred_send() {
        super::fast_open_deferred_send();
    }
}
