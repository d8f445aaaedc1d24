//! Graceful close in both directions, TIME-WAIT included.

use weft_core::{ConnectFlags, DisconnectReason};

use super::support::{install_client, install_server, patterned, sim, SinkKind};

pub fn graceful_close() {
    crate::init_logging();
    let mut sim = sim(6);
    let server = install_server(&mut sim.b, SinkKind::Closing);
    let payload = patterned(250);
    let (client, client_log) = install_client(
        &mut sim.a,
        Some(payload.clone()),
        true,
        ConnectFlags { no_fast_open: true },
    );

    // Data, FIN, the answering FIN, and the last acknowledgments all fit
    // well inside this window; TIME-WAIT does not expire yet.
    sim.run_for(30_000);

    assert_eq!(server.log.borrow().received, payload);
    assert!(server.log.borrow().end_of_stream);
    assert_eq!(
        server.log.borrow().disconnects,
        vec![DisconnectReason::Normal]
    );
    assert_eq!(
        client_log.borrow().disconnects,
        vec![DisconnectReason::TimeWait]
    );
    assert_eq!(
        sim.a.tcp.endpoint_state(client).unwrap(),
        Some(weft_core::State::TimeWait)
    );

    // Two maximum segment lifetimes later the quarantine lifts.
    sim.run_for(61_000);
    assert_eq!(
        client_log.borrow().disconnects,
        vec![DisconnectReason::TimeWait, DisconnectReason::Normal]
    );
    assert_eq!(sim.a.tcp.endpoint_state(client).unwrap(), None);
}

/// An abort tears both sides down with RESET and returns queued buffers.
pub fn abort_resets_the_peer() {
    crate::init_logging();
    let mut sim = sim(60);
    let server = install_server(&mut sim.b, SinkKind::Auto);
    let (client, client_log) = install_client(
        &mut sim.a,
        None,
        false,
        ConnectFlags { no_fast_open: true },
    );
    sim.run_for(5_000);

    // Queue data and abort before any acknowledgment can arrive.
    sim.a
        .tcp
        .send_by_reference(
            client,
            weft_core::LinkedBuffer::new(patterned(200)),
            weft_core::SendFlags::default(),
        )
        .unwrap();
    sim.a.tcp.abort(client).unwrap();

    {
        let log = client_log.borrow();
        assert_eq!(log.disconnects, vec![DisconnectReason::Reset]);
        assert_eq!(log.aborted_sends, 1);
    }
    assert_eq!(sim.a.tcp.endpoint_state(client).unwrap(), None);

    // The reset reaches the peer behind the in-flight data.
    sim.run_for(5_000);
    assert!(sim.log.iter().any(|record| record.rst));
    assert_eq!(
        server.log.borrow().disconnects,
        vec![DisconnectReason::Reset]
    );
}

#[cfg(test)]
mod tests {
    #[test]
    fn graceful_close() {
        super::graceful_close();
    }

    #[test]
    fn abort_resets_the_peer() {
        super::abort_resets_the_peer();
    }
}
