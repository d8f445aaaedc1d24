//! The plain three-way handshake with fast open disabled, and the refused
//! variant.

use weft_core::{ConnectFlags, DisconnectReason, SocketAddr, State};

use crate::applications::Refuser;
use crate::wire::NODE_B_ADDR;

use super::support::{install_client, install_server, sim, SinkKind, SERVER_PORT};

pub fn three_way_handshake() {
    crate::init_logging();
    let mut sim = sim(1);
    let server = install_server(&mut sim.b, SinkKind::Auto);
    let (client, client_log) = install_client(
        &mut sim.a,
        None,
        false,
        ConnectFlags { no_fast_open: true },
    );

    sim.run_for(5_000);

    // On-wire: SYN(X), SYN+ACK(Y, X+1), ACK(X+1, Y+1).
    let syn = &sim.log[0];
    assert!(syn.syn && !syn.ack_flag);
    let x = syn.seq;

    let syn_ack = &sim.log[1];
    assert!(syn_ack.syn && syn_ack.ack_flag);
    assert_eq!(syn_ack.ack, x.wrapping_add(1));
    let y = syn_ack.seq;

    let ack = &sim.log[2];
    assert!(ack.ack_flag && !ack.syn);
    assert_eq!(ack.seq, x.wrapping_add(1));
    assert_eq!(ack.ack, y.wrapping_add(1));

    // Both ends settle in ESTABLISHED and each side heard about it once.
    assert_eq!(
        sim.a.tcp.endpoint_state(client).unwrap(),
        Some(State::Established)
    );
    assert_eq!(
        sim.b.tcp.endpoint_state(server.endpoint).unwrap(),
        Some(State::Established)
    );
    assert_eq!(client_log.borrow().established, 1);
    assert_eq!(server.log.borrow().established, 1);

    // The listener learned the outcome too.
    let accepts = server.accepts.borrow();
    assert_eq!(accepts.ready_calls, 1);
    assert_eq!(accepts.done.len(), 1);
    assert_eq!(accepts.done[0].0, server.endpoint);
}

/// A listener that answers REFUSE resets the connection request.
pub fn refused_connection() {
    crate::init_logging();
    let mut sim = sim(11);
    let listener = sim
        .b
        .tcp
        .initialize_listener(Box::new(Refuser))
        .expect("listener");
    sim.b
        .tcp
        .listen(listener, SocketAddr::new(NODE_B_ADDR, SERVER_PORT))
        .expect("listen");
    let (client, client_log) = install_client(
        &mut sim.a,
        None,
        false,
        ConnectFlags { no_fast_open: true },
    );

    sim.run_for(5_000);

    assert!(sim.log.iter().any(|record| record.rst));
    assert_eq!(
        client_log.borrow().disconnects,
        vec![DisconnectReason::Refused]
    );
    assert_eq!(sim.a.tcp.endpoint_state(client).unwrap(), None);
}

#[cfg(test)]
mod tests {
    #[test]
    fn three_way_handshake() {
        super::three_way_handshake();
    }

    #[test]
    fn refused_connection() {
        super::refused_connection();
    }
}
