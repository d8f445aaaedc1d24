//! Out-of-order delivery reassembles into the original byte stream.

use weft_core::{ConnectFlags, LinkedBuffer, SendFlags};

use super::support::{install_client, install_server, patterned, sim, SinkKind};

pub fn ordered_reassembly() {
    crate::init_logging();
    let mut sim = sim(3);
    let server = install_server(&mut sim.b, SinkKind::Auto);
    let (client, _client_log) = install_client(
        &mut sim.a,
        None,
        false,
        ConnectFlags { no_fast_open: true },
    );
    sim.run_for(5_000);

    // Three segments' worth of data, shuttled by hand: second, third,
    // then first.
    let payload = patterned(300);
    sim.a
        .tcp
        .send_by_reference(client, LinkedBuffer::new(payload.clone()), SendFlags::default())
        .unwrap();
    let mut outbox = sim.a.take_outbox();
    assert_eq!(outbox.len(), 3);
    let first = outbox.remove(0);
    for (message, info) in outbox {
        sim.b.deliver(message, &info);
    }
    sim.b.deliver(first.0, &first.1);

    // Everything arrived as one contiguous run.
    let log = server.log.borrow();
    assert!(log.receive_events.contains(&(300, false)));
    assert_eq!(log.received, payload);
    drop(log);

    // Let the acknowledgments drain back.
    sim.run_for(5_000);
    assert!(sim.a.tcp.endpoint_state(client).unwrap().is_some());
}

#[cfg(test)]
mod tests {
    #[test]
    fn ordered_reassembly() {
        super::ordered_reassembly();
    }
}
