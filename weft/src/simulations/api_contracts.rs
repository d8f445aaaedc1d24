//! The operation contracts: argument validation, state preconditions,
//! idempotence, and resource return.

use weft_core::{
    ConnectFlags, Error, Ipv6Address, LinkedBuffer, SendFlags, SocketAddr,
};

use crate::applications::{shared, Acceptor, EndpointLog, StreamSink};
use crate::wire::{Node, NODE_A_ADDR, NODE_B_ADDR};

use super::support::{config, RECEIVE_BUFFER};

fn endpoint(node: &mut Node) -> (weft_core::EndpointId, crate::applications::Shared<EndpointLog>) {
    let log = shared::<EndpointLog>();
    let id = node
        .tcp
        .initialize_endpoint(vec![0; RECEIVE_BUFFER], Box::new(StreamSink::new(log.clone())))
        .unwrap();
    (id, log)
}

pub fn api_contracts() {
    crate::init_logging();
    let mut node = Node::new(NODE_A_ADDR, config(), 42);

    // Initialization wants enough memory for a segment plus bookkeeping.
    let log = shared::<EndpointLog>();
    assert_eq!(
        node.tcp
            .initialize_endpoint(vec![0; 16], Box::new(StreamSink::new(log)))
            .unwrap_err(),
        Error::InvalidArgs
    );

    // Bind rejects the unspecified address and port zero outright.
    let (first, _) = endpoint(&mut node);
    assert_eq!(
        node.tcp
            .bind(first, SocketAddr::new(Ipv6Address::UNSPECIFIED, 80))
            .unwrap_err(),
        Error::InvalidArgs
    );
    assert_eq!(
        node.tcp
            .bind(first, SocketAddr::new(NODE_A_ADDR, 0))
            .unwrap_err(),
        Error::InvalidArgs
    );
    node.tcp.bind(first, SocketAddr::new(NODE_A_ADDR, 80)).unwrap();

    // The same specific binding conflicts; a different port does not.
    let (second, _) = endpoint(&mut node);
    assert_eq!(
        node.tcp
            .bind(second, SocketAddr::new(NODE_A_ADDR, 80))
            .unwrap_err(),
        Error::InvalidState
    );
    node.tcp.bind(second, SocketAddr::new(NODE_A_ADDR, 81)).unwrap();

    // A wildcard listener conflicts with any specific holder of the port,
    // and vice versa.
    let listener = node
        .tcp
        .initialize_listener(Box::new(Acceptor::new(vec![], shared())))
        .unwrap();
    assert_eq!(
        node.tcp
            .listen(listener, SocketAddr::new(Ipv6Address::UNSPECIFIED, 80))
            .unwrap_err(),
        Error::InvalidState
    );
    node.tcp
        .listen(listener, SocketAddr::new(Ipv6Address::UNSPECIFIED, 4000))
        .unwrap();
    let (third, _) = endpoint(&mut node);
    assert_eq!(
        node.tcp
            .bind(third, SocketAddr::new(NODE_A_ADDR, 4000))
            .unwrap_err(),
        Error::InvalidState
    );

    // Stopping twice is a quiet success; deinitializing twice is not.
    node.tcp.stop_listening(listener).unwrap();
    node.tcp.stop_listening(listener).unwrap();
    node.tcp.deinitialize_listener(listener).unwrap();
    assert_eq!(
        node.tcp.deinitialize_listener(listener).unwrap_err(),
        Error::InvalidState
    );

    // Receive operations need a connection too.
    assert_eq!(
        node.tcp.receive_by_reference(first).unwrap_err(),
        Error::InvalidState
    );
    assert_eq!(
        node.tcp.receive_contiguify(first).unwrap_err(),
        Error::InvalidState
    );

    // Sends need a connection; extensions need a queue.
    assert_eq!(
        node.tcp
            .send_by_reference(first, LinkedBuffer::new(b"x"), SendFlags::default())
            .unwrap_err(),
        Error::InvalidState
    );
    assert_eq!(
        node.tcp.send_by_extension(first, 0, SendFlags::default()).unwrap_err(),
        Error::InvalidArgs
    );
    assert_eq!(
        node.tcp.send_by_extension(first, 4, SendFlags::default()).unwrap_err(),
        Error::InvalidState
    );

    // Connect validates its peer and refuses a second connect.
    assert_eq!(
        node.tcp
            .connect(
                first,
                SocketAddr::new(Ipv6Address::UNSPECIFIED, 99),
                ConnectFlags::default()
            )
            .unwrap_err(),
        Error::InvalidArgs
    );
    node.tcp
        .connect(
            first,
            SocketAddr::new(NODE_B_ADDR, 99),
            ConnectFlags::default(),
        )
        .unwrap();
    assert_eq!(
        node.tcp
            .connect(
                first,
                SocketAddr::new(NODE_B_ADDR, 99),
                ConnectFlags::default()
            )
            .unwrap_err(),
        Error::InvalidState
    );

    // Deinitialize returns the adopted memory exactly once; the handle is
    // dead afterwards.
    let reclaimed = node.tcp.deinitialize_endpoint(second).unwrap();
    assert_eq!(reclaimed.receive_storage.len(), RECEIVE_BUFFER);
    assert!(reclaimed.send_buffers.is_empty());
    assert_eq!(
        node.tcp.deinitialize_endpoint(second).unwrap_err(),
        Error::InvalidState
    );
    assert_eq!(node.tcp.endpoint_state(second).unwrap_err(), Error::InvalidArgs);
}

#[cfg(test)]
mod tests {
    #[test]
    fn api_contracts() {
        super::api_contracts();
    }
}
