//! Shared scenario plumbing.

use weft_core::{Config, ConnectFlags, EndpointId, ListenerId, SocketAddr};

use crate::applications::{
    shared, AcceptLog, Acceptor, EndpointLog, Shared, StreamClient, StreamSink,
};
use crate::wire::{Node, Sim, NODE_B_ADDR};

pub const SERVER_PORT: u16 = 4433;
pub const RECEIVE_BUFFER: usize = 4096;

/// The scenario configuration: a mesh-sized MSS so a few hundred bytes
/// already spread over several segments.
pub fn config() -> Config {
    Config {
        default_mss: 100,
        ..Config::default()
    }
}

pub enum SinkKind {
    /// Reads and commits everything as it arrives.
    Auto,
    /// Reads everything and closes its own side at end of stream.
    Closing,
    /// Leaves data unread so the advertised window shrinks.
    Held,
}

pub struct ServerSide {
    pub listener: ListenerId,
    pub endpoint: EndpointId,
    pub log: Shared<EndpointLog>,
    pub accepts: Shared<AcceptLog>,
}

/// Puts a one-connection server on `node`: an initialized endpoint in the
/// accept pool and a listener on [`SERVER_PORT`].
pub fn install_server(node: &mut Node, kind: SinkKind) -> ServerSide {
    let log = shared::<EndpointLog>();
    let sink = match kind {
        SinkKind::Auto => StreamSink::new(log.clone()),
        SinkKind::Closing => StreamSink::closing(log.clone()),
        SinkKind::Held => StreamSink::held(log.clone()),
    };
    let endpoint = node
        .tcp
        .initialize_endpoint(vec![0; RECEIVE_BUFFER], Box::new(sink))
        .expect("server endpoint");
    let accepts = shared::<AcceptLog>();
    let listener = node
        .tcp
        .initialize_listener(Box::new(Acceptor::new(vec![endpoint], accepts.clone())))
        .expect("server listener");
    node.tcp
        .listen(listener, SocketAddr::new(NODE_B_ADDR, SERVER_PORT))
        .expect("listen");
    ServerSide {
        listener,
        endpoint,
        log,
        accepts,
    }
}

/// Puts a client on `node` that will push `payload` once established (or
/// stay idle when `None`) and connects it to the server.
pub fn install_client(
    node: &mut Node,
    payload: Option<Vec<u8>>,
    close_after_send: bool,
    flags: ConnectFlags,
) -> (EndpointId, Shared<EndpointLog>) {
    let log = shared::<EndpointLog>();
    let client = match payload {
        Some(payload) => StreamClient::new(log.clone(), payload, close_after_send),
        None => StreamClient::idle(log.clone()),
    };
    let endpoint = node
        .tcp
        .initialize_endpoint(vec![0; RECEIVE_BUFFER], Box::new(client))
        .expect("client endpoint");
    node.tcp
        .connect(endpoint, SocketAddr::new(NODE_B_ADDR, SERVER_PORT), flags)
        .expect("connect");
    (endpoint, log)
}

/// A patterned payload that makes reordering mistakes visible.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// A fresh simulation with both sides configured for the scenarios.
pub fn sim(seed: u64) -> Sim {
    Sim::new(config(), seed)
}
