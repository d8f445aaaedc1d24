//! Observer applications used by the simulation scenarios.
//!
//! Each application keeps its results in shared state so the scenario can
//! inspect them after the run; the observers themselves are consumed by
//! the engine.

use std::cell::RefCell;
use std::rc::Rc;

use weft_core::{
    AcceptDecision, DisconnectReason, EndpointId, EndpointObserver, LinkedBuffer, ListenerId,
    ListenerObserver, SendFlags, SendOutcome, SocketAddr, Tcp,
};

use crate::wire::SimHost;

pub type Shared<T> = Rc<RefCell<T>>;

pub fn shared<T: Default>() -> Shared<T> {
    Rc::new(RefCell::new(T::default()))
}

/// Everything a scenario might want to know about one endpoint's life.
#[derive(Debug, Default)]
pub struct EndpointLog {
    pub established: usize,
    pub send_done: usize,
    pub aborted_sends: usize,
    pub bytes_acked: usize,
    pub send_ready: usize,
    pub received: Vec<u8>,
    pub end_of_stream: bool,
    pub disconnects: Vec<DisconnectReason>,
    pub window_seen: Vec<usize>,
    /// `(available, end_of_stream)` per receive-available callback.
    pub receive_events: Vec<(usize, bool)>,
}

/// Connects, pushes one payload, optionally closes once it is all
/// acknowledged.
pub struct StreamClient {
    pub log: Shared<EndpointLog>,
    pub payload: Option<Vec<u8>>,
    pub close_after_send: bool,
}

impl StreamClient {
    pub fn new(log: Shared<EndpointLog>, payload: Vec<u8>, close_after_send: bool) -> Self {
        Self {
            log,
            payload: Some(payload),
            close_after_send,
        }
    }

    /// A client that connects and then just listens.
    pub fn idle(log: Shared<EndpointLog>) -> Self {
        Self {
            log,
            payload: None,
            close_after_send: false,
        }
    }
}

impl EndpointObserver<SimHost> for StreamClient {
    fn established(&mut self, tcp: &mut Tcp<SimHost>, endpoint: EndpointId) {
        self.log.borrow_mut().established += 1;
        if let Some(payload) = self.payload.take() {
            tcp.send_by_reference(endpoint, LinkedBuffer::new(payload), SendFlags::default())
                .expect("established connections accept sends");
        }
    }

    fn send_done(
        &mut self,
        tcp: &mut Tcp<SimHost>,
        endpoint: EndpointId,
        _buffer: LinkedBuffer,
        outcome: SendOutcome,
    ) {
        let mut log = self.log.borrow_mut();
        log.send_done += 1;
        if outcome == SendOutcome::Aborted {
            log.aborted_sends += 1;
            return;
        }
        drop(log);
        if self.close_after_send {
            let _ = tcp.send_end_of_stream(endpoint);
        }
    }

    fn bytes_acked(&mut self, _tcp: &mut Tcp<SimHost>, _endpoint: EndpointId, count: usize) {
        self.log.borrow_mut().bytes_acked += count;
    }

    fn send_ready(&mut self, _tcp: &mut Tcp<SimHost>, _endpoint: EndpointId) {
        self.log.borrow_mut().send_ready += 1;
    }

    fn receive_available(
        &mut self,
        tcp: &mut Tcp<SimHost>,
        endpoint: EndpointId,
        available: usize,
        end_of_stream: bool,
        window: usize,
    ) {
        let _ = available;
        drain_receive(&self.log, tcp, endpoint, end_of_stream, window);
    }

    fn disconnected(
        &mut self,
        _tcp: &mut Tcp<SimHost>,
        _endpoint: EndpointId,
        reason: DisconnectReason,
    ) {
        self.log.borrow_mut().disconnects.push(reason);
    }
}

/// Consumes everything it receives; optionally closes its side when the
/// peer's stream ends, and optionally holds data unread to squeeze the
/// advertised window.
pub struct StreamSink {
    pub log: Shared<EndpointLog>,
    pub auto_commit: bool,
    pub close_on_end_of_stream: bool,
}

impl StreamSink {
    pub fn new(log: Shared<EndpointLog>) -> Self {
        Self {
            log,
            auto_commit: true,
            close_on_end_of_stream: false,
        }
    }

    pub fn closing(log: Shared<EndpointLog>) -> Self {
        Self {
            log,
            auto_commit: true,
            close_on_end_of_stream: true,
        }
    }

    pub fn held(log: Shared<EndpointLog>) -> Self {
        Self {
            log,
            auto_commit: false,
            close_on_end_of_stream: false,
        }
    }
}

impl EndpointObserver<SimHost> for StreamSink {
    fn established(&mut self, _tcp: &mut Tcp<SimHost>, _endpoint: EndpointId) {
        self.log.borrow_mut().established += 1;
    }

    fn receive_available(
        &mut self,
        tcp: &mut Tcp<SimHost>,
        endpoint: EndpointId,
        available: usize,
        end_of_stream: bool,
        window: usize,
    ) {
        if self.auto_commit {
            drain_receive(&self.log, tcp, endpoint, end_of_stream, window);
        } else {
            let mut log = self.log.borrow_mut();
            log.end_of_stream |= end_of_stream;
            log.window_seen.push(window);
            log.receive_events.push((available, end_of_stream));
        }
        if end_of_stream && self.close_on_end_of_stream {
            let _ = tcp.send_end_of_stream(endpoint);
        }
    }

    fn send_done(
        &mut self,
        _tcp: &mut Tcp<SimHost>,
        _endpoint: EndpointId,
        _buffer: LinkedBuffer,
        outcome: SendOutcome,
    ) {
        let mut log = self.log.borrow_mut();
        log.send_done += 1;
        if outcome == SendOutcome::Aborted {
            log.aborted_sends += 1;
        }
    }

    fn disconnected(
        &mut self,
        _tcp: &mut Tcp<SimHost>,
        _endpoint: EndpointId,
        reason: DisconnectReason,
    ) {
        self.log.borrow_mut().disconnects.push(reason);
    }
}

/// Reads the whole receive chain into the log and returns the space to
/// the window.
fn drain_receive(
    log: &Shared<EndpointLog>,
    tcp: &mut Tcp<SimHost>,
    endpoint: EndpointId,
    end_of_stream: bool,
    window: usize,
) {
    let taken = {
        let chain = tcp
            .receive_by_reference(endpoint)
            .expect("receive callback implies a live connection");
        let mut log = log.borrow_mut();
        log.end_of_stream |= end_of_stream;
        log.window_seen.push(window);
        log.receive_events.push((chain.len(), end_of_stream));
        let taken = chain.len();
        log.received.extend(chain.iter());
        taken
    };
    if taken > 0 {
        tcp.commit_receive(endpoint, taken)
            .expect("committing what was just read");
    }
}

/// What one listener did with its connection requests.
#[derive(Debug, Default)]
pub struct AcceptLog {
    pub ready_calls: usize,
    pub done: Vec<(EndpointId, SocketAddr)>,
}

/// Accepts into pre-initialized endpoints handed over at construction;
/// defers once the pool runs dry.
pub struct Acceptor {
    pub pool: Vec<EndpointId>,
    pub log: Shared<AcceptLog>,
}

impl Acceptor {
    pub fn new(pool: Vec<EndpointId>, log: Shared<AcceptLog>) -> Self {
        Self { pool, log }
    }
}

impl ListenerObserver<SimHost> for Acceptor {
    fn accept_ready(
        &mut self,
        _tcp: &mut Tcp<SimHost>,
        _listener: ListenerId,
        _peer: SocketAddr,
    ) -> AcceptDecision {
        self.log.borrow_mut().ready_calls += 1;
        match self.pool.pop() {
            Some(endpoint) => AcceptDecision::Accept(endpoint),
            None => AcceptDecision::Defer,
        }
    }

    fn accept_done(
        &mut self,
        _tcp: &mut Tcp<SimHost>,
        _listener: ListenerId,
        endpoint: EndpointId,
        peer: SocketAddr,
    ) {
        self.log.borrow_mut().done.push((endpoint, peer));
    }
}

/// A listener that turns every connection request away.
pub struct Refuser;

impl ListenerObserver<SimHost> for Refuser {
    fn accept_ready(
        &mut self,
        _tcp: &mut Tcp<SimHost>,
        _listener: ListenerId,
        _peer: SocketAddr,
    ) -> AcceptDecision {
        AcceptDecision::Refuse
    }
}
