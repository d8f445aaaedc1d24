//! The engine: endpoint and listener registries, the application-facing
//! operations, and segment/timer demultiplexing.
//!
//! [`Tcp`] owns every connection control block and hands work to the host
//! through the [`Host`] trait. All entry points (application calls,
//! [`segment_received`](Tcp::segment_received), and
//! [`handle_timer`](Tcp::handle_timer)) run on one execution context and
//! never block. Application callbacks are delivered through observer traits
//! from a FIFO that only the outermost frame drains, so an operation invoked
//! from inside a callback enqueues further work instead of recursing.

use std::collections::VecDeque;
use std::fmt::{self, Display};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::Error;
use crate::host::{DatagramInfo, Host};
use crate::ip6::{Endpoints, SocketAddr};
use crate::message::Message;

pub mod segment;
use segment::{Segment, TcpHeader, TcpHeaderBuilder};

pub mod tcb;
use tcb::receive::ReceiveBuffer;
use tcb::{Actions, Tcb, TcbConfig, TcbDisposition, TcbEvent};
pub use tcb::{DisconnectReason, LinkedBuffer, SendOutcome, State, TimerSlot};

/// First port of the dynamic range used for unbound connects.
const EPHEMERAL_PORT_MIN: u16 = 49152;

/// Handle to an initialized endpoint. Generational: handles to
/// deinitialized endpoints go stale and every operation on them fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    index: u32,
    generation: u32,
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}.{}", self.index, self.generation)
    }
}

/// Handle to an initialized listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    index: u32,
    generation: u32,
}

impl Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ln{}.{}", self.index, self.generation)
    }
}

/// Options for [`Tcp::connect`], mirroring the wire-visible choices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectFlags {
    /// Send the SYN immediately instead of deferring it to the first send.
    pub no_fast_open: bool,
}

/// Options for the send operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// More data will be queued shortly; small segments may be held back.
    pub more_to_come: bool,
}

/// The application's view of one endpoint's happenings. All methods default
/// to doing nothing; implement the ones the application cares about. Every
/// method may call back into the engine, including deinitializing the very
/// endpoint it was invoked for.
pub trait EndpointObserver<H: Host> {
    fn established(&mut self, tcp: &mut Tcp<H>, endpoint: EndpointId) {
        let _ = (tcp, endpoint);
    }

    /// The buffer passed to `send_by_reference` comes home. With
    /// [`SendOutcome::Acked`] every byte was acknowledged; with
    /// [`SendOutcome::Aborted`] the connection died first.
    fn send_done(
        &mut self,
        tcp: &mut Tcp<H>,
        endpoint: EndpointId,
        buffer: LinkedBuffer,
        outcome: SendOutcome,
    ) {
        let _ = (tcp, endpoint, buffer, outcome);
    }

    /// Finer-grained acknowledgment feedback than `send_done`.
    fn bytes_acked(&mut self, tcp: &mut Tcp<H>, endpoint: EndpointId, count: usize) {
        let _ = (tcp, endpoint, count);
    }

    fn send_ready(&mut self, tcp: &mut Tcp<H>, endpoint: EndpointId) {
        let _ = (tcp, endpoint);
    }

    fn receive_available(
        &mut self,
        tcp: &mut Tcp<H>,
        endpoint: EndpointId,
        available: usize,
        end_of_stream: bool,
        window: usize,
    ) {
        let _ = (tcp, endpoint, available, end_of_stream, window);
    }

    fn disconnected(&mut self, tcp: &mut Tcp<H>, endpoint: EndpointId, reason: DisconnectReason) {
        let _ = (tcp, endpoint, reason);
    }
}

/// The listener's answer to an incoming connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptDecision {
    /// Adopt the connection into this initialized, unconnected endpoint.
    Accept(EndpointId),
    /// Silently ignore the request; a retransmitted SYN will ask again.
    Defer,
    /// Actively refuse with a reset.
    Refuse,
}

/// The application's view of one listener's happenings.
pub trait ListenerObserver<H: Host> {
    /// A connection request arrived. Called synchronously from segment
    /// processing; the decision steers what goes on the wire.
    fn accept_ready(
        &mut self,
        tcp: &mut Tcp<H>,
        listener: ListenerId,
        peer: SocketAddr,
    ) -> AcceptDecision;

    /// The adopted connection finished its handshake.
    fn accept_done(
        &mut self,
        tcp: &mut Tcp<H>,
        listener: ListenerId,
        endpoint: EndpointId,
        peer: SocketAddr,
    ) {
        let _ = (tcp, listener, endpoint, peer);
    }
}

/// Resources handed back by [`Tcp::deinitialize_endpoint`].
#[derive(Debug)]
pub struct Reclaimed {
    /// The receive memory adopted at initialization.
    pub receive_storage: Vec<u8>,
    /// Send buffers that were still queued, in order.
    pub send_buffers: Vec<LinkedBuffer>,
}

/// Read-only view of the contiguous received bytes. At most two slices
/// because the receive ring may wrap; `receive_contiguify` collapses it to
/// one.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveChain<'a> {
    pub first: &'a [u8],
    pub second: &'a [u8],
    pub end_of_stream: bool,
}

impl ReceiveChain<'_> {
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.first.iter().chain(self.second.iter()).copied()
    }
}

struct EndpointEntry<H: Host> {
    observer: Option<Box<dyn EndpointObserver<H>>>,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    /// A fast-open connect recorded the peer; the SYN goes out with the
    /// first send.
    connect_deferred: bool,
    tcb: Option<Tcb>,
    /// Receive memory, parked here whenever no connection is using it.
    storage: Option<ReceiveBuffer>,
    /// The listener this endpoint was adopted by, until accept-done fires.
    accepted_from: Option<ListenerId>,
}

struct EndpointSlot<H: Host> {
    generation: u32,
    entry: Option<EndpointEntry<H>>,
}

struct ListenerEntry<H: Host> {
    observer: Option<Box<dyn ListenerObserver<H>>>,
    local: Option<SocketAddr>,
}

struct ListenerSlot<H: Host> {
    generation: u32,
    entry: Option<ListenerEntry<H>>,
}

enum PendingEvent {
    Endpoint(EndpointId, TcbEvent),
    AcceptDone {
        listener: ListenerId,
        endpoint: EndpointId,
        peer: SocketAddr,
    },
}

/// The TCP engine.
pub struct Tcp<H: Host> {
    host: H,
    config: Config,
    endpoints: Vec<EndpointSlot<H>>,
    listeners: Vec<ListenerSlot<H>>,
    /// Active connections by exact four-tuple; the hot-path lookup.
    active: FxHashMap<Endpoints, EndpointId>,
    events: VecDeque<PendingEvent>,
    /// Set while the outermost frame drains `events`; inner frames only
    /// enqueue.
    dispatching: bool,
    rng: SmallRng,
    next_ephemeral: u16,
}

impl<H: Host> Tcp<H> {
    pub fn new(config: Config, host: H) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            host,
            config,
            endpoints: Vec::new(),
            listeners: Vec::new(),
            active: FxHashMap::default(),
            events: VecDeque::new(),
            dispatching: false,
            rng: SmallRng::from_entropy(),
            next_ephemeral: EPHEMERAL_PORT_MIN,
        })
    }

    /// Builds an engine with a deterministic initial sequence source, for
    /// reproducible tests and simulations.
    pub fn with_seed(config: Config, host: H, seed: u64) -> Result<Self, Error> {
        let mut tcp = Self::new(config, host)?;
        tcp.rng = SmallRng::seed_from_u64(seed);
        Ok(tcp)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    // === Endpoint lifecycle ==============================================

    /// Registers an endpoint, adopting `receive_storage` for its receive
    /// buffer. Part of the storage is reserved for reassembly bookkeeping;
    /// it must hold at least one full segment beyond that.
    pub fn initialize_endpoint(
        &mut self,
        receive_storage: Vec<u8>,
        observer: Box<dyn EndpointObserver<H>>,
    ) -> Result<EndpointId, Error> {
        let min_ring = self.config.default_mss as usize + 1;
        let buffer = ReceiveBuffer::new(receive_storage, min_ring)?;
        let entry = EndpointEntry {
            observer: Some(observer),
            local: SocketAddr::default(),
            remote: None,
            connect_deferred: false,
            tcb: None,
            storage: Some(buffer),
            accepted_from: None,
        };
        let id = self.allocate_endpoint(entry);
        debug!(%id, "endpoint initialized");
        Ok(id)
    }

    /// Replaces the endpoint's observer.
    pub fn set_observer(
        &mut self,
        id: EndpointId,
        observer: Box<dyn EndpointObserver<H>>,
    ) -> Result<(), Error> {
        let entry = self.endpoint_entry_mut(id).ok_or(Error::InvalidArgs)?;
        entry.observer = Some(observer);
        Ok(())
    }

    /// Binds the endpoint to a specific local address and port.
    pub fn bind(&mut self, id: EndpointId, local: SocketAddr) -> Result<(), Error> {
        if local.address.is_unspecified() || local.port == 0 {
            return Err(Error::InvalidArgs);
        }
        {
            let entry = self.endpoint_entry(id).ok_or(Error::InvalidArgs)?;
            if entry.tcb.is_some() || entry.remote.is_some() {
                return Err(Error::InvalidState);
            }
        }
        if self.binding_conflicts(local, Some(id)) {
            return Err(Error::InvalidState);
        }
        let entry = self.endpoint_entry_mut(id).ok_or(Error::InvalidArgs)?;
        entry.local = local;
        Ok(())
    }

    /// Records the peer and, unless fast open applies, begins the
    /// handshake. With fast open (the configured default) nothing goes on
    /// the wire until the first `send_by_reference`, whose SYN then carries
    /// the data.
    pub fn connect(
        &mut self,
        id: EndpointId,
        peer: SocketAddr,
        flags: ConnectFlags,
    ) -> Result<(), Error> {
        if peer.address.is_unspecified() || peer.port == 0 {
            return Err(Error::InvalidArgs);
        }
        {
            let entry = self.endpoint_entry(id).ok_or(Error::InvalidArgs)?;
            if entry.tcb.is_some() || entry.remote.is_some() {
                return Err(Error::InvalidState);
            }
        }
        let local = self.resolve_local(id, peer)?;

        let entry = self.endpoint_entry_mut(id).ok_or(Error::InvalidArgs)?;
        entry.local = local;
        entry.remote = Some(peer);

        let fast_open = self.config.fast_open_default && !flags.no_fast_open;
        if fast_open {
            let entry = self.endpoint_entry_mut(id).unwrap();
            entry.connect_deferred = true;
            trace!(%id, %peer, "connect deferred for fast open");
            return Ok(());
        }

        self.begin_connection(id, |_, _| {})?;
        self.drive();
        Ok(())
    }

    /// Hands a caller-owned buffer to the send queue. The buffer returns
    /// through the observer's `send_done`.
    pub fn send_by_reference(
        &mut self,
        id: EndpointId,
        buffer: LinkedBuffer,
        flags: SendFlags,
    ) -> Result<(), Error> {
        let now = self.host.now_millis();
        let deferred = {
            let entry = self.endpoint_entry(id).ok_or(Error::InvalidArgs)?;
            entry.connect_deferred
        };
        if deferred {
            // The recorded connect finally goes on the wire, SYN plus data.
            self.begin_connection(id, move |tcb, now| {
                tcb.send(buffer, flags.more_to_come, now);
            })?;
            self.drive();
            return Ok(());
        }

        let (actions, ends) = {
            let entry = self.endpoint_entry_mut(id).ok_or(Error::InvalidArgs)?;
            let tcb = entry.tcb.as_mut().ok_or(Error::InvalidState)?;
            if !tcb.may_send() {
                return Err(Error::InvalidState);
            }
            tcb.send(buffer, flags.more_to_come, now);
            (tcb.take_actions(), tcb.endpoints())
        };
        self.apply_actions(id, ends, actions);
        self.drive();
        Ok(())
    }

    /// Grows the most recently queued buffer by `n` bytes without re-handing
    /// it. Fails if the queue is empty or the buffer's allocation is full.
    pub fn send_by_extension(
        &mut self,
        id: EndpointId,
        n: usize,
        flags: SendFlags,
    ) -> Result<(), Error> {
        if n == 0 {
            return Err(Error::InvalidArgs);
        }
        let now = self.host.now_millis();
        let (actions, ends) = {
            let entry = self.endpoint_entry_mut(id).ok_or(Error::InvalidArgs)?;
            let tcb = entry.tcb.as_mut().ok_or(Error::InvalidState)?;
            if !tcb.may_send() {
                return Err(Error::InvalidState);
            }
            tcb.extend_send(n, flags.more_to_come, now)?;
            (tcb.take_actions(), tcb.endpoints())
        };
        self.apply_actions(id, ends, actions);
        self.drive();
        Ok(())
    }

    /// The contiguous received bytes, valid until the next receive-available
    /// callback, `commit_receive`, or `receive_contiguify`.
    pub fn receive_by_reference(&self, id: EndpointId) -> Result<ReceiveChain<'_>, Error> {
        let entry = self.endpoint_entry(id).ok_or(Error::InvalidArgs)?;
        let tcb = entry.tcb.as_ref().ok_or(Error::InvalidState)?;
        let (slices, end_of_stream) = tcb.receive_slices();
        Ok(ReceiveChain {
            first: slices[0],
            second: slices[1],
            end_of_stream,
        })
    }

    /// Consumes `n` received bytes, reopening the advertised window.
    pub fn commit_receive(&mut self, id: EndpointId, n: usize) -> Result<(), Error> {
        let now = self.host.now_millis();
        let (actions, ends) = {
            let entry = self.endpoint_entry_mut(id).ok_or(Error::InvalidArgs)?;
            let tcb = entry.tcb.as_mut().ok_or(Error::InvalidState)?;
            tcb.commit_receive(n, now)?;
            (tcb.take_actions(), tcb.endpoints())
        };
        self.apply_actions(id, ends, actions);
        self.drive();
        Ok(())
    }

    /// Rearranges the receive buffer so the readable bytes are physically
    /// contiguous.
    pub fn receive_contiguify(&mut self, id: EndpointId) -> Result<(), Error> {
        let entry = self.endpoint_entry_mut(id).ok_or(Error::InvalidArgs)?;
        let tcb = entry.tcb.as_mut().ok_or(Error::InvalidState)?;
        tcb.contiguify();
        Ok(())
    }

    /// Queues an end-of-stream marker after everything already queued.
    pub fn send_end_of_stream(&mut self, id: EndpointId) -> Result<(), Error> {
        let now = self.host.now_millis();
        let (actions, ends) = {
            let entry = self.endpoint_entry_mut(id).ok_or(Error::InvalidArgs)?;
            let tcb = entry.tcb.as_mut().ok_or(Error::InvalidState)?;
            tcb.close(now)?;
            (tcb.take_actions(), tcb.endpoints())
        };
        self.apply_actions(id, ends, actions);
        self.drive();
        Ok(())
    }

    /// Forcibly ends any connection on the endpoint: a reset goes out,
    /// queued buffers come back through `send_done`, and `disconnected`
    /// reports the reset. The endpoint stays initialized.
    pub fn abort(&mut self, id: EndpointId) -> Result<(), Error> {
        {
            let entry = self.endpoint_entry_mut(id).ok_or(Error::InvalidArgs)?;
            entry.connect_deferred = false;
            entry.remote = None;
            if entry.tcb.is_none() {
                return Ok(());
            }
        }
        let (actions, ends) = {
            let entry = self.endpoint_entry_mut(id).unwrap();
            let tcb = entry.tcb.as_mut().unwrap();
            let _ = tcb.abort();
            (tcb.take_actions(), tcb.endpoints())
        };
        self.apply_actions(id, ends, actions);
        self.remove_connection(id);
        self.drive();
        Ok(())
    }

    /// Unregisters the endpoint, aborting any live connection, and returns
    /// every resource the application had handed in. Undelivered events for
    /// the endpoint are discarded.
    pub fn deinitialize_endpoint(&mut self, id: EndpointId) -> Result<Reclaimed, Error> {
        let slot = self
            .endpoints
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(Error::InvalidState)?;
        let mut entry = slot.entry.take().ok_or(Error::InvalidState)?;
        slot.generation = slot.generation.wrapping_add(1);

        let mut send_buffers = Vec::new();
        let storage = match entry.tcb.take() {
            Some(mut tcb) => {
                let _ = tcb.abort();
                let mut actions = tcb.take_actions();
                let ends = tcb.endpoints();
                self.active.remove(&ends);
                // Only the reset goes out; events die with the endpoint,
                // and the queued buffers return synchronously instead.
                for segment in actions.transmit.drain(..) {
                    self.emit_segment(ends, segment);
                }
                for event in actions.events {
                    if let TcbEvent::SendDone { buffer, .. } = event {
                        send_buffers.push(buffer);
                    }
                }
                tcb.into_receive_storage()
            }
            None => entry.storage.take().expect("unconnected endpoint keeps its storage"),
        };
        for slot in TimerSlot::ALL {
            self.host.cancel_timer(id, slot);
        }
        debug!(%id, "endpoint deinitialized");
        self.drive();
        Ok(Reclaimed {
            receive_storage: storage.into_storage(),
            send_buffers,
        })
    }

    // === Listener lifecycle ==============================================

    /// Registers a listener.
    pub fn initialize_listener(
        &mut self,
        observer: Box<dyn ListenerObserver<H>>,
    ) -> Result<ListenerId, Error> {
        let entry = ListenerEntry {
            observer: Some(observer),
            local: None,
        };
        let id = self.allocate_listener(entry);
        debug!(%id, "listener initialized");
        Ok(id)
    }

    /// Starts listening on `local`. The unspecified address listens on
    /// every local address; a listener with a specific address outranks a
    /// wildcard one on the same port.
    pub fn listen(&mut self, id: ListenerId, local: SocketAddr) -> Result<(), Error> {
        if local.port == 0 {
            return Err(Error::InvalidArgs);
        }
        {
            let entry = self.listener_entry(id).ok_or(Error::InvalidArgs)?;
            if entry.local.is_some() {
                return Err(Error::InvalidState);
            }
        }
        if self.binding_conflicts(local, None) {
            return Err(Error::InvalidState);
        }
        let entry = self.listener_entry_mut(id).ok_or(Error::InvalidArgs)?;
        entry.local = Some(local);
        debug!(%id, %local, "listening");
        Ok(())
    }

    /// Stops listening. A no-op on a listener that is not listening.
    pub fn stop_listening(&mut self, id: ListenerId) -> Result<(), Error> {
        let entry = self.listener_entry_mut(id).ok_or(Error::InvalidArgs)?;
        entry.local = None;
        Ok(())
    }

    /// Unregisters the listener, stopping it first if needed.
    pub fn deinitialize_listener(&mut self, id: ListenerId) -> Result<(), Error> {
        let slot = self
            .listeners
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(Error::InvalidState)?;
        if slot.entry.take().is_none() {
            return Err(Error::InvalidState);
        }
        slot.generation = slot.generation.wrapping_add(1);
        debug!(%id, "listener deinitialized");
        Ok(())
    }

    // === Introspection ===================================================

    /// The endpoint's connection state; `None` while closed.
    pub fn endpoint_state(&self, id: EndpointId) -> Result<Option<State>, Error> {
        let entry = self.endpoint_entry(id).ok_or(Error::InvalidArgs)?;
        Ok(entry.tcb.as_ref().map(|tcb| tcb.state()))
    }

    pub fn local_address(&self, id: EndpointId) -> Result<SocketAddr, Error> {
        let entry = self.endpoint_entry(id).ok_or(Error::InvalidArgs)?;
        Ok(entry.local)
    }

    pub fn peer_address(&self, id: EndpointId) -> Result<Option<SocketAddr>, Error> {
        let entry = self.endpoint_entry(id).ok_or(Error::InvalidArgs)?;
        Ok(entry.remote)
    }

    pub fn listener_local_address(&self, id: ListenerId) -> Result<Option<SocketAddr>, Error> {
        let entry = self.listener_entry(id).ok_or(Error::InvalidArgs)?;
        Ok(entry.local)
    }

    // === Inbound segments ================================================

    /// Feeds one received IPv6 datagram (TCP payload) into the engine.
    /// Segments failing parse or checksum are dropped silently.
    pub fn segment_received(&mut self, mut message: Message, info: &DatagramInfo) {
        let now = self.host.now_millis();
        let (header, header_len) =
            match TcpHeader::parse(message.iter(), info.source, info.destination) {
                Ok(parsed) => parsed,
                Err(error) => {
                    trace!(%error, "dropping undecodable segment");
                    self.host.free_message(message);
                    return;
                }
            };
        message.slice(header_len..);

        let local = SocketAddr::new(info.destination, header.dst_port);
        let remote = SocketAddr::new(info.source, header.src_port);
        let ends = Endpoints::new(local, remote);

        if let Some(&id) = self.active.get(&ends) {
            if self.time_wait_restart(id, &header) {
                // A fresh SYN above the old stream releases TIME-WAIT and
                // is then offered to the listeners below.
                self.release_time_wait(id);
            } else {
                let (disposition, actions, ends) = {
                    let entry = self.endpoint_entry_mut(id).expect("active map is consistent");
                    let tcb = entry.tcb.as_mut().expect("active connections have a TCB");
                    let disposition = tcb.segment_arrives(Segment::new(header, message), now);
                    (disposition, tcb.take_actions(), tcb.endpoints())
                };
                self.apply_actions(id, ends, actions);
                if disposition == TcbDisposition::Delete {
                    self.remove_connection(id);
                }
                self.drive();
                return;
            }
        }

        match self.lookup_listener(local) {
            Some(listener) => self.listen_segment(listener, ends, header, message, now),
            None => self.closed_reply(ends, &header, message.len()),
        }
        self.drive();
    }

    /// Whether a segment lets a TIME-WAIT connection make way for a new one:
    /// a fresh SYN whose sequence is past everything the old stream used.
    fn time_wait_restart(&self, id: EndpointId, header: &TcpHeader) -> bool {
        let Some(entry) = self.endpoint_entry(id) else {
            return false;
        };
        let Some(tcb) = entry.tcb.as_ref() else {
            return false;
        };
        tcb.state() == State::TimeWait
            && header.ctl.syn()
            && !header.ctl.ack()
            && tcb::seq::mod_gt(header.seq, tcb.rcv().nxt)
    }

    fn release_time_wait(&mut self, id: EndpointId) {
        debug!(%id, "TIME_WAIT released by new connection request");
        self.events.push_back(PendingEvent::Endpoint(
            id,
            TcbEvent::Disconnected(DisconnectReason::Normal),
        ));
        self.host.cancel_timer(id, TimerSlot::TwoMsl);
        self.remove_connection(id);
    }

    /// LISTEN-state processing: RFC 9293 3.10.7.2, with the accept decision
    /// delegated to the listener's observer.
    fn listen_segment(
        &mut self,
        listener: ListenerId,
        ends: Endpoints,
        mut header: TcpHeader,
        text: Message,
        now: u32,
    ) {
        if header.ctl.rst() {
            return;
        }
        if header.ctl.ack() {
            // Nothing here could have sent data to acknowledge.
            self.closed_reply(ends, &header, text.len());
            return;
        }
        if !header.ctl.syn() {
            return;
        }

        let decision = self.ask_accept(listener, ends.remote);
        match decision {
            None | Some(AcceptDecision::Defer) => {
                trace!(%listener, peer = %ends.remote, "connection request deferred");
            }
            Some(AcceptDecision::Refuse) => {
                debug!(%listener, peer = %ends.remote, "connection request refused");
                self.closed_reply(ends, &header, text.len());
            }
            Some(AcceptDecision::Accept(endpoint)) => {
                if let Err(error) = self.adopt(listener, endpoint, ends, &mut header, text, now) {
                    warn!(%listener, %endpoint, %error, "accept failed; refusing");
                    self.closed_reply(ends, &header, 0);
                }
            }
        }
    }

    /// Runs the accept-ready callback. `None` when the listener vanished or
    /// has no observer to ask.
    fn ask_accept(&mut self, listener: ListenerId, peer: SocketAddr) -> Option<AcceptDecision> {
        let entry = self.listener_entry_mut(listener)?;
        let mut observer = entry.observer.take()?;
        let decision = observer.accept_ready(self, listener, peer);
        if let Some(entry) = self.listener_entry_mut(listener) {
            if entry.observer.is_none() {
                entry.observer = Some(observer);
            }
        }
        Some(decision)
    }

    /// Adopts a SYN into the accepted endpoint: SYN-RECEIVED, SYN+ACK out,
    /// retransmission armed. Text carried on the SYN is delivered through
    /// the normal input path with the SYN consumed.
    fn adopt(
        &mut self,
        listener: ListenerId,
        endpoint: EndpointId,
        ends: Endpoints,
        header: &mut TcpHeader,
        text: Message,
        now: u32,
    ) -> Result<(), Error> {
        let iss: u32 = self.rng.gen();
        let cfg = TcbConfig::from(&self.config);
        {
            let entry = self.endpoint_entry_mut(endpoint).ok_or(Error::InvalidArgs)?;
            if entry.tcb.is_some() || entry.remote.is_some() {
                return Err(Error::InvalidState);
            }
            let mut buffer = entry.storage.take().ok_or(Error::InvalidState)?;
            buffer.reset();
            let tcb = Tcb::accept(ends, iss, cfg, buffer, header, now);
            entry.tcb = Some(tcb);
            entry.local = ends.local;
            entry.remote = Some(ends.remote);
            entry.accepted_from = Some(listener);
        }
        self.active.insert(ends, endpoint);

        let actions = {
            let entry = self.endpoint_entry_mut(endpoint).unwrap();
            entry.tcb.as_mut().unwrap().take_actions()
        };
        self.apply_actions(endpoint, ends, actions);

        if !text.is_empty() || header.ctl.fin() {
            // Re-deliver the payload with the SYN consumed.
            header.ctl.set_syn(false);
            header.ctl.set_ack(false);
            header.seq = header.seq.wrapping_add(1);
            let (disposition, actions) = {
                let entry = self.endpoint_entry_mut(endpoint).unwrap();
                let tcb = entry.tcb.as_mut().unwrap();
                let disposition = tcb.segment_arrives(Segment::new(header.clone(), text), now);
                (disposition, tcb.take_actions())
            };
            self.apply_actions(endpoint, ends, actions);
            if disposition == TcbDisposition::Delete {
                self.remove_connection(endpoint);
            }
        }
        Ok(())
    }

    /// RFC 9293 3.10.7.1: what a closed port says to an unexpected segment.
    fn closed_reply(&mut self, ends: Endpoints, header: &TcpHeader, text_len: usize) {
        if header.ctl.rst() {
            return;
        }
        let builder = if header.ctl.ack() {
            TcpHeaderBuilder::new(ends.local.port, ends.remote.port, header.ack).rst()
        } else {
            let ack = header
                .seq
                .wrapping_add(text_len as u32)
                .wrapping_add(header.ctl.syn() as u32)
                .wrapping_add(header.ctl.fin() as u32);
            TcpHeaderBuilder::new(ends.local.port, ends.remote.port, 0)
                .rst()
                .ack(ack)
        };
        trace!(id = %ends, "resetting unexpected segment");
        let segment = builder.build(ends.local.address, ends.remote.address, Message::default());
        self.emit_segment(ends, segment);
    }

    // === Timers ==========================================================

    /// Delivers a host timer expiry. Stale expiries for endpoints or
    /// connections that no longer exist are ignored.
    pub fn handle_timer(&mut self, id: EndpointId, slot: TimerSlot) {
        let now = self.host.now_millis();
        let Some((disposition, actions, ends)) = ({
            self.endpoint_entry_mut(id).and_then(|entry| {
                entry.tcb.as_mut().map(|tcb| {
                    let disposition = tcb.on_timer(slot, now);
                    (disposition, tcb.take_actions(), tcb.endpoints())
                })
            })
        }) else {
            return;
        };
        self.apply_actions(id, ends, actions);
        if disposition == TcbDisposition::Delete {
            self.remove_connection(id);
        }
        self.drive();
    }

    // === Internals =======================================================

    /// Creates the TCB for a recorded connect and starts the handshake.
    /// `prepare` runs between creation and the SYN so fast-open data can be
    /// queued onto the SYN itself.
    fn begin_connection(
        &mut self,
        id: EndpointId,
        prepare: impl FnOnce(&mut Tcb, u32),
    ) -> Result<(), Error> {
        let now = self.host.now_millis();
        let iss: u32 = self.rng.gen();
        let cfg = TcbConfig::from(&self.config);

        let ends = {
            let entry = self.endpoint_entry(id).ok_or(Error::InvalidArgs)?;
            let remote = entry.remote.ok_or(Error::InvalidState)?;
            Endpoints::new(entry.local, remote)
        };

        let actions = {
            let entry = self.endpoint_entry_mut(id).unwrap();
            let mut buffer = entry.storage.take().ok_or(Error::InvalidState)?;
            buffer.reset();
            let mut tcb = Tcb::open(ends, iss, cfg, buffer);
            prepare(&mut tcb, now);
            tcb.start(now);
            entry.connect_deferred = false;
            entry.tcb = Some(tcb);
            entry.tcb.as_mut().unwrap().take_actions()
        };
        self.active.insert(ends, id);
        debug!(%id, id = %ends, "handshake started");
        self.apply_actions(id, ends, actions);
        Ok(())
    }

    /// Chooses the local address and port for a connect: the bound ones
    /// when present, otherwise a host-selected source address and an
    /// ephemeral port.
    fn resolve_local(&mut self, id: EndpointId, peer: SocketAddr) -> Result<SocketAddr, Error> {
        let bound = self.endpoint_entry(id).ok_or(Error::InvalidArgs)?.local;
        let address = if bound.address.is_unspecified() {
            self.host
                .select_source_address(peer.address)
                .ok_or(Error::Failed)?
        } else {
            bound.address
        };
        let port = if bound.port == 0 {
            self.allocate_ephemeral_port(address)?
        } else {
            bound.port
        };
        Ok(SocketAddr::new(address, port))
    }

    fn allocate_ephemeral_port(&mut self, address: crate::ip6::Ipv6Address) -> Result<u16, Error> {
        let span = u16::MAX - EPHEMERAL_PORT_MIN + 1;
        for _ in 0..span {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if candidate == u16::MAX {
                EPHEMERAL_PORT_MIN
            } else {
                candidate + 1
            };
            let socket = SocketAddr::new(address, candidate);
            if !self.binding_conflicts(socket, None) {
                return Ok(candidate);
            }
        }
        Err(Error::Failed)
    }

    /// The bind/listen conflict rules: a wildcard holding conflicts with
    /// everything on the port, a specific holding only with the same
    /// specific (or a wildcard).
    fn binding_conflicts(&self, candidate: SocketAddr, skip: Option<EndpointId>) -> bool {
        let clashes = |held: SocketAddr| {
            held.port == candidate.port
                && (held.address.is_unspecified()
                    || candidate.address.is_unspecified()
                    || held.address == candidate.address)
        };
        for (index, slot) in self.endpoints.iter().enumerate() {
            if let Some(entry) = &slot.entry {
                if skip.map_or(false, |id| {
                    id.index as usize == index && id.generation == slot.generation
                }) {
                    continue;
                }
                // Connected endpoints are distinguished by their four-tuple;
                // only idle bindings can conflict.
                if entry.remote.is_none() && entry.local.port != 0 && clashes(entry.local) {
                    return true;
                }
            }
        }
        for slot in &self.listeners {
            if let Some(entry) = &slot.entry {
                if let Some(held) = entry.local {
                    if clashes(held) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Finds the best listener for a destination: a specific-address match
    /// outranks a wildcard on the same port; earlier registration breaks
    /// ties.
    fn lookup_listener(&self, local: SocketAddr) -> Option<ListenerId> {
        let mut wildcard = None;
        for (index, slot) in self.listeners.iter().enumerate() {
            let Some(entry) = &slot.entry else { continue };
            let Some(held) = entry.local else { continue };
            if held.port != local.port {
                continue;
            }
            let id = ListenerId {
                index: index as u32,
                generation: slot.generation,
            };
            if held.address == local.address {
                return Some(id);
            }
            if held.address.is_unspecified() && wildcard.is_none() {
                wildcard = Some(id);
            }
        }
        wildcard
    }

    /// Sends the connection's wire work, forwards its timer work, and
    /// queues its events for the outermost dispatch frame.
    fn apply_actions(&mut self, id: EndpointId, ends: Endpoints, actions: Actions) {
        for segment in actions.transmit {
            self.emit_segment(ends, segment);
        }
        for command in actions.timers {
            match command {
                tcb::TimerCommand::Arm(slot, delay_ms) => {
                    self.host.arm_timer(id, slot, delay_ms)
                }
                tcb::TimerCommand::Cancel(slot) => self.host.cancel_timer(id, slot),
            }
        }
        for event in actions.events {
            let established = matches!(event, TcbEvent::Established);
            self.events.push_back(PendingEvent::Endpoint(id, event));
            if established {
                // The adopting listener hears about the handshake right
                // after the endpoint does.
                let adoption = self.endpoint_entry_mut(id).and_then(|entry| {
                    entry
                        .accepted_from
                        .take()
                        .zip(entry.remote)
                });
                if let Some((listener, peer)) = adoption {
                    self.events.push_back(PendingEvent::AcceptDone {
                        listener,
                        endpoint: id,
                        peer,
                    });
                }
            }
        }
    }

    fn emit_segment(&mut self, ends: Endpoints, segment: Segment) {
        let info = DatagramInfo {
            source: ends.local.address,
            destination: ends.remote.address,
        };
        let mut message = self.host.new_message();
        message.concatenate(segment.into_message());
        if let Err(error) = self.host.send_datagram(message, &info) {
            warn!(id = %ends, %error, "datagram emission failed");
        }
    }

    /// Tears the connection out of the registry, parking the receive
    /// storage for the endpoint's next use.
    fn remove_connection(&mut self, id: EndpointId) {
        let Some(entry) = self.endpoint_entry_mut(id) else {
            return;
        };
        let Some(tcb) = entry.tcb.take() else {
            return;
        };
        let ends = tcb.endpoints();
        let mut storage = tcb.into_receive_storage();
        storage.reset();
        entry.storage = Some(storage);
        entry.remote = None;
        entry.accepted_from = None;
        self.active.remove(&ends);
        trace!(%id, id = %ends, "connection removed");
    }

    /// Drains the event FIFO, delivering callbacks in the order their
    /// triggering events occurred. Only the outermost frame drains; calls
    /// made from inside callbacks enqueue and return.
    fn drive(&mut self) {
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        while let Some(event) = self.events.pop_front() {
            self.dispatch(event);
        }
        self.dispatching = false;
    }

    fn dispatch(&mut self, event: PendingEvent) {
        match event {
            PendingEvent::Endpoint(id, event) => {
                let Some(entry) = self.endpoint_entry_mut(id) else {
                    // Deinitialized mid-flight; nothing to deliver to.
                    return;
                };
                let Some(mut observer) = entry.observer.take() else {
                    return;
                };
                match event {
                    TcbEvent::Established => observer.established(self, id),
                    TcbEvent::SendDone { buffer, outcome } => {
                        observer.send_done(self, id, buffer, outcome)
                    }
                    TcbEvent::BytesAcked(count) => observer.bytes_acked(self, id, count),
                    TcbEvent::SendReady => observer.send_ready(self, id),
                    TcbEvent::ReceiveAvailable {
                        available,
                        end_of_stream,
                        window,
                    } => observer.receive_available(self, id, available, end_of_stream, window),
                    TcbEvent::Disconnected(reason) => observer.disconnected(self, id, reason),
                }
                if let Some(entry) = self.endpoint_entry_mut(id) {
                    if entry.observer.is_none() {
                        entry.observer = Some(observer);
                    }
                }
            }
            PendingEvent::AcceptDone {
                listener,
                endpoint,
                peer,
            } => {
                let Some(entry) = self.listener_entry_mut(listener) else {
                    return;
                };
                let Some(mut observer) = entry.observer.take() else {
                    return;
                };
                observer.accept_done(self, listener, endpoint, peer);
                if let Some(entry) = self.listener_entry_mut(listener) {
                    if entry.observer.is_none() {
                        entry.observer = Some(observer);
                    }
                }
            }
        }
    }

    fn allocate_endpoint(&mut self, entry: EndpointEntry<H>) -> EndpointId {
        for (index, slot) in self.endpoints.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(entry);
                return EndpointId {
                    index: index as u32,
                    generation: slot.generation,
                };
            }
        }
        self.endpoints.push(EndpointSlot {
            generation: 0,
            entry: Some(entry),
        });
        EndpointId {
            index: (self.endpoints.len() - 1) as u32,
            generation: 0,
        }
    }

    fn allocate_listener(&mut self, entry: ListenerEntry<H>) -> ListenerId {
        for (index, slot) in self.listeners.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(entry);
                return ListenerId {
                    index: index as u32,
                    generation: slot.generation,
                };
            }
        }
        self.listeners.push(ListenerSlot {
            generation: 0,
            entry: Some(entry),
        });
        ListenerId {
            index: (self.listeners.len() - 1) as u32,
            generation: 0,
        }
    }

    fn endpoint_entry(&self, id: EndpointId) -> Option<&EndpointEntry<H>> {
        self.endpoints
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn endpoint_entry_mut(&mut self, id: EndpointId) -> Option<&mut EndpointEntry<H>> {
        self.endpoints
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn listener_entry(&self, id: ListenerId) -> Option<&ListenerEntry<H>> {
        self.listeners
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn listener_entry_mut(&mut self, id: ListenerId) -> Option<&mut ListenerEntry<H>> {
        self.listeners
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }
}
