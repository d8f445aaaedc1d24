//! The simulated network: a host implementation backed by a virtual clock
//! and an in-memory wire between two nodes.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use weft_core::host::{DatagramInfo, Host, SendDatagramError};
use weft_core::tcp::segment::TcpHeader;
use weft_core::{Config, EndpointId, Ipv6Address, Message, Tcp, TimerSlot};

/// Address of the first simulated node.
pub const NODE_A_ADDR: Ipv6Address =
    Ipv6Address::new([0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x0a]);
/// Address of the second simulated node.
pub const NODE_B_ADDR: Ipv6Address =
    Ipv6Address::new([0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x0b]);

struct TimerEntry {
    endpoint: EndpointId,
    slot: TimerSlot,
    deadline: u32,
}

/// A [`Host`] whose network is an outbox and whose clock only moves when
/// the simulation says so.
pub struct SimHost {
    address: Ipv6Address,
    now: u32,
    outbox: Vec<(Message, DatagramInfo)>,
    timers: Vec<TimerEntry>,
}

impl SimHost {
    fn new(address: Ipv6Address) -> Self {
        Self {
            address,
            now: 0,
            outbox: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn now(&self) -> u32 {
        self.now
    }

    fn set_now(&mut self, now: u32) {
        self.now = now;
    }

    fn take_outbox(&mut self) -> Vec<(Message, DatagramInfo)> {
        std::mem::take(&mut self.outbox)
    }

    fn next_deadline(&self) -> Option<u32> {
        self.timers.iter().map(|entry| entry.deadline).min()
    }

    /// Removes and returns the earliest timer due at or before `at`.
    fn pop_due(&mut self, at: u32) -> Option<(u32, EndpointId, TimerSlot)> {
        let index = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.deadline <= at)
            .min_by_key(|(_, entry)| entry.deadline)
            .map(|(index, _)| index)?;
        let entry = self.timers.swap_remove(index);
        Some((entry.deadline, entry.endpoint, entry.slot))
    }
}

impl Host for SimHost {
    fn send_datagram(
        &mut self,
        message: Message,
        info: &DatagramInfo,
    ) -> Result<(), SendDatagramError> {
        self.outbox.push((message, *info));
        Ok(())
    }

    fn select_source_address(&mut self, _peer: Ipv6Address) -> Option<Ipv6Address> {
        Some(self.address)
    }

    fn now_millis(&mut self) -> u32 {
        self.now
    }

    fn arm_timer(&mut self, endpoint: EndpointId, slot: TimerSlot, delay_ms: u32) {
        self.cancel_timer(endpoint, slot);
        self.timers.push(TimerEntry {
            endpoint,
            slot,
            deadline: self.now.wrapping_add(delay_ms),
        });
    }

    fn cancel_timer(&mut self, endpoint: EndpointId, slot: TimerSlot) {
        self.timers
            .retain(|entry| !(entry.endpoint == endpoint && entry.slot == slot));
    }
}

/// One simulated node: the engine plus its host.
pub struct Node {
    pub tcp: Tcp<SimHost>,
    address: Ipv6Address,
}

impl Node {
    pub fn new(address: Ipv6Address, config: Config, seed: u64) -> Self {
        let tcp =
            Tcp::with_seed(config, SimHost::new(address), seed).expect("valid configuration");
        Self { tcp, address }
    }

    pub fn address(&self) -> Ipv6Address {
        self.address
    }

    pub fn now(&self) -> u32 {
        self.tcp.host().now()
    }

    /// Pulls the datagrams the engine has emitted since the last call.
    pub fn take_outbox(&mut self) -> Vec<(Message, DatagramInfo)> {
        self.tcp.host_mut().take_outbox()
    }

    /// Feeds one datagram into the engine.
    pub fn deliver(&mut self, message: Message, info: &DatagramInfo) {
        self.tcp.segment_received(message, info);
    }

    fn next_deadline(&self) -> Option<u32> {
        self.tcp.host().next_deadline()
    }

    /// Moves this node's clock to `at`, firing every timer that comes due
    /// on the way, in deadline order.
    pub fn advance_to(&mut self, at: u32) {
        while let Some((deadline, endpoint, slot)) = self.tcp.host_mut().pop_due(at) {
            let now = self.tcp.host().now().max(deadline);
            self.tcp.host_mut().set_now(now);
            self.tcp.handle_timer(endpoint, slot);
        }
        self.tcp.host_mut().set_now(at);
    }
}

/// A decoded summary of one shuttled segment, for assertions about what
/// actually went on the wire.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRecord {
    pub from: Ipv6Address,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub rst: bool,
    pub wnd: u16,
    pub len: usize,
}

struct Flight {
    deliver_at: u32,
    to_b: bool,
    message: Message,
    info: DatagramInfo,
}

/// Two nodes joined by a lossy wire under a shared virtual clock.
pub struct Sim {
    pub a: Node,
    pub b: Node,
    pub log: Vec<SegmentRecord>,
    in_flight: Vec<Flight>,
    latency_ms: u32,
    jitter_ms: u32,
    drop_rate: f64,
    drop_filter: Option<Box<dyn FnMut(&SegmentRecord, usize) -> bool>>,
    data_segments_seen: usize,
    rng: SmallRng,
    now: u32,
}

impl Sim {
    pub fn new(config: Config, seed: u64) -> Self {
        Self {
            a: Node::new(NODE_A_ADDR, config.clone(), seed ^ 0xa),
            b: Node::new(NODE_B_ADDR, config, seed ^ 0xb),
            log: Vec::new(),
            in_flight: Vec::new(),
            latency_ms: 10,
            jitter_ms: 0,
            drop_rate: 0.0,
            drop_filter: None,
            data_segments_seen: 0,
            rng: SmallRng::seed_from_u64(seed),
            now: 0,
        }
    }

    /// Random loss and delivery jitter. Jitter above the latency produces
    /// reordering.
    pub fn set_impairments(&mut self, drop_rate: f64, jitter_ms: u32) {
        self.drop_rate = drop_rate;
        self.jitter_ms = jitter_ms;
    }

    /// A deterministic drop rule: called once per data-bearing segment
    /// with its ordinal (starting at one); returning true discards it. The
    /// rule applies once per ordinal, so retransmissions get through.
    pub fn set_drop_filter(
        &mut self,
        filter: impl FnMut(&SegmentRecord, usize) -> bool + 'static,
    ) {
        self.drop_filter = Some(Box::new(filter));
    }

    pub fn now(&self) -> u32 {
        self.now
    }

    /// Runs the simulation for `duration_ms` of virtual time, shuttling
    /// datagrams and firing timers in order. Returns early once nothing at
    /// all is scheduled.
    pub fn run_for(&mut self, duration_ms: u32) {
        let end = self.now + duration_ms;
        loop {
            self.collect_outboxes();

            let next_arrival = self.in_flight.iter().map(|flight| flight.deliver_at).min();
            let next_deadline = [self.a.next_deadline(), self.b.next_deadline()]
                .into_iter()
                .flatten()
                .min();
            let Some(next) = [next_arrival, next_deadline].into_iter().flatten().min() else {
                break;
            };
            if next > end {
                break;
            }

            self.now = next.max(self.now);
            self.a.advance_to(self.now);
            self.b.advance_to(self.now);
            self.deliver_due();
        }
        self.now = end;
        self.a.advance_to(end);
        self.b.advance_to(end);
        self.collect_outboxes();
    }

    /// Parses, logs, and schedules (or drops) everything both nodes have
    /// emitted.
    fn collect_outboxes(&mut self) {
        for to_b in [true, false] {
            let outbox = if to_b {
                self.a.take_outbox()
            } else {
                self.b.take_outbox()
            };
            for (message, info) in outbox {
                let record = decode(&message, &info);
                self.log.push(record);
                if record.len > 0 {
                    self.data_segments_seen += 1;
                    let ordinal = self.data_segments_seen;
                    if let Some(filter) = self.drop_filter.as_mut() {
                        if filter(&record, ordinal) {
                            trace!(ordinal, seq = record.seq, "filter dropped segment");
                            continue;
                        }
                    }
                }
                if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
                    trace!(seq = record.seq, "randomly dropped segment");
                    continue;
                }
                let jitter = if self.jitter_ms > 0 {
                    self.rng.gen_range(0..=self.jitter_ms)
                } else {
                    0
                };
                self.in_flight.push(Flight {
                    deliver_at: self.now + self.latency_ms + jitter,
                    to_b,
                    message,
                    info,
                });
            }
        }
    }

    fn deliver_due(&mut self) {
        let mut due: Vec<Flight> = Vec::new();
        let mut index = 0;
        while index < self.in_flight.len() {
            if self.in_flight[index].deliver_at <= self.now {
                due.push(self.in_flight.remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|flight| flight.deliver_at);
        for flight in due {
            let node = if flight.to_b { &mut self.b } else { &mut self.a };
            node.deliver(flight.message, &flight.info);
        }
    }
}

/// Summarizes a datagram for the wire log.
fn decode(message: &Message, info: &DatagramInfo) -> SegmentRecord {
    let (header, header_len) = TcpHeader::parse(message.iter(), info.source, info.destination)
        .expect("the engine only emits well-formed segments");
    SegmentRecord {
        from: info.source,
        src_port: header.src_port,
        dst_port: header.dst_port,
        seq: header.seq,
        ack: header.ack,
        syn: header.ctl.syn(),
        ack_flag: header.ctl.ack(),
        fin: header.ctl.fin(),
        rst: header.ctl.rst(),
        wnd: header.wnd,
        len: message.len() - header_len,
    }
}
