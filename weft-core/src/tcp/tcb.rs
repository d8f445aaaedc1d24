//! The connection control block: all per-connection state and the
//! per-segment processing that drives it.
//!
//! [`Tcb`] implements the state machine of RFC 9293 with the congestion
//! behavior of RFC 5681/6582, the retransmission timer of RFC 6298, and the
//! window scale/timestamp machinery of RFC 7323. The type is inert: it
//! never touches the network or a clock. Entry points take the current
//! time, and everything the connection wants done (segments to transmit,
//! timer changes, events for the application) accumulates in [`Actions`]
//! for the caller to drain. That keeps the whole state machine exercisable
//! from tests without any scaffolding.

use tracing::{debug, trace};

use crate::config::Config;
use crate::ip6::Endpoints;
use crate::message::Message;

use super::segment::{Segment, SegmentOptions, TcpHeader, TcpHeaderBuilder, Timestamps};

pub(crate) mod seq;
use seq::*;

mod state;
pub use state::State;

pub mod send;
use send::{SendQueue, SendSequenceSpace};
pub use send::{LinkedBuffer, SendOutcome};

pub mod receive;
use receive::{ReceiveBuffer, ReceiveSequenceSpace};

mod rtt;
use rtt::RttEstimator;

pub(crate) mod timer;
pub use timer::{TimerCommand, TimerSlot};
use timer::{RexmtMode, TimerSet};

#[cfg(test)]
mod tests;

/// Duplicate acknowledgments that trigger fast retransmit.
pub const DUP_ACK_THRESHOLD: u8 = 3;
/// How long an acknowledgment may be delayed.
const DELAYED_ACK_MS: u32 = 200;
/// SACK blocks carried per segment.
const MAX_SACK_BLOCKS: usize = 3;
/// Octets of option space timestamps consume on non-SYN segments.
const TIMESTAMP_OPTION_LEN: u16 = 12;
/// PAWS stops trusting `TS.Recent` after this long without an update
/// (RFC 7323: 24 days).
const TS_RECENT_LIFETIME_MS: u32 = 24 * 24 * 60 * 60 * 1000;
/// MSS assumed for peers that do not send the option.
const DEFAULT_PEER_MSS: u16 = 536;

/// Why the connection stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The close handshake completed (or TIME-WAIT expired).
    Normal,
    /// The peer refused the connection attempt.
    Refused,
    /// The connection was reset, by the peer or by a local abort.
    Reset,
    /// The connection entered TIME-WAIT; a final `Normal` follows when the
    /// quarantine expires.
    TimeWait,
    /// Retransmission or keepalive probing gave up.
    TimedOut,
}

/// Application-visible happenings, delivered through the engine's observer.
#[derive(Debug)]
pub enum TcbEvent {
    Established,
    SendDone {
        buffer: LinkedBuffer,
        outcome: SendOutcome,
    },
    BytesAcked(usize),
    SendReady,
    ReceiveAvailable {
        available: usize,
        end_of_stream: bool,
        window: usize,
    },
    Disconnected(DisconnectReason),
}

/// Work the connection wants the engine to carry out: segments for the
/// wire, timer changes for the host, events for the application.
#[derive(Debug, Default)]
pub struct Actions {
    pub transmit: Vec<Segment>,
    pub timers: Vec<TimerCommand>,
    pub events: Vec<TcbEvent>,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.transmit.is_empty() && self.timers.is_empty() && self.events.is_empty()
    }
}

/// Whether the caller should keep or delete the TCB after an entry point.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcbDisposition {
    Keep,
    Delete,
}

/// How the connection came to exist locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiation {
    /// Adopted out of a listener by an accept.
    Listen,
    /// Created by an active open.
    Open,
}

/// Per-connection configuration, distilled from the engine [`Config`].
#[derive(Debug, Clone)]
pub struct TcbConfig {
    pub mss: u16,
    pub window_scale_shift: u8,
    pub enable_timestamps: bool,
    pub enable_sack: bool,
    pub msl_ms: u32,
    pub keepalive_idle_ms: u32,
    pub keepalive_probe_interval_ms: u32,
    pub keepalive_probe_count: u8,
}

impl From<&Config> for TcbConfig {
    fn from(config: &Config) -> Self {
        Self {
            mss: config.default_mss,
            window_scale_shift: config.window_scale_shift,
            enable_timestamps: config.enable_timestamps,
            enable_sack: config.enable_sack,
            msl_ms: config.msl_ms,
            keepalive_idle_ms: config.keepalive_idle_ms,
            keepalive_probe_interval_ms: config.keepalive_probe_interval_ms,
            keepalive_probe_count: config.keepalive_probe_count,
        }
    }
}

/// Option state negotiated on the handshake.
#[derive(Debug, Clone, Default)]
struct OptionsState {
    /// Largest payload we may send, before the timestamp option's cut.
    send_mss: u16,
    /// Shift applied to windows the peer advertises.
    snd_wnd_shift: u8,
    /// Shift applied to windows we advertise.
    rcv_wnd_shift: u8,
    timestamps: bool,
    sack: bool,
    ts_recent: u32,
    ts_recent_age: u32,
    last_ack_sent: u32,
}

/// The Transmission Control Block.
#[derive(Debug)]
pub struct Tcb {
    id: Endpoints,
    cfg: TcbConfig,
    state: State,
    initiation: Initiation,
    snd: SendSequenceSpace,
    rcv: ReceiveSequenceSpace,
    opts: OptionsState,
    queue: SendQueue,
    buffer: ReceiveBuffer,
    rtt: RttEstimator,
    timers: TimerSet,
    /// The application asked for end of stream; a FIN follows the queue.
    fin_queued: bool,
    /// Sequence number our FIN occupies, once it has been transmitted.
    fin_seq: Option<u32>,
    /// The last send said more data was on the way (Nagle hint).
    more_to_come: bool,
    delack_pending: bool,
    ack_now: bool,
    /// Full segments received since the last acknowledgment we sent.
    segs_since_ack: u8,
    persist_shift: u8,
    keepalive_probes: u8,
    actions: Actions,
}

impl Tcb {
    /// Creates a TCB for an active open in SYN-SENT. No segment goes out
    /// until [`start`](Tcb::start); a deferred (fast) open queues data first
    /// so the SYN can carry it.
    pub fn open(id: Endpoints, iss: u32, cfg: TcbConfig, buffer: ReceiveBuffer) -> Self {
        Self::new(
            id,
            cfg,
            buffer,
            Initiation::Open,
            State::SynSent,
            SendSequenceSpace {
                iss,
                una: iss,
                nxt: iss,
                max: iss,
                ..Default::default()
            },
            ReceiveSequenceSpace::default(),
        )
    }

    /// Creates a TCB in SYN-RECEIVED for a connection being accepted out of
    /// a listener, negotiates options from the peer's SYN, and emits the
    /// SYN+ACK. Any text carried on the SYN should be re-delivered through
    /// [`segment_arrives`](Tcb::segment_arrives) with the SYN bit stripped.
    pub fn accept(
        id: Endpoints,
        iss: u32,
        cfg: TcbConfig,
        buffer: ReceiveBuffer,
        syn: &TcpHeader,
        now: u32,
    ) -> Self {
        let mut tcb = Self::new(
            id,
            cfg,
            buffer,
            Initiation::Listen,
            State::SynReceived,
            SendSequenceSpace {
                iss,
                una: iss,
                nxt: iss,
                max: iss,
                // Windows in SYN segments are never scaled.
                wnd: syn.wnd as u32,
                max_wnd: syn.wnd as u32,
                wl1: syn.seq,
                wl2: syn.ack,
                ..Default::default()
            },
            ReceiveSequenceSpace {
                irs: syn.seq,
                nxt: syn.seq.wrapping_add(1),
                adv: syn.seq.wrapping_add(1),
            },
        );
        tcb.negotiate(&syn.options, now);
        tcb.send_syn(now);
        tcb
    }

    fn new(
        id: Endpoints,
        cfg: TcbConfig,
        buffer: ReceiveBuffer,
        initiation: Initiation,
        state: State,
        snd: SendSequenceSpace,
        rcv: ReceiveSequenceSpace,
    ) -> Self {
        // RFC 6928 initial window.
        let initial_cwnd = 10 * cfg.mss as u32;
        Self {
            id,
            cfg,
            state,
            initiation,
            snd: SendSequenceSpace {
                cwnd: initial_cwnd,
                ssthresh: u32::MAX,
                ..snd
            },
            rcv,
            opts: OptionsState::default(),
            queue: SendQueue::default(),
            buffer,
            rtt: RttEstimator::new(),
            timers: TimerSet::default(),
            fin_queued: false,
            fin_seq: None,
            more_to_come: false,
            delack_pending: false,
            ack_now: false,
            segs_since_ack: 0,
            persist_shift: 0,
            keepalive_probes: 0,
            actions: Actions::default(),
        }
    }

    /// Emits the initial SYN (with any queued fast-open data) and arms the
    /// retransmission timer.
    pub fn start(&mut self, now: u32) {
        debug_assert_eq!(self.state, State::SynSent);
        self.send_syn(now);
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn endpoints(&self) -> Endpoints {
        self.id
    }

    pub fn initiation(&self) -> Initiation {
        self.initiation
    }

    /// Drains the accumulated transmit/timer/event work.
    pub fn take_actions(&mut self) -> Actions {
        std::mem::take(&mut self.actions)
    }

    // === Application operations ==========================================

    /// Appends a caller-owned buffer to the send queue and pumps output.
    pub fn send(&mut self, link: LinkedBuffer, more_to_come: bool, now: u32) {
        self.queue.push(link);
        self.more_to_come = more_to_come;
        self.pump(now);
    }

    /// Extends the final queued buffer in place.
    pub fn extend_send(
        &mut self,
        n: usize,
        more_to_come: bool,
        now: u32,
    ) -> Result<(), crate::error::Error> {
        self.queue.extend_tail(n)?;
        self.more_to_come = more_to_come;
        self.pump(now);
        Ok(())
    }

    /// Whether new application data may currently be queued.
    pub fn may_send(&self) -> bool {
        self.state.may_send() && !self.fin_queued
    }

    /// The contiguous received bytes, as up to two slices, plus whether the
    /// stream has ended.
    pub fn receive_slices(&self) -> ([&[u8]; 2], bool) {
        (self.buffer.slices(), self.buffer.end_of_stream_reached())
    }

    /// Consumes `n` received bytes, reopening the advertised window. A
    /// window update goes out when enough space comes back to matter.
    pub fn commit_receive(&mut self, n: usize, now: u32) -> Result<(), crate::error::Error> {
        self.buffer.commit(n)?;
        let advertised = self.rcv.adv.wrapping_sub(self.rcv.nxt) as usize;
        let fresh = self.buffer.window().saturating_sub(advertised);
        let duty = (2 * self.cfg.mss as usize).min(self.buffer.capacity() / 2);
        if fresh >= duty {
            trace!(fresh, "window update due");
            self.ack_now = true;
            self.pump(now);
        }
        Ok(())
    }

    /// Rotates the receive ring so the readable bytes are one contiguous
    /// slice.
    pub fn contiguify(&mut self) {
        self.buffer.contiguify();
    }

    /// Queues an end-of-stream marker behind any queued data. The state
    /// transition happens when the FIN actually goes out.
    pub fn close(&mut self, now: u32) -> Result<(), crate::error::Error> {
        if self.fin_queued || !self.state.may_send() {
            return Err(crate::error::Error::InvalidState);
        }
        self.fin_queued = true;
        self.pump(now);
        Ok(())
    }

    /// Forcibly ends the connection: emits a RST, returns every queued
    /// buffer, and reports the reset.
    pub fn abort(&mut self) -> TcbDisposition {
        if self.state != State::TimeWait {
            let builder = self
                .header_builder(self.snd.nxt)
                .rst()
                .ack(self.rcv.nxt);
            let segment = builder.build(
                self.id.local.address,
                self.id.remote.address,
                Message::default(),
            );
            self.actions.transmit.push(segment);
        }
        self.teardown(DisconnectReason::Reset)
    }

    // === Segment input ===================================================

    /// Processes one inbound segment addressed to this connection.
    ///
    /// The header has already been parsed and checksum-verified; anything
    /// that fails those checks never reaches the TCB.
    pub fn segment_arrives(&mut self, segment: Segment, now: u32) -> TcbDisposition {
        let (mut seg, mut text) = segment.into_inner();

        // Any traffic from the peer proves liveness.
        self.keepalive_probes = 0;
        if self.timers.is_armed(TimerSlot::Keepalive) {
            self.arm_timer(TimerSlot::Keepalive, self.cfg.keepalive_idle_ms);
        }

        if self.state == State::SynSent {
            return self.segment_arrives_syn_sent(seg, text, now);
        }

        // PAWS: a timestamp from before TS.Recent means an old duplicate,
        // unless TS.Recent itself has gone stale.
        if self.opts.timestamps && !seg.ctl.rst() {
            if let Some(ts) = seg.options.timestamps {
                if mod_lt(ts.value, self.opts.ts_recent)
                    && now.wrapping_sub(self.opts.ts_recent_age) < TS_RECENT_LIFETIME_MS
                {
                    trace!(tsval = ts.value, recent = self.opts.ts_recent, "PAWS drop");
                    self.ack_now = true;
                    self.pump(now);
                    return TcbDisposition::Keep;
                }
            }
        }

        if !self.is_seq_ok(text.len() as u32, seg.seq, seg.ctl.syn(), seg.ctl.fin()) {
            trace!(seq = seg.seq, rcv_nxt = self.rcv.nxt, "unacceptable sequence");
            if !seg.ctl.rst() {
                self.ack_now = true;
                self.pump(now);
            }
            return TcbDisposition::Keep;
        }

        // Trim the segment to the window: drop bytes already received and
        // bytes beyond the right edge.
        if mod_lt(seg.seq, self.rcv.nxt) {
            if seg.ctl.syn() {
                seg.ctl.set_syn(false);
                seg.seq = seg.seq.wrapping_add(1);
                if self.state == State::SynReceived {
                    // A retransmitted first-contact SYN: our SYN+ACK was
                    // lost, so say it again.
                    self.send_syn(now);
                } else {
                    self.ack_now = true;
                }
            }
            let already = (self.rcv.nxt.wrapping_sub(seg.seq) as usize).min(text.len());
            text.slice(already..);
            seg.seq = seg.seq.wrapping_add(already as u32);
            if already > 0 {
                // Re-sent data means our acknowledgment was lost (or this
                // is a keepalive probe); answer immediately.
                self.ack_now = true;
            }
        }
        let window_edge = self.rcv.nxt.wrapping_add(self.buffer.window() as u32);
        let text_end = seg.seq.wrapping_add(text.len() as u32);
        if mod_gt(text_end, window_edge) {
            let keep = window_edge.wrapping_sub(seg.seq) as usize;
            text.slice(..keep.min(text.len()));
            // The FIN is past the window edge too.
            seg.ctl.set_fin(false);
        }

        // RFC 7323: remember the peer's clock when the segment covers the
        // last acknowledgment we sent.
        if self.opts.timestamps {
            if let Some(ts) = seg.options.timestamps {
                if mod_leq(seg.seq, self.opts.last_ack_sent)
                    && mod_geq(ts.value, self.opts.ts_recent)
                {
                    self.opts.ts_recent = ts.value;
                    self.opts.ts_recent_age = now;
                }
            }
        }

        if seg.ctl.rst() {
            return self.process_rst(&seg, now);
        }

        if seg.ctl.syn() {
            // A SYN inside the window of a synchronized connection: answer
            // with a challenge acknowledgment and drop the segment. This
            // also regenerates a final handshake ACK the peer lost.
            self.ack_now = true;
            self.pump(now);
            return TcbDisposition::Keep;
        }

        if !seg.ctl.ack() {
            // Without an acknowledgment there is nothing else to process,
            // except in SYN-RECEIVED: a first-contact SYN's payload is
            // re-delivered here with its control bits stripped, and queues
            // for delivery once the handshake completes.
            if self.state == State::SynReceived && (!text.is_empty() || seg.ctl.fin()) {
                self.process_text(seg.seq, text, seg.ctl.psh(), seg.ctl.fin(), now);
                self.pump(now);
            }
            return TcbDisposition::Keep;
        }

        match self.process_ack(&seg, text.len(), now) {
            AckDisposition::Continue => {}
            AckDisposition::Drop => {
                self.pump(now);
                return TcbDisposition::Keep;
            }
            AckDisposition::Delete => return TcbDisposition::Delete,
        }

        if !text.is_empty() || seg.ctl.fin() {
            if self.state.may_receive() {
                self.process_text(seg.seq, text, seg.ctl.psh(), seg.ctl.fin(), now);
            } else {
                // Text or FIN after the stream already ended can only be a
                // retransmission; acknowledge it so the peer quiets down.
                self.ack_now = true;
                if self.state == State::TimeWait {
                    self.arm_timer(TimerSlot::TwoMsl, 2 * self.cfg.msl_ms);
                }
            }
        }

        self.pump(now);
        TcbDisposition::Keep
    }

    /// SYN-SENT handling: the one state where nothing is synchronized yet.
    fn segment_arrives_syn_sent(
        &mut self,
        seg: TcpHeader,
        text: Message,
        now: u32,
    ) -> TcbDisposition {
        if seg.ctl.ack()
            && !mod_bounded(self.snd.iss, Lt, seg.ack, Leq, self.snd.nxt)
        {
            // Acknowledges something we never sent.
            if !seg.ctl.rst() {
                self.send_rst_oneshot(seg.ack);
            }
            return TcbDisposition::Keep;
        }

        if seg.ctl.rst() {
            if seg.ctl.ack() {
                debug!(id = %self.id, "connection refused");
                return self.teardown(DisconnectReason::Refused);
            }
            return TcbDisposition::Keep;
        }

        if !seg.ctl.syn() {
            return TcbDisposition::Keep;
        }

        self.negotiate(&seg.options, now);
        self.rcv.irs = seg.seq;
        self.rcv.nxt = seg.seq.wrapping_add(1);
        self.rcv.adv = self.rcv.nxt;
        self.snd.wnd = seg.wnd as u32;
        self.snd.max_wnd = self.snd.max_wnd.max(seg.wnd as u32);
        self.snd.wl1 = seg.seq;
        self.snd.wl2 = seg.ack;

        if seg.ctl.ack() {
            let acked = seg.ack.wrapping_sub(self.snd.una);
            self.snd.una = seg.ack;
            self.rtt.ack_timed(seg.ack, now);
            if let Some(ts) = seg.options.timestamps {
                if self.opts.timestamps && ts.echo != 0 {
                    self.rtt.sample(now.wrapping_sub(ts.echo));
                }
            }
            // The SYN consumed one sequence number; the rest was fast-open
            // payload.
            let data_acked = (acked as usize).saturating_sub(1);
            if data_acked > 0 {
                self.acknowledge_queue(data_acked);
            }
        }

        if self.snd.syn_acked() {
            self.cancel_timer(TimerSlot::RexmtPersist);
            self.enter_established(now);
            self.ack_now = true;
            if !text.is_empty() || seg.ctl.fin() {
                self.process_text(
                    self.rcv.nxt,
                    text,
                    seg.ctl.psh(),
                    seg.ctl.fin(),
                    now,
                );
            }
            self.pump(now);
        } else {
            // Simultaneous open: both ends sent SYNs. Answer with SYN+ACK.
            debug!(id = %self.id, "simultaneous open");
            self.state = State::SynReceived;
            self.send_syn(now);
        }
        TcbDisposition::Keep
    }

    /// RST handling with strict sequence validation: only a reset at
    /// exactly `rcv.nxt` is honored, anything else in the window earns a
    /// challenge acknowledgment.
    fn process_rst(&mut self, seg: &TcpHeader, now: u32) -> TcbDisposition {
        if seg.seq != self.rcv.nxt {
            self.ack_now = true;
            self.pump(now);
            return TcbDisposition::Keep;
        }
        debug!(id = %self.id, state = ?self.state, "reset received");
        let reason = match self.state {
            State::SynReceived => match self.initiation {
                Initiation::Open => DisconnectReason::Refused,
                Initiation::Listen => DisconnectReason::Reset,
            },
            State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait => {
                DisconnectReason::Reset
            }
            State::Closing | State::LastAck | State::TimeWait => DisconnectReason::Normal,
            State::SynSent => unreachable!("handled in segment_arrives_syn_sent"),
        };
        self.teardown(reason)
    }

    fn process_ack(&mut self, seg: &TcpHeader, text_len: usize, now: u32) -> AckDisposition {
        if self.state == State::SynReceived {
            if mod_bounded(self.snd.una, Lt, seg.ack, Leq, self.snd.nxt) {
                self.cancel_timer(TimerSlot::RexmtPersist);
                self.enter_established(now);
            } else {
                self.send_rst_oneshot(seg.ack);
                return AckDisposition::Drop;
            }
        }

        if mod_gt(seg.ack, self.snd.max) {
            // Acknowledges data never sent.
            self.ack_now = true;
            return AckDisposition::Drop;
        }

        if mod_leq(seg.ack, self.snd.una) {
            self.process_duplicate_ack(seg, text_len, now);
        } else {
            self.process_advancing_ack(seg, now);
            match self.state {
                State::FinWait1 if self.is_fin_acked() => {
                    self.state = State::FinWait2;
                    debug!(id = %self.id, "FIN acknowledged, FIN_WAIT_2");
                }
                State::Closing if self.is_fin_acked() => {
                    self.enter_time_wait(now);
                }
                State::LastAck if self.is_fin_acked() => {
                    debug!(id = %self.id, "close complete");
                    self.cancel_all_timers();
                    self.actions
                        .events
                        .push(TcbEvent::Disconnected(DisconnectReason::Normal));
                    return AckDisposition::Delete;
                }
                _ => {}
            }
        }

        self.update_send_window(seg);
        AckDisposition::Continue
    }

    fn process_duplicate_ack(&mut self, seg: &TcpHeader, text_len: usize, now: u32) {
        let window_unchanged = (seg.wnd as u32) << self.opts.snd_wnd_shift == self.snd.wnd;
        let is_duplicate = seg.ack == self.snd.una
            && self.snd.flight_size() > 0
            && window_unchanged
            && text_len == 0
            && !seg.ctl.fin();
        if !is_duplicate {
            return;
        }
        self.snd.dup_acks = self.snd.dup_acks.saturating_add(1);
        trace!(dup_acks = self.snd.dup_acks, "duplicate acknowledgment");
        if self.snd.dup_acks == DUP_ACK_THRESHOLD {
            // NewReno fast retransmit: resend the oldest outstanding
            // segment and inflate the window by the three segments that
            // left the network.
            self.snd.recover = self.snd.max;
            let flight = self.snd.flight_size();
            self.snd.ssthresh = (flight / 2).max(2 * self.cfg.mss as u32);
            debug!(
                id = %self.id,
                ssthresh = self.snd.ssthresh,
                "fast retransmit"
            );
            self.retransmit_one(self.snd.una, now);
            self.snd.cwnd = self.snd.ssthresh + 3 * self.cfg.mss as u32;
        } else if self.snd.in_recovery() {
            self.snd.cwnd += self.cfg.mss as u32;
        }
    }

    fn process_advancing_ack(&mut self, seg: &TcpHeader, now: u32) {
        let acked = seg.ack.wrapping_sub(self.snd.una);

        // Round-trip measurement: the echoed timestamp when available,
        // otherwise the Karn-guarded timed segment.
        let mut sampled = false;
        if self.opts.timestamps {
            if let Some(ts) = seg.options.timestamps {
                if ts.echo != 0 {
                    self.rtt.sample(now.wrapping_sub(ts.echo));
                    sampled = true;
                }
            }
        }
        if !sampled {
            self.rtt.ack_timed(seg.ack, now);
        }

        if self.snd.in_recovery() {
            if mod_geq(seg.ack, self.snd.recover) {
                // Full acknowledgment: recovery is over.
                self.snd.dup_acks = 0;
                self.snd.cwnd = self.snd.ssthresh;
                debug!(id = %self.id, cwnd = self.snd.cwnd, "recovery complete");
            } else {
                // Partial acknowledgment: the next hole is lost too.
                // Retransmit it and deflate by what was acknowledged.
                self.snd.cwnd = self
                    .snd
                    .cwnd
                    .saturating_sub(acked)
                    .saturating_add(self.cfg.mss as u32)
                    .max(self.cfg.mss as u32);
                self.retransmit_one(seg.ack, now);
            }
        } else {
            self.snd.dup_acks = 0;
            let mss = self.cfg.mss as u32;
            if self.snd.cwnd < self.snd.ssthresh {
                // Slow start
                self.snd.cwnd += acked.min(mss);
            } else {
                // Congestion avoidance
                self.snd.cwnd += ((mss * mss) / self.snd.cwnd).max(1);
            }
        }

        // Count how much of the acknowledged span was control bits.
        let mut data_acked = acked as usize;
        if mod_leq(self.snd.una, self.snd.iss) {
            data_acked -= 1; // our SYN
        }
        if let Some(fin_seq) = self.fin_seq {
            if mod_geq(seg.ack, fin_seq.wrapping_add(1)) {
                data_acked -= 1; // our FIN
            }
        }

        self.snd.una = seg.ack;
        self.rtt.reset_backoff();

        if data_acked > 0 {
            self.acknowledge_queue(data_acked);
        }

        if self.snd.all_acked() {
            self.cancel_timer(TimerSlot::RexmtPersist);
        } else if self.timers.rexmt_mode() == RexmtMode::Rexmt {
            self.arm_timer(TimerSlot::RexmtPersist, self.rtt.current_rto());
        }
    }

    /// Returns fully acknowledged links to the application, in order.
    fn acknowledge_queue(&mut self, data_acked: usize) {
        self.actions.events.push(TcbEvent::BytesAcked(data_acked));
        for buffer in self.queue.ack(data_acked) {
            self.actions.events.push(TcbEvent::SendDone {
                buffer,
                outcome: SendOutcome::Acked,
            });
        }
        if self.queue.is_empty() {
            self.actions.events.push(TcbEvent::SendReady);
        }
    }

    fn update_send_window(&mut self, seg: &TcpHeader) {
        if mod_lt(self.snd.wl1, seg.seq)
            || (self.snd.wl1 == seg.seq && mod_leq(self.snd.wl2, seg.ack))
        {
            let new_wnd = (seg.wnd as u32) << self.opts.snd_wnd_shift;
            if self.snd.wnd == 0 && new_wnd > 0 {
                // The zero-window phase is over; fall back to the
                // retransmission regime.
                trace!(id = %self.id, wnd = new_wnd, "window opened");
                self.persist_shift = 0;
                if self.timers.rexmt_mode() == RexmtMode::Persist {
                    self.cancel_timer(TimerSlot::RexmtPersist);
                }
            }
            self.snd.wnd = new_wnd;
            self.snd.max_wnd = self.snd.max_wnd.max(new_wnd);
            self.snd.wl1 = seg.seq;
            self.snd.wl2 = seg.ack;
        }
    }

    /// Reassembles segment text (and the end-of-stream marker) and decides
    /// how urgently to acknowledge.
    fn process_text(&mut self, seq: u32, text: Message, psh: bool, fin: bool, now: u32) {
        let offset = seq.wrapping_sub(self.rcv.nxt) as usize;
        let text_len = text.len();
        let stored = self.buffer.write_at(offset, text.iter());
        if fin && stored == text_len {
            self.buffer.mark_fin(offset + text_len);
        }

        let advanced = self.buffer.advance();
        self.rcv.nxt = self.rcv.nxt.wrapping_add(advanced as u32);

        let mut end_of_stream = false;
        if self.buffer.end_of_stream_reached() && self.fin_unconsumed() {
            // The marker itself takes one sequence number.
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            self.ack_now = true;
            end_of_stream = true;
        }

        // Acknowledgment policy: out-of-order arrivals and filled gaps are
        // acknowledged immediately so the sender's loss detection works;
        // pushed data is acknowledged immediately for latency; otherwise
        // every second segment, or a delayed acknowledgment.
        if offset > 0 {
            self.ack_now = true;
        } else if advanced > stored {
            trace!(advanced, stored, "reassembly gap filled");
            self.ack_now = true;
        } else if psh && stored > 0 {
            self.ack_now = true;
        } else if stored > 0 {
            self.segs_since_ack += 1;
            if self.segs_since_ack >= 2 {
                self.ack_now = true;
            } else {
                self.delack_pending = true;
            }
        }

        // Data arriving before the handshake completes (a fast-open
        // payload) is announced when the connection is, not now. The
        // availability report always precedes any state-machine fallout of
        // the FIN, so applications hear about final data before the close.
        if (advanced > 0 || end_of_stream) && self.state != State::SynReceived {
            self.actions.events.push(TcbEvent::ReceiveAvailable {
                available: self.buffer.available(),
                end_of_stream,
                window: self.buffer.window(),
            });
        }
        if end_of_stream {
            self.process_peer_fin(now);
        }
    }

    /// Whether `rcv.nxt` has not yet stepped over the peer's FIN.
    fn fin_unconsumed(&self) -> bool {
        // After the FIN is consumed the state reflects it; before, the
        // receive states still claim data may arrive.
        self.state.may_receive()
    }

    /// State transitions driven by the peer's FIN reaching `rcv.nxt`.
    fn process_peer_fin(&mut self, now: u32) {
        debug!(id = %self.id, state = ?self.state, "peer closed its side");
        match self.state {
            // In SYN-RECEIVED the transition waits for the handshake to
            // complete; `enter_established` settles into CLOSE_WAIT then.
            State::SynReceived => {}
            State::Established => self.state = State::CloseWait,
            State::FinWait1 => {
                if self.is_fin_acked() {
                    self.enter_time_wait(now);
                } else {
                    self.state = State::Closing;
                }
            }
            State::FinWait2 => self.enter_time_wait(now),
            _ => {}
        }
    }

    // === Output ==========================================================

    /// The output processor: decides what, if anything, goes on the wire.
    pub fn pump(&mut self, now: u32) {
        let mut sent_any = false;

        if self.snd.syn_acked() && self.can_transmit_data() {
            sent_any = self.pump_data(now);
        }

        if self.ack_now && self.state.synchronized() {
            if !sent_any {
                self.send_pure_ack(now);
            }
            self.ack_now = false;
            self.delack_pending = false;
            self.cancel_timer(TimerSlot::DelayedAck);
        } else if sent_any {
            // Data segments carry the acknowledgment.
            self.delack_pending = false;
            self.cancel_timer(TimerSlot::DelayedAck);
        } else if self.delack_pending && !self.timers.is_armed(TimerSlot::DelayedAck) {
            self.arm_timer(TimerSlot::DelayedAck, DELAYED_ACK_MS);
        }

        // Data is waiting, nothing is in flight, and nothing could be sent
        // (zero window, or a window too silly to use): only the persist
        // timer can break the stalemate.
        if self.snd.syn_acked()
            && self.can_transmit_data()
            && self.unsent_bytes() > 0
            && self.snd.flight_size() == 0
            && !self.timers.is_armed(TimerSlot::RexmtPersist)
        {
            let delay = self.persist_delay();
            trace!(id = %self.id, delay, "entering persist");
            let command = self.timers.arm_persist(delay);
            self.actions.timers.push(command);
        }
    }

    /// How far into the send queue transmission has progressed:
    /// `(transmitted, untransmitted)` bytes.
    fn queue_position(&self) -> (usize, usize) {
        let data_start = self.snd.data_start();
        let fin_seq = self.fin_seq_would_be();
        let nxt_includes_fin = self.fin_queued && self.snd.nxt == fin_seq.wrapping_add(1);
        let sent_seqs = self.snd.nxt.wrapping_sub(data_start) as usize;
        let sent_data = sent_seqs.saturating_sub(nxt_includes_fin as usize);
        (sent_data, self.queue.len().saturating_sub(sent_data))
    }

    /// Queued bytes not yet transmitted.
    fn unsent_bytes(&self) -> usize {
        self.queue_position().1
    }

    fn can_transmit_data(&self) -> bool {
        matches!(
            self.state,
            State::Established
                | State::CloseWait
                | State::FinWait1
                | State::Closing
                | State::LastAck
        )
    }

    fn pump_data(&mut self, now: u32) -> bool {
        let mut sent_any = false;
        loop {
            let fin_seq = self.fin_seq_would_be();
            let nxt_includes_fin =
                self.fin_queued && self.snd.nxt == fin_seq.wrapping_add(1);
            let (sent_data, unsent) = self.queue_position();

            let offered = self.snd.wnd.min(self.snd.cwnd);
            let usable = offered.saturating_sub(self.snd.flight_size()) as usize;
            let mss = self.effective_send_mss() as usize;
            let len = unsent.min(usable).min(mss);

            let fin_ready = self.fin_queued && !nxt_includes_fin && len == unsent;

            if len == 0 && !fin_ready {
                break;
            }

            if len > 0 && len < mss && !self.should_send_small(len, unsent, usable) {
                // Nagle / sender-side silly window avoidance: hold the
                // small segment back.
                if !fin_ready {
                    break;
                }
            }

            let seq = self.snd.nxt;
            let new_data = seq == self.snd.max;
            let text = self.queue.peek(sent_data, len);
            let push = len > 0 && len == unsent;
            self.transmit_segment(seq, text, push, fin_ready, now);

            self.snd.nxt = self.snd.nxt.wrapping_add(len as u32 + fin_ready as u32);
            if mod_gt(self.snd.nxt, self.snd.max) {
                self.snd.max = self.snd.nxt;
            }
            if fin_ready {
                self.note_fin_sent(fin_seq);
            }
            if new_data && len > 0 && !self.opts.timestamps {
                self.rtt.start_timing(self.snd.nxt, now);
            }
            if !self.timers.is_armed(TimerSlot::RexmtPersist)
                || self.timers.rexmt_mode() == RexmtMode::Persist
            {
                self.arm_timer(TimerSlot::RexmtPersist, self.rtt.current_rto());
            }
            sent_any = true;

            if len == 0 {
                break;
            }
        }
        sent_any
    }

    /// Sender-side small-segment policy.
    fn should_send_small(&self, len: usize, unsent: usize, usable: usize) -> bool {
        // The final piece of the send buffer goes out once nothing is in
        // flight and the application did not promise more data.
        if len == unsent && self.snd.flight_size() == 0 && !self.more_to_come {
            return true;
        }
        // A window worth half the peer's buffer is never silly.
        usable as u32 >= self.snd.max_wnd / 2 && self.snd.max_wnd > 0
    }

    /// Where our FIN sits (or will sit): one past the last queued byte.
    fn fin_seq_would_be(&self) -> u32 {
        self.fin_seq.unwrap_or_else(|| {
            self.snd.data_start().wrapping_add(self.queue.len() as u32)
        })
    }

    fn note_fin_sent(&mut self, fin_seq: u32) {
        if self.fin_seq.is_none() {
            self.fin_seq = Some(fin_seq);
            match self.state {
                State::Established => {
                    debug!(id = %self.id, "FIN sent, FIN_WAIT_1");
                    self.state = State::FinWait1;
                }
                State::CloseWait => {
                    debug!(id = %self.id, "FIN sent, LAST_ACK");
                    self.state = State::LastAck;
                }
                _ => {}
            }
        }
    }

    fn is_fin_acked(&self) -> bool {
        match self.fin_seq {
            Some(fin_seq) => mod_gt(self.snd.una, fin_seq),
            None => false,
        }
    }

    /// Rebuilds and retransmits a single segment starting at `seq`.
    fn retransmit_one(&mut self, seq: u32, now: u32) {
        let data_start = self.snd.data_start();
        let offset = seq.wrapping_sub(data_start) as usize;
        if offset > self.queue.len() {
            return;
        }
        let len = (self.queue.len() - offset).min(self.effective_send_mss() as usize);
        let fin = self.fin_queued && offset + len == self.queue.len() && self.fin_seq.is_some();
        let text = self.queue.peek(offset, len);
        // Karn: this range is now ambiguous for timing.
        self.rtt.cancel_timing();
        self.transmit_segment(seq, text, false, fin, now);
    }

    fn send_pure_ack(&mut self, now: u32) {
        let seq = self.snd.nxt;
        self.transmit_segment(seq, Message::default(), false, false, now);
    }

    /// Builds a segment carrying `text`, updating advertisement bookkeeping.
    fn transmit_segment(&mut self, seq: u32, text: Message, push: bool, fin: bool, now: u32) {
        let wnd = self.advertised_window();
        let mut builder = self
            .header_builder(seq)
            .ack(self.rcv.nxt)
            .wnd(wnd)
            .options(self.transport_options(now));
        if push {
            builder = builder.psh();
        }
        if fin {
            builder = builder.fin();
        }
        let segment = builder.build(self.id.local.address, self.id.remote.address, text);
        self.opts.last_ack_sent = self.rcv.nxt;
        self.segs_since_ack = 0;
        self.actions.transmit.push(segment);
    }

    /// Sends (or resends) our SYN: plain in SYN-SENT, SYN+ACK in
    /// SYN-RECEIVED, with fast-open payload when data is already queued.
    fn send_syn(&mut self, now: u32) {
        let mut options = SegmentOptions {
            mss: Some(self.cfg.mss),
            ..Default::default()
        };
        // A SYN offers whatever we are configured for; a SYN+ACK echoes
        // only what the peer's SYN offered.
        let answering = self.state == State::SynReceived;
        if self.cfg.window_scale_shift > 0 && (!answering || self.opts.rcv_wnd_shift > 0) {
            options.window_scale = Some(self.cfg.window_scale_shift);
        }
        if self.cfg.enable_sack && (!answering || self.opts.sack) {
            options.sack_permitted = true;
        }
        if self.cfg.enable_timestamps && (!answering || self.opts.timestamps) {
            options.timestamps = Some(Timestamps {
                value: now,
                echo: if answering { self.opts.ts_recent } else { 0 },
            });
        }

        // Fast open: let the SYN carry the front of the queue.
        let payload_len = if self.state == State::SynSent {
            self.queue.len().min(self.cfg.mss as usize)
        } else {
            0
        };
        let text = self.queue.peek(0, payload_len);

        let wnd = self.buffer.window().min(u16::MAX as usize) as u16;
        let mut builder = self
            .header_builder(self.snd.iss)
            .syn()
            .wnd(wnd)
            .options(options);
        if self.state == State::SynReceived {
            builder = builder.ack(self.rcv.nxt);
            self.opts.last_ack_sent = self.rcv.nxt;
        }
        let segment = builder.build(self.id.local.address, self.id.remote.address, text);
        self.actions.transmit.push(segment);

        self.snd.nxt = self.snd.iss.wrapping_add(1 + payload_len as u32);
        if mod_gt(self.snd.nxt, self.snd.max) {
            self.snd.max = self.snd.nxt;
        }
        if self.rtt.shift() == 0 && !self.cfg.enable_timestamps {
            self.rtt.start_timing(self.snd.nxt, now);
        }
        self.arm_timer(TimerSlot::RexmtPersist, self.rtt.current_rto());
    }

    fn send_rst_oneshot(&mut self, seq: u32) {
        let segment = self
            .header_builder(seq)
            .rst()
            .build(self.id.local.address, self.id.remote.address, Message::default());
        self.actions.transmit.push(segment);
    }

    fn header_builder(&self, seq: u32) -> TcpHeaderBuilder {
        TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, seq)
    }

    /// Options for established-state segments: timestamps when negotiated,
    /// SACK blocks while the reassembly buffer has holes.
    fn transport_options(&mut self, now: u32) -> SegmentOptions {
        let mut options = SegmentOptions::default();
        if self.opts.timestamps {
            options.timestamps = Some(Timestamps {
                value: now,
                echo: self.opts.ts_recent,
            });
        }
        if self.opts.sack {
            for (start, end) in self.buffer.sack_ranges(MAX_SACK_BLOCKS) {
                options.sack_blocks.push(super::segment::SackBlock {
                    left: self.rcv.nxt.wrapping_add(start as u32),
                    right: self.rcv.nxt.wrapping_add(end as u32),
                });
            }
        }
        options
    }

    /// The window to advertise, scaled, recording the new right edge.
    fn advertised_window(&mut self) -> u16 {
        let shifted = (self.buffer.window() >> self.opts.rcv_wnd_shift).min(u16::MAX as usize);
        let edge = (shifted << self.opts.rcv_wnd_shift) as u32;
        let new_adv = self.rcv.nxt.wrapping_add(edge);
        if mod_gt(new_adv, self.rcv.adv) {
            self.rcv.adv = new_adv;
        }
        shifted as u16
    }

    fn effective_send_mss(&self) -> u16 {
        let mut mss = self.opts.send_mss;
        if self.opts.timestamps {
            mss = mss.saturating_sub(TIMESTAMP_OPTION_LEN);
        }
        mss.max(1)
    }

    fn negotiate(&mut self, peer: &SegmentOptions, now: u32) {
        self.opts.send_mss = peer.mss.unwrap_or(DEFAULT_PEER_MSS).min(self.cfg.mss);
        if self.cfg.window_scale_shift > 0 {
            if let Some(peer_shift) = peer.window_scale {
                self.opts.snd_wnd_shift = peer_shift.min(14);
                self.opts.rcv_wnd_shift = self.cfg.window_scale_shift;
            }
        }
        self.opts.sack = self.cfg.enable_sack && peer.sack_permitted;
        if self.cfg.enable_timestamps {
            if let Some(ts) = peer.timestamps {
                self.opts.timestamps = true;
                self.opts.ts_recent = ts.value;
                self.opts.ts_recent_age = now;
            }
        }
        debug!(
            id = %self.id,
            mss = self.opts.send_mss,
            sack = self.opts.sack,
            timestamps = self.opts.timestamps,
            snd_shift = self.opts.snd_wnd_shift,
            rcv_shift = self.opts.rcv_wnd_shift,
            "options negotiated"
        );
    }

    fn enter_established(&mut self, _now: u32) {
        debug!(id = %self.id, "connection established");
        let was_syn_received = self.state == State::SynReceived;
        self.state = State::Established;
        self.actions.events.push(TcbEvent::Established);
        self.actions.events.push(TcbEvent::SendReady);
        if was_syn_received
            && (self.buffer.available() > 0 || self.buffer.end_of_stream_reached())
        {
            // Announce any fast-open payload that was held back.
            self.actions.events.push(TcbEvent::ReceiveAvailable {
                available: self.buffer.available(),
                end_of_stream: self.buffer.end_of_stream_reached(),
                window: self.buffer.window(),
            });
        }
        if was_syn_received && self.buffer.end_of_stream_reached() {
            // The peer's FIN rode in before the handshake finished.
            self.state = State::CloseWait;
        }
        self.arm_timer(TimerSlot::Keepalive, self.cfg.keepalive_idle_ms);
    }

    fn enter_time_wait(&mut self, _now: u32) {
        debug!(id = %self.id, "entering TIME_WAIT");
        self.cancel_all_timers();
        self.state = State::TimeWait;
        let delay = 2 * self.cfg.msl_ms;
        let command = self.timers.arm(TimerSlot::TwoMsl, delay);
        self.actions.timers.push(command);
        self.actions
            .events
            .push(TcbEvent::Disconnected(DisconnectReason::TimeWait));
    }

    /// Final cleanup shared by aborts, resets, and timeouts: every queued
    /// buffer goes home, timers die, the disconnect is reported.
    fn teardown(&mut self, reason: DisconnectReason) -> TcbDisposition {
        self.cancel_all_timers();
        for buffer in self.queue.drain() {
            self.actions.events.push(TcbEvent::SendDone {
                buffer,
                outcome: SendOutcome::Aborted,
            });
        }
        self.actions.events.push(TcbEvent::Disconnected(reason));
        TcbDisposition::Delete
    }

    // === Timers ==========================================================

    /// Handles a host timer expiry for one of this connection's slots.
    /// Expiries for slots the TCB no longer considers armed are stale and
    /// ignored.
    pub fn on_timer(&mut self, slot: TimerSlot, now: u32) -> TcbDisposition {
        if !self.timers.is_armed(slot) {
            return TcbDisposition::Keep;
        }
        self.timers.expired(slot);
        match slot {
            TimerSlot::DelayedAck => {
                if self.delack_pending {
                    self.ack_now = true;
                    self.pump(now);
                }
                TcbDisposition::Keep
            }
            TimerSlot::RexmtPersist => match self.timers.rexmt_mode() {
                RexmtMode::Rexmt => self.on_rexmt_timer(now),
                RexmtMode::Persist => self.on_persist_timer(now),
            },
            TimerSlot::Keepalive => self.on_keepalive_timer(now),
            TimerSlot::TwoMsl => {
                if self.state == State::TimeWait {
                    debug!(id = %self.id, "TIME_WAIT expired");
                    self.actions
                        .events
                        .push(TcbEvent::Disconnected(DisconnectReason::Normal));
                    TcbDisposition::Delete
                } else {
                    TcbDisposition::Keep
                }
            }
        }
    }

    fn on_rexmt_timer(&mut self, now: u32) -> TcbDisposition {
        if self.snd.all_acked() && !self.fin_queued {
            return TcbDisposition::Keep;
        }
        if !self.rtt.back_off() {
            debug!(id = %self.id, "retransmission limit reached");
            return self.teardown(DisconnectReason::TimedOut);
        }
        trace!(id = %self.id, shift = self.rtt.shift(), "retransmission timeout");
        self.rtt.cancel_timing();

        if !self.snd.syn_acked() {
            // The handshake itself is being retransmitted.
            self.send_syn(now);
            return TcbDisposition::Keep;
        }

        // Timeout loss: collapse to one segment and go back to the oldest
        // unacknowledged byte. The pump resends from there, the queued FIN
        // included once the data is out again.
        let flight = self.snd.flight_size();
        self.snd.ssthresh = (flight / 2).max(2 * self.cfg.mss as u32);
        self.snd.cwnd = self.cfg.mss as u32;
        self.snd.dup_acks = 0;
        self.snd.nxt = self.snd.una;
        self.pump(now);
        if !self.timers.is_armed(TimerSlot::RexmtPersist) {
            self.arm_timer(TimerSlot::RexmtPersist, self.rtt.current_rto());
        }
        TcbDisposition::Keep
    }

    /// Persist expiry: forced output. With usable window, the held-back
    /// data goes out for real; with none, a single byte beyond the window
    /// probes for a fresh advertisement.
    fn on_persist_timer(&mut self, now: u32) -> TcbDisposition {
        let unsent = self.unsent_bytes();
        if unsent == 0 {
            self.persist_shift = 0;
            self.pump(now);
            return TcbDisposition::Keep;
        }
        let (sent_data, _) = self.queue_position();
        let offered = self.snd.wnd.min(self.snd.cwnd);
        let usable = offered.saturating_sub(self.snd.flight_size()) as usize;

        if usable > 0 {
            // The silly-window rules held this back; forced output
            // overrides them.
            let len = unsent.min(usable).min(self.effective_send_mss() as usize);
            trace!(id = %self.id, len, "forced output from persist");
            let text = self.queue.peek(sent_data, len);
            let seq = self.snd.nxt;
            self.transmit_segment(seq, text, len == unsent, false, now);
            self.snd.nxt = self.snd.nxt.wrapping_add(len as u32);
            if mod_gt(self.snd.nxt, self.snd.max) {
                self.snd.max = self.snd.nxt;
            }
            self.persist_shift = 0;
            self.arm_timer(TimerSlot::RexmtPersist, self.rtt.current_rto());
            return TcbDisposition::Keep;
        }

        // Zero usable window: probe with one byte beyond it. `nxt` stays
        // put, so the byte does not count as sent and transmission resumes
        // contiguously once the window reopens.
        trace!(id = %self.id, "zero-window probe");
        let text = self.queue.peek(sent_data, 1);
        let seq = self.snd.nxt;
        self.transmit_segment(seq, text, false, false, now);
        self.persist_shift = (self.persist_shift + 1).min(6);
        let delay = self.persist_delay();
        let command = self.timers.arm_persist(delay);
        self.actions.timers.push(command);
        TcbDisposition::Keep
    }

    fn persist_delay(&self) -> u32 {
        (self.rtt.current_rto() << self.persist_shift).clamp(rtt::RTO_MIN_MS, rtt::RTO_MAX_MS)
    }

    fn on_keepalive_timer(&mut self, now: u32) -> TcbDisposition {
        if !matches!(self.state, State::Established | State::CloseWait) {
            return TcbDisposition::Keep;
        }
        if self.snd.flight_size() > 0 || !self.queue.is_empty() {
            // The retransmission machinery already covers a busy
            // connection.
            self.arm_timer(TimerSlot::Keepalive, self.cfg.keepalive_idle_ms);
            return TcbDisposition::Keep;
        }
        if self.keepalive_probes >= self.cfg.keepalive_probe_count {
            debug!(id = %self.id, "keepalive gave up");
            self.send_rst_oneshot(self.snd.nxt);
            return self.teardown(DisconnectReason::TimedOut);
        }
        // A segment below the window forces an acknowledgment.
        trace!(id = %self.id, probes = self.keepalive_probes, "keepalive probe");
        let probe_seq = self.snd.una.wrapping_sub(1);
        self.transmit_segment(probe_seq, Message::default(), false, false, now);
        self.keepalive_probes += 1;
        self.arm_timer(TimerSlot::Keepalive, self.cfg.keepalive_probe_interval_ms);
        TcbDisposition::Keep
    }

    fn arm_timer(&mut self, slot: TimerSlot, delay_ms: u32) {
        let command = self.timers.arm(slot, delay_ms);
        self.actions.timers.push(command);
    }

    fn cancel_timer(&mut self, slot: TimerSlot) {
        if let Some(command) = self.timers.disarm(slot) {
            self.actions.timers.push(command);
        }
    }

    fn cancel_all_timers(&mut self) {
        for slot in TimerSlot::ALL {
            self.cancel_timer(slot);
        }
    }

    // === Sequence acceptability ==========================================

    /// RFC 9293 section 3.4 segment acceptability. Zero-length segments use
    /// the strict bound, so an empty segment below `rcv.nxt` (a keepalive
    /// probe) is answered rather than absorbed; segments with a length are
    /// admitted whenever either edge reaches into the window.
    fn is_seq_ok(&self, data_len: u32, seq: u32, syn: bool, fin: bool) -> bool {
        let seg_len = data_len + syn as u32 + fin as u32;
        let window = self.buffer.window() as u32;
        if seg_len == 0 {
            if window == 0 {
                mod_bounded(self.rcv.nxt.wrapping_sub(1), Leq, seq, Leq, self.rcv.nxt)
            } else {
                mod_bounded(
                    self.rcv.nxt,
                    Leq,
                    seq,
                    Lt,
                    self.rcv.nxt.wrapping_add(window),
                )
            }
        } else if window == 0 {
            false
        } else {
            self.is_in_rcv_window(seq)
                || self.is_in_rcv_window(seq.wrapping_add(seg_len).wrapping_sub(1))
        }
    }

    fn is_in_rcv_window(&self, n: u32) -> bool {
        mod_bounded(
            self.rcv.nxt.wrapping_sub(1),
            Leq,
            n,
            Lt,
            self.rcv.nxt.wrapping_add(self.buffer.window() as u32),
        )
    }

    /// Test and engine introspection.
    pub fn snd(&self) -> &SendSequenceSpace {
        &self.snd
    }

    pub(crate) fn timers(&self) -> &TimerSet {
        &self.timers
    }

    pub fn rcv(&self) -> &ReceiveSequenceSpace {
        &self.rcv
    }

    pub fn receive_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Reclaims the receive storage on teardown.
    pub fn into_receive_storage(self) -> ReceiveBuffer {
        self.buffer
    }
}

/// What ACK processing decided about the rest of the segment.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckDisposition {
    Continue,
    Drop,
    Delete,
}
