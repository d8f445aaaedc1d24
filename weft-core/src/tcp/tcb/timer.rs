//! Per-connection timer slots.
//!
//! Each endpoint owns four one-shot timers driven by the host. The slot is
//! part of the timer's identity: expiry comes back as `(EndpointId,
//! TimerSlot)`, so recovering the owning connection needs no pointer tricks.
//! Retransmit and persist share a slot; arming one replaces the other, so
//! at most one of the two is ever pending.

/// Identifies one of an endpoint's four timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    /// Delayed acknowledgment.
    DelayedAck,
    /// Retransmission, or window probing when the peer's window is zero.
    RexmtPersist,
    /// Keepalive idle/probe timer.
    Keepalive,
    /// TIME-WAIT expiry, armed exactly once per TIME-WAIT entry.
    TwoMsl,
}

impl TimerSlot {
    pub const COUNT: usize = 4;

    pub const ALL: [TimerSlot; Self::COUNT] = [
        TimerSlot::DelayedAck,
        TimerSlot::RexmtPersist,
        TimerSlot::Keepalive,
        TimerSlot::TwoMsl,
    ];

    pub fn index(self) -> usize {
        match self {
            TimerSlot::DelayedAck => 0,
            TimerSlot::RexmtPersist => 1,
            TimerSlot::Keepalive => 2,
            TimerSlot::TwoMsl => 3,
        }
    }
}

/// What the shared retransmit/persist slot currently means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RexmtMode {
    Rexmt,
    Persist,
}

/// Arm/cancel requests handed to the host after each TCB entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Arm(TimerSlot, u32),
    Cancel(TimerSlot),
}

/// Tracks which of a connection's timers are armed. The host owns the actual
/// clocks; this mirror exists so the TCB can maintain its timer invariants
/// without asking.
#[derive(Debug, Clone)]
pub struct TimerSet {
    armed: [bool; TimerSlot::COUNT],
    rexmt_mode: RexmtMode,
}

impl Default for TimerSet {
    fn default() -> Self {
        Self {
            armed: [false; TimerSlot::COUNT],
            rexmt_mode: RexmtMode::Rexmt,
        }
    }
}

impl TimerSet {
    pub fn is_armed(&self, slot: TimerSlot) -> bool {
        self.armed[slot.index()]
    }

    pub fn any_armed(&self) -> bool {
        self.armed.iter().any(|&armed| armed)
    }

    pub fn rexmt_mode(&self) -> RexmtMode {
        self.rexmt_mode
    }

    /// Marks a slot armed and returns the command to hand to the host.
    pub fn arm(&mut self, slot: TimerSlot, delay_ms: u32) -> TimerCommand {
        self.armed[slot.index()] = true;
        if slot == TimerSlot::RexmtPersist {
            self.rexmt_mode = RexmtMode::Rexmt;
        }
        TimerCommand::Arm(slot, delay_ms)
    }

    /// Arms the shared slot in persist mode.
    pub fn arm_persist(&mut self, delay_ms: u32) -> TimerCommand {
        self.armed[TimerSlot::RexmtPersist.index()] = true;
        self.rexmt_mode = RexmtMode::Persist;
        TimerCommand::Arm(TimerSlot::RexmtPersist, delay_ms)
    }

    /// Marks a slot idle and returns the command to hand to the host, or
    /// `None` if the slot was already idle.
    pub fn disarm(&mut self, slot: TimerSlot) -> Option<TimerCommand> {
        if self.armed[slot.index()] {
            self.armed[slot.index()] = false;
            Some(TimerCommand::Cancel(slot))
        } else {
            None
        }
    }

    /// Records that a slot fired. The host's timers are one-shot, so no
    /// cancel command is needed.
    pub fn expired(&mut self, slot: TimerSlot) {
        self.armed[slot.index()] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_replaces_rexmt() {
        let mut timers = TimerSet::default();
        timers.arm(TimerSlot::RexmtPersist, 1000);
        assert_eq!(timers.rexmt_mode(), RexmtMode::Rexmt);
        timers.arm_persist(2000);
        assert_eq!(timers.rexmt_mode(), RexmtMode::Persist);
        assert!(timers.is_armed(TimerSlot::RexmtPersist));
    }

    #[test]
    fn disarm_is_idempotent() {
        let mut timers = TimerSet::default();
        timers.arm(TimerSlot::DelayedAck, 200);
        assert!(timers.disarm(TimerSlot::DelayedAck).is_some());
        assert!(timers.disarm(TimerSlot::DelayedAck).is_none());
    }
}
