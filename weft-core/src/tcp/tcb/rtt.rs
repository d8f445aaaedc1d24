//! Round-trip estimation and retransmission backoff, RFC 6298.

/// Lower bound on the retransmission timeout.
pub const RTO_MIN_MS: u32 = 1_000;
/// Upper bound on the retransmission timeout (and on persist backoff).
pub const RTO_MAX_MS: u32 = 64_000;
/// Retransmissions of the same data before the connection is dropped.
pub const MAX_REXMT_SHIFT: u8 = 12;

/// Jacobson/Karels smoothed round-trip estimator with Karn's rule.
///
/// A sample is timed against a single outstanding segment; the timing is
/// discarded whenever that segment is retransmitted, so only unambiguous
/// samples feed the estimator. Connections with timestamps enabled sample
/// from the echoed timestamp instead and never start a timing here.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    /// Smoothed round-trip time, milliseconds. `None` until the first sample.
    srtt: Option<u32>,
    /// Round-trip variance, milliseconds.
    rttvar: u32,
    /// Base timeout before backoff.
    rto: u32,
    /// Backoff shift applied after consecutive losses.
    shift: u8,
    /// Sequence number whose acknowledgment will complete the timing.
    timed_seq: Option<u32>,
    /// When the timed segment was sent.
    timed_at: u32,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            rto: RTO_MIN_MS,
            ..Self::default()
        }
    }

    /// The retransmission timeout to arm now, backoff included.
    pub fn current_rto(&self) -> u32 {
        let base = if self.rto == 0 { RTO_MIN_MS } else { self.rto };
        base.saturating_mul(1 << self.shift.min(6)).clamp(RTO_MIN_MS, RTO_MAX_MS)
    }

    pub fn shift(&self) -> u8 {
        self.shift
    }

    /// Doubles the timeout for the next retransmission. Returns false once
    /// the retransmission budget is exhausted.
    pub fn back_off(&mut self) -> bool {
        if self.shift >= MAX_REXMT_SHIFT {
            return false;
        }
        self.shift += 1;
        true
    }

    /// A new-data acknowledgment arrived; losses are no longer consecutive.
    pub fn reset_backoff(&mut self) {
        self.shift = 0;
    }

    /// Feeds one round-trip measurement into the estimator.
    pub fn sample(&mut self, rtt_ms: u32) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt_ms);
                self.rttvar = rtt_ms / 2;
            }
            Some(srtt) => {
                let delta = srtt.abs_diff(rtt_ms);
                self.rttvar = self.rttvar - self.rttvar / 4 + delta / 4;
                self.srtt = Some(srtt - srtt / 8 + rtt_ms / 8);
            }
        }
        let srtt = self.srtt.unwrap();
        self.rto = (srtt + (4 * self.rttvar).max(1)).clamp(RTO_MIN_MS, RTO_MAX_MS);
    }

    /// Begins timing the segment ending at `seq_end`, if no timing is in
    /// progress.
    pub fn start_timing(&mut self, seq_end: u32, now: u32) {
        if self.timed_seq.is_none() {
            self.timed_seq = Some(seq_end);
            self.timed_at = now;
        }
    }

    /// Discards the in-progress timing (Karn: a retransmission makes any
    /// overlapping sample ambiguous).
    pub fn cancel_timing(&mut self) {
        self.timed_seq = None;
    }

    /// Completes the timing if `ack` covers the timed segment, feeding the
    /// measurement into the estimator.
    pub fn ack_timed(&mut self, ack: u32, now: u32) {
        if let Some(timed) = self.timed_seq {
            if super::seq::mod_geq(ack, timed) {
                self.timed_seq = None;
                self.sample(now.wrapping_sub(self.timed_at));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initializes_the_estimate() {
        let mut rtt = RttEstimator::new();
        rtt.sample(100);
        // SRTT = 100, RTTVAR = 50, RTO = 100 + 4 * 50 = 300 -> floored to 1 s
        assert_eq!(rtt.current_rto(), RTO_MIN_MS);
    }

    #[test]
    fn large_samples_raise_the_timeout() {
        let mut rtt = RttEstimator::new();
        rtt.sample(2_000);
        assert!(rtt.current_rto() > RTO_MIN_MS);
        assert!(rtt.current_rto() <= RTO_MAX_MS);
    }

    #[test]
    fn backoff_doubles_and_is_bounded() {
        let mut rtt = RttEstimator::new();
        rtt.sample(100);
        let base = rtt.current_rto();
        assert!(rtt.back_off());
        assert_eq!(rtt.current_rto(), (base * 2).min(RTO_MAX_MS));
        for _ in 0..MAX_REXMT_SHIFT {
            rtt.back_off();
        }
        assert!(!rtt.back_off());
        assert_eq!(rtt.current_rto(), RTO_MAX_MS);
    }

    #[test]
    fn retransmission_cancels_the_sample() {
        let mut rtt = RttEstimator::new();
        rtt.start_timing(500, 0);
        rtt.cancel_timing();
        rtt.ack_timed(500, 300);
        // No sample was taken, so the estimate is still unprimed.
        assert_eq!(rtt.current_rto(), RTO_MIN_MS);
    }

    #[test]
    fn timing_completes_on_covering_ack() {
        let mut rtt = RttEstimator::new();
        rtt.start_timing(500, 1_000);
        rtt.ack_timed(400, 2_000); // does not cover
        rtt.ack_timed(500, 3_500);
        assert_eq!(rtt.current_rto(), (2_500 + 4 * 1_250).clamp(RTO_MIN_MS, RTO_MAX_MS));
    }
}
