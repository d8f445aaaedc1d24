//! Engine configuration.

use crate::error::Error;

/// Tunable parameters for the engine. `Config::default()` matches the values
/// recommended for IPv6 minimum-MTU mesh links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Payload bytes per segment before options. 1220 fits the IPv6 minimum
    /// MTU of 1280 after the IPv6 and TCP fixed headers.
    pub default_mss: u16,
    /// Receive window scale shift advertised on SYN, 0..=14. The shift is
    /// only applied when the peer also negotiates window scaling.
    pub window_scale_shift: u8,
    /// Whether to offer RFC 7323 timestamps on SYN.
    pub enable_timestamps: bool,
    /// Whether to offer selective acknowledgments on SYN.
    pub enable_sack: bool,
    /// Whether `connect` defers the SYN until the first send by default.
    pub fast_open_default: bool,
    /// Maximum segment lifetime; TIME-WAIT lasts twice this.
    pub msl_ms: u32,
    /// Idle time before the first keepalive probe.
    pub keepalive_idle_ms: u32,
    /// Interval between keepalive probes.
    pub keepalive_probe_interval_ms: u32,
    /// Unanswered probes before the connection is dropped.
    pub keepalive_probe_count: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_mss: 1220,
            window_scale_shift: 0,
            enable_timestamps: true,
            enable_sack: true,
            fast_open_default: true,
            msl_ms: 30_000,
            keepalive_idle_ms: 7_200_000,
            keepalive_probe_interval_ms: 75_000,
            keepalive_probe_count: 9,
        }
    }
}

impl Config {
    /// Checks the configured values against their documented ranges.
    pub fn validate(&self) -> Result<(), Error> {
        if self.default_mss < 64 {
            return Err(Error::InvalidArgs);
        }
        if self.window_scale_shift > 14 {
            return Err(Error::InvalidArgs);
        }
        if self.msl_ms == 0 || self.keepalive_probe_count == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }

    /// The smallest receive buffer `initialize` accepts for this
    /// configuration. The reassembly ring must hold at least one full
    /// segment plus a byte so the advertised window can stay nonzero while a
    /// segment is buffered.
    pub fn min_receive_buffer(&self) -> usize {
        let ring = self.default_mss as usize + 1;
        ring + bitmap_bytes(ring)
    }
}

/// Bytes of reassembly bitmap needed to track `ring` data bytes.
pub(crate) fn bitmap_bytes(ring: usize) -> usize {
    (ring + 7) / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_shift() {
        let config = Config {
            window_scale_shift: 15,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(Error::InvalidArgs));
    }
}
