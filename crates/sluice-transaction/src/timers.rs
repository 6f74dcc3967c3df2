// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer values per RFC 3261 §17 Table 4.
//!
//! Reliable transports send a request once, so the retransmit timers
//! (A/E/G) are suppressed and the absorb timers (D/I/J/K) collapse to zero;
//! the transaction timeouts (B/F/H) apply to every transport.

use std::time::Duration;

use sluice_transport::TransportKind;

use crate::Timer;

/// Interval before the automatic 100 Trying when the TU stays silent.
const TRYING_DELAY: Duration = Duration::from_millis(200);

/// RFC 3261 base timer values (Table 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    /// RTT estimate, initial retransmit interval. Default 500 ms.
    pub t1: Duration,
    /// Retransmit interval cap. Default 4 s.
    pub t2: Duration,
    /// Maximum lifetime of a message in the network. Default 5 s.
    pub t4: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer value calculator bound to one transaction's transport.
#[derive(Debug, Clone, Copy)]
pub struct TransactionTimers {
    transport: TransportKind,
    defaults: TimerDefaults,
}

impl TransactionTimers {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            defaults: TimerDefaults::default(),
        }
    }

    pub fn with_defaults(transport: TransportKind, defaults: TimerDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }

    /// Initial retransmit interval (T1).
    pub fn t1(&self) -> Duration {
        self.defaults.t1
    }

    /// Retransmit interval cap (T2).
    pub fn t2(&self) -> Duration {
        self.defaults.t2
    }

    /// Whether retransmit timers run at all on this transport.
    pub fn should_retransmit(&self) -> bool {
        !self.transport.is_reliable()
    }

    /// Returns the scheduling duration for a timer.
    pub fn duration(&self, timer: Timer) -> Duration {
        let reliable = self.transport.is_reliable();
        match timer {
            Timer::Trying => TRYING_DELAY,
            // Retransmit timers start at T1 on unreliable transports.
            Timer::A | Timer::E | Timer::G => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1
                }
            }
            // Transaction timeouts are 64*T1 everywhere.
            Timer::B | Timer::F | Timer::H => self.defaults.t1.saturating_mul(64),
            // Absorb timers vanish on reliable transports.
            Timer::D => {
                if reliable {
                    Duration::ZERO
                } else {
                    Duration::from_secs(32)
                }
            }
            Timer::I | Timer::K => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t4
                }
            }
            Timer::J => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1.saturating_mul(64)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_uses_full_values() {
        let timers = TransactionTimers::new(TransportKind::Udp);
        assert_eq!(timers.duration(Timer::A), Duration::from_millis(500));
        assert_eq!(timers.duration(Timer::B), Duration::from_secs(32));
        assert_eq!(timers.duration(Timer::D), Duration::from_secs(32));
        assert_eq!(timers.duration(Timer::I), Duration::from_secs(5));
        assert_eq!(timers.duration(Timer::J), Duration::from_secs(32));
        assert!(timers.should_retransmit());
    }

    #[test]
    fn tcp_suppresses_retransmit_and_absorb_timers() {
        let timers = TransactionTimers::new(TransportKind::Tcp);
        for timer in [Timer::A, Timer::E, Timer::G, Timer::D, Timer::I, Timer::J, Timer::K] {
            assert_eq!(timers.duration(timer), Duration::ZERO, "{:?}", timer);
        }
        // Timeouts still apply.
        assert_eq!(timers.duration(Timer::B), Duration::from_secs(32));
        assert!(!timers.should_retransmit());
    }

    #[test]
    fn custom_defaults_scale_timeouts() {
        let custom = TimerDefaults {
            t1: Duration::from_millis(20),
            t2: Duration::from_millis(80),
            t4: Duration::from_millis(100),
        };
        let timers = TransactionTimers::with_defaults(TransportKind::Udp, custom);
        assert_eq!(timers.duration(Timer::B), Duration::from_millis(20 * 64));
        assert_eq!(timers.duration(Timer::K), Duration::from_millis(100));
    }
}
