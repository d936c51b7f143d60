use std::time::{Duration, Instant};

/// Bookkeeping for the negotiated heartbeat interval.
///
/// The timer fires every half interval; a heartbeat frame goes out whenever
/// the tx side has been quiet for more than half the interval. Receipt only
/// stamps `last_rx` - declaring the peer dead is left to the transport's own
/// inactivity reporting.
#[derive(Debug)]
pub(crate) struct HeartbeatClock {
    interval: Duration,
    last_rx: Instant,
    last_tx: Instant,
}

impl HeartbeatClock {
    pub(crate) fn new(interval_secs: u16, now: Instant) -> Option<HeartbeatClock> {
        if interval_secs == 0 {
            None
        } else {
            Some(HeartbeatClock {
                interval: Duration::from_secs(u64::from(interval_secs)),
                last_rx: now,
                last_tx: now,
            })
        }
    }

    /// How often the timer should fire.
    pub(crate) fn tick_interval(&self) -> Duration {
        self.interval / 2
    }

    pub(crate) fn record_rx(&mut self, now: Instant) {
        self.last_rx = now;
    }

    pub(crate) fn record_tx(&mut self, now: Instant) {
        self.last_tx = now;
    }

    #[allow(dead_code)]
    pub(crate) fn last_rx(&self) -> Instant {
        self.last_rx
    }

    /// True when a heartbeat frame is due on this tick.
    pub(crate) fn should_send(&self, now: Instant) -> bool {
        now.duration_since(self.last_tx) > self.tick_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn zero_interval_disables_heartbeats() {
        assert!(HeartbeatClock::new(0, Instant::now()).is_none());
    }

    #[test]
    fn ticks_at_half_interval() {
        let clock = HeartbeatClock::new(60, Instant::now()).unwrap();
        assert_eq!(clock.tick_interval(), secs(30));
    }

    #[test]
    fn sends_only_after_quiet_half_interval() {
        let start = Instant::now();
        let mut clock = HeartbeatClock::new(60, start).unwrap();

        assert!(!clock.should_send(start + secs(30)));
        assert!(clock.should_send(start + secs(31)));

        clock.record_tx(start + secs(31));
        assert!(!clock.should_send(start + secs(60)));
        assert!(clock.should_send(start + secs(62)));
    }

    #[test]
    fn receipt_updates_rx_stamp_only() {
        let start = Instant::now();
        let mut clock = HeartbeatClock::new(2, start).unwrap();
        clock.record_rx(start + secs(5));
        assert_eq!(clock.last_rx(), start + secs(5));
        // rx traffic never suppresses our own sends
        assert!(clock.should_send(start + secs(5)));
    }
}
