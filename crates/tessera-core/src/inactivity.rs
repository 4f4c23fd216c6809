//! Inactivity monitor: read deadline and write keep-alive timer.
//!
//! A half-failed TCP connection (peer host gone, FIN never delivered) looks
//! healthy to a blocked `read`. The monitor bounds how long that can go
//! unnoticed:
//!
//! - **read timer**: reset by every inbound frame. Expires after
//!   `max_inactivity × safety_factor` and declares the connection dead.
//! - **write timer**: reset by every outbound frame. Expires after
//!   `max_inactivity / 3` and asks the driver to send a keep-alive, so a peer
//!   using the same setting always sees traffic well inside its own limit.
//!
//! A zero `max_inactivity` makes the monitor inert.
//!
//! The monitor holds no timers of its own. Drivers ask for
//! [`InactivityMonitor::next_deadline`] and arm one sleep on the runtime's
//! shared timer wheel.

use std::time::{Duration, Instant};

/// Lowest accepted safety factor.
pub const MIN_SAFETY_FACTOR: f64 = 1.0;

/// Highest accepted safety factor.
pub const MAX_SAFETY_FACTOR: f64 = 1.5;

/// Outcome of [`InactivityMonitor::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Write timer fired: send a keep-alive now.
    SendKeepAlive,
    /// Read timer fired: the peer is silent.
    Inactive {
        /// Time since the last inbound frame
        elapsed: Duration,
        /// Read deadline in force
        limit: Duration,
    },
}

/// Per-connection read/write timer pair.
#[derive(Debug, Clone)]
pub struct InactivityMonitor {
    read_limit: Duration,
    write_interval: Duration,
    last_read: Instant,
    last_write: Instant,
    expired: bool,
}

impl InactivityMonitor {
    /// Start monitoring at `now` with the negotiated max inactivity.
    ///
    /// `safety_factor` is clamped to
    /// [`MIN_SAFETY_FACTOR`]..=[`MAX_SAFETY_FACTOR`]; a non-finite value
    /// falls back to the minimum.
    #[must_use]
    pub fn new(max_inactivity: Duration, safety_factor: f64, now: Instant) -> Self {
        let factor = if safety_factor.is_finite() {
            safety_factor.clamp(MIN_SAFETY_FACTOR, MAX_SAFETY_FACTOR)
        } else {
            MIN_SAFETY_FACTOR
        };

        Self {
            read_limit: max_inactivity.mul_f64(factor),
            write_interval: max_inactivity / 3,
            last_read: now,
            last_write: now,
            expired: false,
        }
    }

    /// True if monitoring is disabled.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.read_limit.is_zero()
    }

    /// Read deadline (`max_inactivity × safety_factor`).
    #[must_use]
    pub fn read_limit(&self) -> Duration {
        self.read_limit
    }

    /// Keep-alive interval.
    #[must_use]
    pub fn write_interval(&self) -> Duration {
        self.write_interval
    }

    /// Time of the last inbound frame.
    #[must_use]
    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    /// Time of the last outbound frame.
    #[must_use]
    pub fn last_write(&self) -> Instant {
        self.last_write
    }

    /// Reset the read timer.
    pub fn record_read(&mut self, now: Instant) {
        self.last_read = self.last_read.max(now);
    }

    /// Reset the write timer.
    pub fn record_write(&mut self, now: Instant) {
        self.last_write = self.last_write.max(now);
    }

    /// Check both timers at `now`.
    ///
    /// A silent peer is reported once; afterwards the monitor stays quiet.
    /// A returned keep-alive counts as written at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<MonitorEvent> {
        if self.is_inert() || self.expired {
            return None;
        }

        let silent_for = now.saturating_duration_since(self.last_read);
        if silent_for > self.read_limit {
            self.expired = true;
            return Some(MonitorEvent::Inactive { elapsed: silent_for, limit: self.read_limit });
        }

        if now.saturating_duration_since(self.last_write) >= self.write_interval {
            self.last_write = now;
            return Some(MonitorEvent::SendKeepAlive);
        }

        None
    }

    /// Earliest instant at which [`poll`](Self::poll) can return an event.
    ///
    /// The read deadline is reported one millisecond past the limit because
    /// expiry requires strictly more silence than the limit.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_inert() || self.expired {
            return None;
        }
        let read_deadline = self.last_read + self.read_limit + Duration::from_millis(1);
        let write_deadline = self.last_write + self.write_interval;
        Some(read_deadline.min(write_deadline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: Duration = Duration::from_secs(30);

    #[test]
    fn zero_duration_is_inert() {
        let now = Instant::now();
        let mut monitor = InactivityMonitor::new(Duration::ZERO, 1.0, now);

        assert!(monitor.is_inert());
        assert_eq!(monitor.poll(now + Duration::from_secs(3600)), None);
        assert_eq!(monitor.next_deadline(), None);
    }

    #[test]
    fn keep_alive_after_a_third_of_the_interval() {
        let now = Instant::now();
        let mut monitor = InactivityMonitor::new(D, 1.0, now);

        assert_eq!(monitor.poll(now + Duration::from_secs(9)), None);
        assert_eq!(monitor.poll(now + Duration::from_secs(10)), Some(MonitorEvent::SendKeepAlive));
        // The keep-alive reset the write timer.
        assert_eq!(monitor.poll(now + Duration::from_secs(11)), None);
    }

    #[test]
    fn outbound_traffic_postpones_keep_alive() {
        let now = Instant::now();
        let mut monitor = InactivityMonitor::new(D, 1.0, now);

        monitor.record_write(now + Duration::from_secs(8));
        assert_eq!(monitor.poll(now + Duration::from_secs(10)), None);
        assert_eq!(monitor.poll(now + Duration::from_secs(18)), Some(MonitorEvent::SendKeepAlive));
    }

    #[test]
    fn silence_past_limit_is_reported_once() {
        let now = Instant::now();
        let mut monitor = InactivityMonitor::new(D, 1.0, now);

        let later = now + Duration::from_secs(31);
        assert_eq!(
            monitor.poll(later),
            Some(MonitorEvent::Inactive { elapsed: Duration::from_secs(31), limit: D })
        );
        assert_eq!(monitor.poll(later + Duration::from_secs(1)), None);
        assert_eq!(monitor.next_deadline(), None);
    }

    #[test]
    fn inbound_traffic_resets_read_timer() {
        let now = Instant::now();
        let mut monitor = InactivityMonitor::new(D, 1.0, now);

        monitor.record_read(now + Duration::from_secs(25));
        monitor.record_write(now + Duration::from_secs(50));
        assert_eq!(monitor.poll(now + Duration::from_secs(50)), None);
    }

    #[test]
    fn safety_factor_extends_read_limit() {
        let now = Instant::now();
        let monitor = InactivityMonitor::new(D, 1.5, now);
        assert_eq!(monitor.read_limit(), Duration::from_secs(45));

        let clamped = InactivityMonitor::new(D, 4.0, now);
        assert_eq!(clamped.read_limit(), Duration::from_secs(45));

        let floor = InactivityMonitor::new(D, 0.2, now);
        assert_eq!(floor.read_limit(), D);

        let nan = InactivityMonitor::new(D, f64::NAN, now);
        assert_eq!(nan.read_limit(), D);
    }

    #[test]
    fn next_deadline_is_the_earlier_timer() {
        let now = Instant::now();
        let monitor = InactivityMonitor::new(D, 1.0, now);
        assert_eq!(monitor.next_deadline(), Some(now + Duration::from_secs(10)));
    }
}
