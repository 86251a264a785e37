//! Window counter implementation.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Time unit used to express a window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// One millisecond
    Millisecond,
    /// One second
    Second,
    /// One minute
    Minute,
    /// One hour
    Hour,
    /// One day
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Millisecond => Duration::from_millis(1),
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Admission bookkeeping for the current window.
///
/// The counter is plain data: it is owned by the gate and only ever
/// touched under the gate's mutex, so none of the fields are atomic.
#[derive(Debug)]
pub struct WindowCounter {
    /// Admissions granted since the last reset
    admitted: u64,
    /// Admitted calls whose action has not finished yet
    in_flight: u64,
    /// Admissions granted over the lifetime of the counter
    total_admitted: u64,
    /// Number of resets performed
    windows_elapsed: u64,
    /// When the current window started
    window_start: Instant,
}

impl WindowCounter {
    /// Create a counter with an empty first window.
    pub fn new() -> Self {
        Self {
            admitted: 0,
            in_flight: 0,
            total_admitted: 0,
            windows_elapsed: 0,
            window_start: Instant::now(),
        }
    }

    /// Record one admission.
    pub fn admit(&mut self) {
        self.admitted += 1;
        self.in_flight += 1;
        self.total_admitted += 1;
    }

    /// Record the completion of one admitted call.
    pub fn release(&mut self) {
        debug_assert!(self.in_flight > 0, "release without matching admit");
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Start a new window. Returns the number of admissions the closed window saw.
    ///
    /// In-flight calls are unaffected.
    pub fn reset(&mut self) -> u64 {
        let closed = std::mem::take(&mut self.admitted);
        self.windows_elapsed += 1;
        self.window_start = Instant::now();
        closed
    }

    /// Admissions granted in the current window.
    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    /// Calls admitted but not yet released.
    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }

    /// Admissions granted since the counter was created.
    pub fn total_admitted(&self) -> u64 {
        self.total_admitted
    }

    /// Number of windows that have closed.
    pub fn windows_elapsed(&self) -> u64 {
        self.windows_elapsed
    }

    /// Get the duration until the current window of length `window` resets.
    pub fn duration_until_reset(&self, window: Duration) -> Duration {
        window.saturating_sub(self.window_start.elapsed())
    }
}

impl Default for WindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Millisecond.duration(), Duration::from_millis(1));
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_time_unit_deserializes_lowercase() {
        let unit: TimeUnit = serde_yaml::from_str("minute").unwrap();
        assert_eq!(unit, TimeUnit::Minute);
    }

    #[test]
    fn test_admit_and_release() {
        let mut counter = WindowCounter::new();

        counter.admit();
        counter.admit();
        assert_eq!(counter.admitted(), 2);
        assert_eq!(counter.in_flight(), 2);

        counter.release();
        assert_eq!(counter.admitted(), 2);
        assert_eq!(counter.in_flight(), 1);
    }

    #[test]
    fn test_reset_keeps_in_flight() {
        let mut counter = WindowCounter::new();
        for _ in 0..3 {
            counter.admit();
        }

        assert_eq!(counter.reset(), 3);
        assert_eq!(counter.admitted(), 0);
        assert_eq!(counter.in_flight(), 3);
        assert_eq!(counter.total_admitted(), 3);
        assert_eq!(counter.windows_elapsed(), 1);
    }

    #[test]
    fn test_duration_until_reset() {
        let counter = WindowCounter::new();
        let window = Duration::from_secs(60);

        let remaining = counter.duration_until_reset(window);
        assert!(remaining <= window);
        assert!(remaining > Duration::from_secs(59));

        assert_eq!(counter.duration_until_reset(Duration::ZERO), Duration::ZERO);
    }
}
