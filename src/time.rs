use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};

/// Source of wall-clock timestamps, in whole milliseconds since the Unix epoch.
///
/// Stage timestamps travel between processes, so they are wall-clock values rather
/// than `Instant`s. Deltas between stamps from different hosts are best-effort only.
pub trait Clock {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system's UTC wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for deterministic runs.
///
/// ```
/// use pubsub_latency::time::{Clock, ManualClock};
/// let clock = ManualClock::new(1000);
/// clock.advance(30);
/// assert_eq!(clock.now_millis(), 1030);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        ManualClock {
            now: AtomicI64::new(start_millis),
        }
    }

    /// Moves the clock to an absolute time.
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::Relaxed);
    }

    /// Moves the clock forward (or backward, for negative values).
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_millis(&self) -> i64 {
        (**self).now_millis()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_millis(&self) -> i64 {
        (**self).now_millis()
    }
}

/// Formats a UTC time for use inside file names.
///
/// The ISO-8601 form is kept, with `:` and `.` replaced by `-` so the result is a
/// valid file name on every platform.
pub fn file_name_timestamp(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_epoch() {
        let now = SystemClock.now_millis();
        // 2020-01-01T00:00:00Z
        assert!(now > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock_set_and_advance() {
        let clock = ManualClock::new(0);
        assert_eq!(clock.now_millis(), 0);
        clock.set(5_000);
        clock.advance(250);
        assert_eq!(clock.now_millis(), 5_250);
        clock.advance(-300);
        assert_eq!(clock.now_millis(), 4_950);
    }

    #[test]
    fn test_clock_through_reference() {
        let clock = ManualClock::new(42);
        let by_ref: &dyn Clock = &clock;
        assert_eq!(by_ref.now_millis(), 42);
    }

    #[test]
    fn test_file_name_timestamp_has_no_separators() {
        let date = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_000_000)
            .expect("Invalid timestamp");
        let stamp = file_name_timestamp(date);
        assert_eq!(stamp, "2023-11-14T22-13-20-123Z");
        assert!(!stamp.contains(':'));
        assert!(!stamp.contains('.'));
    }
}
