//! Clock abstraction (injectable for testing).

use chrono::{DateTime, TimeZone, Utc};

/// Provides the current wall-clock time.
///
/// Injecting this rather than calling `Utc::now()` directly keeps
/// timing-sensitive code (ID generation, fire planning) deterministic in
/// tests.
pub trait Clock: Send + Sync {
    /// Current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Current time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// The default [`Clock`] backed by the system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_returns_plausible_timestamp() {
        let clock = SystemClock;
        // After 2020-01-01.
        assert!(clock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn system_clock_is_monotone_enough() {
        let clock = SystemClock;
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
    }

    #[test]
    fn now_utc_matches_now_millis() {
        let clock = SystemClock;
        let utc = clock.now_utc().timestamp_millis();
        let ms = clock.now_millis();
        assert!((utc - ms).abs() < 1_000);
    }
}
