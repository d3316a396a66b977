//! wall-clock helpers. workers read `Date.now()` once per request and pass
//! the millisecond timestamp down, so everything here is deterministic.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};

/// a single request's notion of "now"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Now {
    pub ms: u64,
    at: DateTime<Utc>,
}

impl Now {
    pub fn from_millis(ms: u64) -> Self {
        // past chrono's range the clock pins to its last representable instant
        let at = i64::try_from(ms)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { ms, at }
    }

    /// calendar day, `YYYY-MM-DD`
    pub fn date(&self) -> String {
        self.at.format("%Y-%m-%d").to_string()
    }

    /// hour of day, 0-23
    pub fn hour(&self) -> u32 {
        self.at.hour()
    }

    /// iso-8601 with millisecond precision, e.g. `2024-05-01T12:00:00.000Z`
    pub fn iso(&self) -> String {
        self.at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn plus_millis(&self, ms: u64) -> Self {
        Self::from_millis(self.ms.saturating_add(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-09T17:45:12.345Z
    const SAMPLE: u64 = 1_710_006_312_345;

    #[test]
    fn test_calendar_parts() {
        let now = Now::from_millis(SAMPLE);
        assert_eq!(now.date(), "2024-03-09");
        assert_eq!(now.hour(), 17);
        assert_eq!(now.iso(), "2024-03-09T17:45:12.345Z");
    }

    #[test]
    fn test_out_of_range_pins_to_max() {
        let far = Now::from_millis(u64::MAX);
        assert_eq!(far.ms, u64::MAX);
        assert_eq!(far.hour(), 23);
        assert_eq!(Now::from_millis(u64::MAX - 5).hour(), 23);
    }

    #[test]
    fn test_plus_one_day() {
        let tomorrow = Now::from_millis(SAMPLE).plus_millis(86_400_000);
        assert_eq!(tomorrow.date(), "2024-03-10");
    }
}
