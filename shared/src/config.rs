//! limits and store ttls, overridable from worker env vars.

/// seconds a daily counter / request log lives
pub const DAY_TTL_SECONDS: u64 = 86_400;
/// seconds an hourly counter lives
pub const HOUR_TTL_SECONDS: u64 = 3_600;
/// seconds user records and settings live
pub const RECORD_TTL_SECONDS: u64 = 31_536_000;
/// newest entries kept in a per-day request log
pub const REQUEST_LOG_CAP: i64 = 100;
/// length of the burst window
pub const BURST_WINDOW_MS: u64 = 60_000;
/// timestamps older than this are dropped from a profile
pub const PROFILE_HISTORY_MS: u64 = 3_600_000;
/// Retry-After for blocked clients
pub const BLOCKED_RETRY_AFTER_SECONDS: u64 = 3_600;

/// per-client usage limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub daily: u32,
    pub hourly: u32,
    /// max requests inside [`BURST_WINDOW_MS`]
    pub burst: u32,
    /// total logged requests above which a client is flagged
    pub suspicious_threshold: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            daily: 10,
            hourly: 5,
            burst: 3,
            suspicious_threshold: 20,
        }
    }
}

impl Limits {
    /// builds limits from a variable lookup (typically `env.var`), keeping
    /// the default for anything missing or unparsable
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |name: &str, fallback: u32| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(fallback)
        };

        Self {
            daily: read("DAILY_LIMIT", defaults.daily),
            hourly: read("HOURLY_LIMIT", defaults.hourly),
            burst: read("BURST_LIMIT", defaults.burst),
            suspicious_threshold: read("SUSPICIOUS_THRESHOLD", defaults.suspicious_threshold),
        }
    }
}

/// fixed-window limiter settings for the generation endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub limit: u32,
    pub window_seconds: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window_seconds: 60,
        }
    }
}

impl WindowConfig {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            limit: lookup("RATE_LIMIT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.limit),
            window_seconds: lookup("RATE_WINDOW_SECONDS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.window_seconds),
        }
    }
}
