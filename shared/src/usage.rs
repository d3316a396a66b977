//! usage accounting decisions shared by the counter and profile schemes.
//!
//! nothing in here touches the store: callers load counts and timestamps,
//! ask for a [`Verdict`], and only persist increments when it is
//! [`Verdict::Allowed`].

use serde::Serialize;

use crate::config::{Limits, BURST_WINDOW_MS};
use crate::http::JsonReply;

/// outcome of inspecting a client's recent request timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityReport {
    /// requests inside the burst window
    pub recent: u32,
    /// total timestamps inspected
    pub total: u32,
    pub too_many_recent: bool,
    pub suspicious: bool,
    pub rapid_fire: bool,
    pub high_volume: bool,
}

const RAPID_FIRE_MIN: u32 = 3;
const HIGH_VOLUME_MIN: u32 = 15;

/// how the burst count is compared against `Limits::burst`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstRule {
    /// refuse once `recent >= burst` (profile scheme)
    AtLimit,
    /// refuse only once `recent > burst` (counter scheme)
    OverLimit,
}

impl BurstRule {
    fn exceeded(self, recent: u32, burst: u32) -> bool {
        match self {
            BurstRule::AtLimit => recent >= burst,
            BurstRule::OverLimit => recent > burst,
        }
    }
}

pub fn detect_activity(timestamps_ms: &[u64], now_ms: u64, limits: &Limits, rule: BurstRule) -> ActivityReport {
    let recent = timestamps_ms
        .iter()
        .filter(|ts| now_ms.saturating_sub(**ts) < BURST_WINDOW_MS)
        .count() as u32;
    let total = timestamps_ms.len() as u32;

    ActivityReport {
        recent,
        total,
        too_many_recent: rule.exceeded(recent, limits.burst),
        suspicious: total > limits.suspicious_threshold,
        rapid_fire: recent >= RAPID_FIRE_MIN,
        high_volume: total > HIGH_VOLUME_MIN,
    }
}

/// why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    Burst,
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(DenialReason),
}

/// checked in order: burst, daily, hourly
pub fn evaluate(daily: u32, hourly: u32, report: &ActivityReport, limits: &Limits) -> Verdict {
    if report.too_many_recent {
        Verdict::Denied(DenialReason::Burst)
    } else if daily >= limits.daily {
        Verdict::Denied(DenialReason::Daily)
    } else if hourly >= limits.hourly {
        Verdict::Denied(DenialReason::Hourly)
    } else {
        Verdict::Allowed
    }
}

pub fn remaining(limit: u32, count: u32) -> u32 {
    limit.saturating_sub(count)
}

/// a refused request, ready to be rendered as a 429
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenialReason,
    /// daily count at the time of refusal
    pub daily: u32,
}

impl Denial {
    pub fn message(&self) -> &'static str {
        match self.reason {
            DenialReason::Burst => "Too many requests. Please slow down.",
            DenialReason::Daily => "Daily limit reached",
            DenialReason::Hourly => "Hourly limit reached. Please try again later.",
        }
    }

    /// value for `X-RateLimit-Limit`
    pub fn header_limit(&self, limits: &Limits) -> u32 {
        match self.reason {
            DenialReason::Burst => limits.burst,
            DenialReason::Daily => limits.daily,
            DenialReason::Hourly => limits.hourly,
        }
    }

    /// seconds for `Retry-After`, when the reason carries one
    pub fn retry_after(&self) -> Option<u64> {
        match self.reason {
            DenialReason::Burst => Some(BURST_WINDOW_MS / 1000),
            _ => None,
        }
    }

    pub fn body(&self, limits: &Limits) -> DeniedBody {
        let remaining = match self.reason {
            DenialReason::Hourly => remaining(limits.daily, self.daily),
            _ => 0,
        };
        DeniedBody {
            success: false,
            error: self.message().to_string(),
            count: self.daily,
            limit: limits.daily,
            remaining,
        }
    }

    /// the 429 reply with its rate-limit headers
    pub fn reply(&self, limits: &Limits) -> serde_json::Result<JsonReply> {
        let mut reply = JsonReply::json(429, &self.body(limits))?
            .with_header("X-RateLimit-Limit", self.header_limit(limits).to_string())
            .with_header("X-RateLimit-Remaining", "0");
        if let Some(retry) = self.retry_after() {
            reply = reply.with_header("Retry-After", retry.to_string());
        }
        Ok(reply)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeniedBody {
    pub success: bool,
    pub error: String,
    pub count: u32,
    pub limit: u32,
    pub remaining: u32,
}

/// current daily/hourly position of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageSnapshot {
    pub daily: u32,
    pub hourly: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySummary {
    pub within_limits: bool,
    pub hourly_count: u32,
}

/// 200 reply body for usage queries and successful increments
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBody {
    pub success: bool,
    pub count: u32,
    pub redis_available: bool,
    pub limit: u32,
    pub remaining: u32,
    pub hourly_remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_date: Option<String>,
    pub security: SecuritySummary,
}

impl UsageSnapshot {
    pub fn body(&self, limits: &Limits, redis_available: bool, reset_date: Option<String>) -> UsageBody {
        let daily_remaining = remaining(limits.daily, self.daily);
        let hourly_remaining = remaining(limits.hourly, self.hourly);
        UsageBody {
            success: true,
            count: self.daily,
            redis_available,
            limit: limits.daily,
            remaining: daily_remaining,
            hourly_remaining,
            reset_date,
            security: SecuritySummary {
                within_limits: daily_remaining > 0 && hourly_remaining > 0,
                hourly_count: self.hourly,
            },
        }
    }
}
