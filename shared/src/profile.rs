//! single-record user profile: settings, usage windows and security
//! metadata stored together as one json document under `user:{hash}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Now;
use crate::config::{Limits, PROFILE_HISTORY_MS, RECORD_TTL_SECONDS};
use crate::settings::Settings;
use crate::store::{KvStore, StoreError};
use crate::usage::{detect_activity, evaluate, remaining, ActivityReport, BurstRule, Denial, UsageSnapshot, Verdict};

pub fn profile_key(hash: &str) -> String {
    format!("user:{}", hash)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyWindow {
    pub date: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HourlyWindow {
    pub date: String,
    pub hour: u32,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageWindows {
    pub daily: DailyWindow,
    pub hourly: HourlyWindow,
    /// request timestamps (ms) from the last hour
    pub requests: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityMeta {
    pub created_at: String,
    pub last_activity: String,
    pub blocked: bool,
    pub suspicious_activity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub settings: Settings,
    pub usage: UsageWindows,
    pub security: SecurityMeta,
    pub expires_at: String,
}

impl UserProfile {
    pub fn new(now: &Now) -> Self {
        let today = now.date();
        Self {
            settings: Settings::defaults(now),
            usage: UsageWindows {
                daily: DailyWindow { date: today.clone(), count: 0 },
                hourly: HourlyWindow { date: today, hour: now.hour(), count: 0 },
                requests: Vec::new(),
            },
            security: SecurityMeta {
                created_at: now.iso(),
                last_activity: now.iso(),
                blocked: false,
                suspicious_activity: 0,
            },
            expires_at: now.plus_millis(RECORD_TTL_SECONDS * 1000).iso(),
        }
    }

    /// reset windows that belong to an earlier day/hour and forget
    /// timestamps older than an hour
    pub fn roll_windows(&mut self, now: &Now) {
        let today = now.date();
        let hour = now.hour();

        if self.usage.daily.date != today {
            self.usage.daily = DailyWindow { date: today.clone(), count: 0 };
            self.usage.requests.clear();
        }
        if self.usage.hourly.date != today || self.usage.hourly.hour != hour {
            self.usage.hourly = HourlyWindow { date: today, hour, count: 0 };
        }
        self.usage
            .requests
            .retain(|ts| now.ms.saturating_sub(*ts) < PROFILE_HISTORY_MS);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            daily: self.usage.daily.count,
            hourly: self.usage.hourly.count,
        }
    }

    /// count one request; mutates only when the request is allowed
    pub fn register_usage(&mut self, now: &Now, limits: &Limits) -> Result<ActivityReport, Denial> {
        self.roll_windows(now);

        let report = detect_activity(&self.usage.requests, now.ms, limits, BurstRule::AtLimit);
        if let Verdict::Denied(reason) = evaluate(self.usage.daily.count, self.usage.hourly.count, &report, limits) {
            return Err(Denial { reason, daily: self.usage.daily.count });
        }

        self.usage.daily.count += 1;
        self.usage.hourly.count += 1;
        self.usage.requests.push(now.ms);

        self.security.last_activity = now.iso();
        if report.suspicious {
            self.security.suspicious_activity += 1;
        }
        Ok(report)
    }

    pub fn update_settings(&mut self, patch: &Value, now: &Now) -> &Settings {
        self.settings = self.settings.apply_patch(patch, now);
        self.security.last_activity = now.iso();
        &self.settings
    }

    pub fn summary(&self, limits: &Limits) -> ProfileSummary {
        ProfileSummary {
            settings: self.settings.clone(),
            usage: UsageTotals {
                daily: self.usage.daily.count,
                remaining: remaining(limits.daily, self.usage.daily.count),
                limit: limits.daily,
            },
            last_activity: self.security.last_activity.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageTotals {
    pub daily: u32,
    pub remaining: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub settings: Settings,
    pub usage: UsageTotals,
    pub last_activity: String,
}

/// what `load` found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded {
    pub profile: UserProfile,
    /// false when no record existed yet
    pub existing: bool,
}

/// fetch a profile, falling back to a fresh one. stored documents missing
/// fields are completed from defaults; unreadable ones are replaced.
pub async fn load<S: KvStore>(store: &S, hash: &str, now: &Now) -> Result<Loaded, StoreError> {
    let raw = store.get(&profile_key(hash)).await?;
    let fresh = UserProfile::new(now);

    let Some(raw) = raw else {
        return Ok(Loaded { profile: fresh, existing: false });
    };

    match serde_json::from_str::<UserProfile>(&raw) {
        Ok(mut profile) => {
            profile.settings = profile.settings.sanitized();
            if profile.security.created_at.is_empty() {
                profile.security.created_at = fresh.security.created_at;
            }
            if profile.expires_at.is_empty() {
                profile.expires_at = fresh.expires_at;
            }
            Ok(Loaded { profile, existing: true })
        }
        Err(_) => Ok(Loaded { profile: fresh, existing: false }),
    }
}

/// write the whole record back and refresh its ttl
pub async fn save<S: KvStore>(store: &S, hash: &str, profile: &UserProfile) -> Result<(), StoreError> {
    let key = profile_key(hash);
    let json = serde_json::to_string(profile)?;
    store.set(&key, &json).await?;
    store.expire(&key, RECORD_TTL_SECONDS).await
}
