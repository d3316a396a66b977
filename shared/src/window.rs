//! fixed-window request limiter for the generation endpoint.
//!
//! each client gets one json counter `{count, window_start}` in the store,
//! expiring with the window. a request either lands in the current window or
//! opens a new one.

use serde::{Deserialize, Serialize};

use crate::config::WindowConfig;
use crate::store::{KvStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateInfo {
    pub count: u32,
    /// unix seconds
    pub window_start: u64,
}

impl RateInfo {
    fn fresh(now_secs: u64) -> Self {
        Self { count: 0, window_start: now_secs }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// unix seconds at which the current window closes
    pub reset_at: u64,
}

impl WindowDecision {
    pub fn retry_after(&self, now_secs: u64) -> u64 {
        self.reset_at.saturating_sub(now_secs)
    }
}

pub fn window_key(hash: &str) -> String {
    format!("rate:{}", hash)
}

/// pure step: what the counter becomes after one more request
pub fn advance(current: Option<RateInfo>, now_secs: u64, config: &WindowConfig) -> (WindowDecision, Option<RateInfo>) {
    let mut info = match current {
        Some(info) if now_secs.saturating_sub(info.window_start) < config.window_seconds => info,
        _ => RateInfo::fresh(now_secs),
    };
    let reset_at = info.window_start.saturating_add(config.window_seconds);

    if info.count >= config.limit {
        let decision = WindowDecision { allowed: false, remaining: 0, reset_at };
        return (decision, None);
    }

    info.count += 1;
    let decision = WindowDecision {
        allowed: true,
        remaining: config.limit.saturating_sub(info.count),
        reset_at,
    };
    (decision, Some(info))
}

/// check and consume one request for `hash`
pub async fn check<S: KvStore>(
    store: &S,
    hash: &str,
    now_secs: u64,
    config: &WindowConfig,
) -> Result<WindowDecision, StoreError> {
    let key = window_key(hash);
    let current = match store.get(&key).await? {
        Some(json) => serde_json::from_str::<RateInfo>(&json).ok(),
        None => None,
    };

    let (decision, updated) = advance(current, now_secs, config);
    if let Some(info) = updated {
        store.set(&key, &serde_json::to_string(&info)?).await?;
        store.expire(&key, config.window_seconds).await?;
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use futures::executor::block_on;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn test_rate_info_serialization() {
        let info = RateInfo { count: 5, window_start: 1234567890 };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"count\":5"));
        assert!(json.contains("\"window_start\":1234567890"));
    }

    #[test]
    fn test_first_request_opens_window() {
        let config = WindowConfig::default();
        let (decision, info) = advance(None, NOW, &config);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.reset_at, NOW + 60);
        assert_eq!(info, Some(RateInfo { count: 1, window_start: NOW }));
    }

    #[test]
    fn test_limit_reached_within_window() {
        let config = WindowConfig::default();
        let full = RateInfo { count: 10, window_start: NOW - 30 };
        let (decision, info) = advance(Some(full), NOW, &config);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after(NOW), 30);
        assert_eq!(info, None);
    }

    #[test]
    fn test_expired_window_resets() {
        let config = WindowConfig::default();
        let full = RateInfo { count: 10, window_start: NOW - 60 };
        let (decision, info) = advance(Some(full), NOW, &config);
        assert!(decision.allowed);
        assert_eq!(info.unwrap().count, 1);
    }

    #[test]
    fn test_huge_window_saturates() {
        let config = WindowConfig { limit: 1, window_seconds: u64::MAX };
        let (decision, info) = advance(None, NOW, &config);
        assert!(decision.allowed);
        assert_eq!(decision.reset_at, u64::MAX);

        let (decision, _) = advance(info, NOW + 1, &config);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after(NOW + 1), u64::MAX - NOW - 1);
    }

    #[test]
    fn test_store_backed_sequence() {
        let store = MemoryStore::new();
        let config = WindowConfig { limit: 2, window_seconds: 60 };

        assert!(block_on(check(&store, "h", NOW, &config)).unwrap().allowed);
        assert!(block_on(check(&store, "h", NOW + 1, &config)).unwrap().allowed);
        let third = block_on(check(&store, "h", NOW + 2, &config)).unwrap();
        assert!(!third.allowed);
        assert_eq!(third.retry_after(NOW + 2), 58);
        assert_eq!(store.ttl("rate:h"), Some(60));

        // other clients are independent
        assert!(block_on(check(&store, "other", NOW + 2, &config)).unwrap().allowed);
    }

    #[test]
    fn test_corrupt_counter_treated_as_fresh() {
        let store = MemoryStore::new();
        block_on(store.set("rate:h", "garbage")).unwrap();
        let decision = block_on(check(&store, "h", NOW, &WindowConfig::default())).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }
}
