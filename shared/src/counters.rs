//! counter-per-window usage scheme.
//!
//! each client has three keys per day: a daily counter, an hourly counter
//! and a newest-first log of request timestamps. counters are only
//! incremented after the request passes every limit. the burst check here
//! only trips once the minute holds more than `Limits::burst` requests.

use crate::clock::Now;
use crate::config::{Limits, DAY_TTL_SECONDS, HOUR_TTL_SECONDS, REQUEST_LOG_CAP};
use crate::store::{KvStore, StoreError};
use crate::usage::{detect_activity, evaluate, ActivityReport, BurstRule, Denial, UsageSnapshot, Verdict};

/// the three keys a client touches on a given day/hour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterKeys {
    pub daily: String,
    pub hourly: String,
    pub requests: String,
}

impl CounterKeys {
    pub fn new(hash: &str, now: &Now) -> Self {
        let today = now.date();
        Self {
            daily: format!("usage:{}:{}", hash, today),
            hourly: format!("usage:{}:{}:{}", hash, today, now.hour()),
            requests: format!("requests:{}:{}", hash, today),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded {
        snapshot: UsageSnapshot,
        report: ActivityReport,
    },
    Denied(Denial),
}

fn to_count(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}

/// missing or garbage counters read as zero
fn parse_count(raw: Option<String>) -> u32 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .map(to_count)
        .unwrap_or(0)
}

fn parse_timestamps(raw: Vec<String>) -> Vec<u64> {
    raw.iter()
        .filter_map(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .collect()
}

/// read the current position without consuming anything
pub async fn peek<S: KvStore>(store: &S, hash: &str, now: &Now) -> Result<UsageSnapshot, StoreError> {
    let keys = CounterKeys::new(hash, now);
    let daily = parse_count(store.get(&keys.daily).await?);
    let hourly = parse_count(store.get(&keys.hourly).await?);
    Ok(UsageSnapshot { daily, hourly })
}

/// count one request against the client's limits
pub async fn record<S: KvStore>(
    store: &S,
    hash: &str,
    now: &Now,
    limits: &Limits,
) -> Result<RecordOutcome, StoreError> {
    let keys = CounterKeys::new(hash, now);

    let daily = parse_count(store.get(&keys.daily).await?);
    let hourly = parse_count(store.get(&keys.hourly).await?);
    let timestamps = parse_timestamps(store.lrange(&keys.requests, 0, -1).await?);

    let report = detect_activity(&timestamps, now.ms, limits, BurstRule::OverLimit);
    if let Verdict::Denied(reason) = evaluate(daily, hourly, &report, limits) {
        return Ok(RecordOutcome::Denied(Denial { reason, daily }));
    }

    let daily = store.incr(&keys.daily).await?;
    let hourly = store.incr(&keys.hourly).await?;
    store.lpush(&keys.requests, &now.ms.to_string()).await?;

    store.expire(&keys.daily, DAY_TTL_SECONDS).await?;
    store.expire(&keys.hourly, HOUR_TTL_SECONDS).await?;
    store.expire(&keys.requests, DAY_TTL_SECONDS).await?;
    store.ltrim(&keys.requests, 0, REQUEST_LOG_CAP - 1).await?;

    Ok(RecordOutcome::Recorded {
        snapshot: UsageSnapshot {
            daily: to_count(daily),
            hourly: to_count(hourly),
        },
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::usage::DenialReason;
    use futures::executor::block_on;

    // 2024-03-09T17:45:12.345Z
    const T0: u64 = 1_710_006_312_345;
    const HASH: &str = "0123456789abcdef";

    fn at(offset_seconds: u64) -> Now {
        Now::from_millis(T0 + offset_seconds * 1000)
    }

    #[test]
    fn test_key_layout() {
        let keys = CounterKeys::new(HASH, &at(0));
        assert_eq!(keys.daily, "usage:0123456789abcdef:2024-03-09");
        assert_eq!(keys.hourly, "usage:0123456789abcdef:2024-03-09:17");
        assert_eq!(keys.requests, "requests:0123456789abcdef:2024-03-09");
    }

    #[test]
    fn test_peek_on_fresh_client() {
        let store = MemoryStore::new();
        let snapshot = block_on(peek(&store, HASH, &at(0))).unwrap();
        assert_eq!(snapshot, UsageSnapshot::default());
    }

    #[test]
    fn test_record_increments_and_sets_ttls() {
        let store = MemoryStore::new();
        let limits = Limits::default();
        let now = at(0);

        let outcome = block_on(record(&store, HASH, &now, &limits)).unwrap();
        match outcome {
            RecordOutcome::Recorded { snapshot, .. } => {
                assert_eq!(snapshot, UsageSnapshot { daily: 1, hourly: 1 });
            }
            other => panic!("expected recorded, got {:?}", other),
        }

        let keys = CounterKeys::new(HASH, &now);
        assert_eq!(store.ttl(&keys.daily), Some(86_400));
        assert_eq!(store.ttl(&keys.hourly), Some(3_600));
        assert_eq!(store.ttl(&keys.requests), Some(86_400));
        assert_eq!(store.list_len(&keys.requests), 1);

        let snapshot = block_on(peek(&store, HASH, &now)).unwrap();
        assert_eq!(snapshot.daily, 1);
    }

    #[test]
    fn test_burst_denied_without_increment() {
        let store = MemoryStore::new();
        let limits = Limits::default();

        // three logged requests inside a minute still leave room for a fourth
        for i in 0..4 {
            let outcome = block_on(record(&store, HASH, &at(i * 5), &limits)).unwrap();
            assert!(matches!(outcome, RecordOutcome::Recorded { .. }), "request {}", i);
        }

        let outcome = block_on(record(&store, HASH, &at(20), &limits)).unwrap();
        assert_eq!(
            outcome,
            RecordOutcome::Denied(Denial { reason: DenialReason::Burst, daily: 4 })
        );
        assert_eq!(block_on(peek(&store, HASH, &at(20))).unwrap().daily, 4);
    }

    #[test]
    fn test_hourly_limit_then_next_hour() {
        let store = MemoryStore::new();
        let limits = Limits::default();

        // space requests two minutes apart to stay clear of the burst check;
        // 17:45 + 5 * 2min stays inside hour 17
        for i in 0..5 {
            let outcome = block_on(record(&store, HASH, &at(i * 120), &limits)).unwrap();
            assert!(matches!(outcome, RecordOutcome::Recorded { .. }));
        }
        let outcome = block_on(record(&store, HASH, &at(600), &limits)).unwrap();
        assert_eq!(
            outcome,
            RecordOutcome::Denied(Denial { reason: DenialReason::Hourly, daily: 5 })
        );

        // 18:05 is a new hourly key
        let outcome = block_on(record(&store, HASH, &at(20 * 60), &limits)).unwrap();
        match outcome {
            RecordOutcome::Recorded { snapshot, .. } => {
                assert_eq!(snapshot, UsageSnapshot { daily: 6, hourly: 1 });
            }
            other => panic!("expected recorded, got {:?}", other),
        }
    }

    #[test]
    fn test_daily_limit() {
        let store = MemoryStore::new();
        let limits = Limits { hourly: 100, ..Limits::default() };

        for i in 0..10 {
            let outcome = block_on(record(&store, HASH, &at(i * 120), &limits)).unwrap();
            assert!(matches!(outcome, RecordOutcome::Recorded { .. }));
        }
        let outcome = block_on(record(&store, HASH, &at(10 * 120), &limits)).unwrap();
        assert_eq!(
            outcome,
            RecordOutcome::Denied(Denial { reason: DenialReason::Daily, daily: 10 })
        );
    }

    #[test]
    fn test_request_log_is_capped() {
        let store = MemoryStore::new();
        let limits = Limits { daily: 1000, hourly: 1000, ..Limits::default() };

        for i in 0..105 {
            block_on(record(&store, HASH, &at(i * 61), &limits)).unwrap();
        }
        let keys = CounterKeys::new(HASH, &at(0));
        assert_eq!(store.list_len(&keys.requests), 100);
    }

    #[test]
    fn test_suspicious_flag_reported() {
        let store = MemoryStore::new();
        let limits = Limits { daily: 1000, hourly: 1000, ..Limits::default() };

        let mut flagged = false;
        for i in 0..22 {
            if let RecordOutcome::Recorded { report, .. } =
                block_on(record(&store, HASH, &at(i * 61), &limits)).unwrap()
            {
                flagged = report.suspicious;
            }
        }
        assert!(flagged);
    }

    #[test]
    fn test_garbage_counter_reads_as_zero() {
        let store = MemoryStore::new();
        let keys = CounterKeys::new(HASH, &at(0));
        block_on(store.set(&keys.daily, "not-a-number")).unwrap();
        assert_eq!(block_on(peek(&store, HASH, &at(0))).unwrap().daily, 0);
    }

    #[test]
    fn test_store_failure_propagates() {
        let store = MemoryStore::new();
        store.go_offline();
        assert!(block_on(record(&store, HASH, &at(0), &Limits::default())).is_err());
    }
}
