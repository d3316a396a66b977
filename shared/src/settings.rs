//! user settings and the rules for merging client-supplied patches.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Now;

pub const DEFAULT_RESULTS_COUNT: u8 = 7;
pub const MIN_RESULTS_COUNT: u8 = 3;
pub const MAX_RESULTS_COUNT: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub dark_mode: bool,
    pub results_count: u8,
    pub last_updated: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dark_mode: false,
            results_count: DEFAULT_RESULTS_COUNT,
            last_updated: String::new(),
        }
    }
}

impl Settings {
    pub fn defaults(now: &Now) -> Self {
        Self {
            last_updated: now.iso(),
            ..Self::default()
        }
    }

    /// merge a json patch over `self`.
    ///
    /// keys absent from the patch keep their current value; keys present but
    /// of the wrong type or out of range fall back to the defaults. anything
    /// else in the patch is dropped.
    pub fn apply_patch(&self, patch: &Value, now: &Now) -> Self {
        let mut next = Self {
            last_updated: now.iso(),
            ..self.clone()
        };

        if let Some(value) = patch.get("darkMode") {
            next.dark_mode = value.as_bool().unwrap_or(false);
        }

        if let Some(value) = patch.get("resultsCount") {
            next.results_count = value
                .as_u64()
                .filter(|n| (MIN_RESULTS_COUNT as u64..=MAX_RESULTS_COUNT as u64).contains(n))
                .map(|n| n as u8)
                .unwrap_or(DEFAULT_RESULTS_COUNT);
        }

        next
    }

    /// stored records may predate validation; re-check on read
    pub fn sanitized(mut self) -> Self {
        if !(MIN_RESULTS_COUNT..=MAX_RESULTS_COUNT).contains(&self.results_count) {
            self.results_count = DEFAULT_RESULTS_COUNT;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> Now {
        Now::from_millis(1_710_006_312_345)
    }

    #[test]
    fn test_defaults() {
        let s = Settings::defaults(&now());
        assert!(!s.dark_mode);
        assert_eq!(s.results_count, 7);
        assert_eq!(s.last_updated, "2024-03-09T17:45:12.345Z");
    }

    #[test]
    fn test_patch_overrides_present_keys_only() {
        let base = Settings { dark_mode: true, results_count: 4, last_updated: "old".into() };
        let next = base.apply_patch(&json!({ "resultsCount": 9 }), &now());
        assert!(next.dark_mode);
        assert_eq!(next.results_count, 9);
        assert_eq!(next.last_updated, "2024-03-09T17:45:12.345Z");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let base = Settings { dark_mode: true, results_count: 4, last_updated: String::new() };
        let next = base.apply_patch(&json!({ "darkMode": "yes", "resultsCount": 42 }), &now());
        assert!(!next.dark_mode);
        assert_eq!(next.results_count, 7);

        for bad in [json!(2), json!(11), json!(5.5), json!("5"), json!(-3), json!(null)] {
            let next = base.apply_patch(&json!({ "resultsCount": bad }), &now());
            assert_eq!(next.results_count, 7, "value {:?}", bad);
        }
    }

    #[test]
    fn test_bounds_inclusive() {
        let base = Settings::default();
        assert_eq!(base.apply_patch(&json!({ "resultsCount": 3 }), &now()).results_count, 3);
        assert_eq!(base.apply_patch(&json!({ "resultsCount": 10 }), &now()).results_count, 10);
    }

    #[test]
    fn test_unknown_keys_dropped() {
        let next = Settings::default().apply_patch(&json!({ "isAdmin": true, "darkMode": true }), &now());
        let json = serde_json::to_value(&next).unwrap();
        assert!(json.get("isAdmin").is_none());
        assert_eq!(json["darkMode"], true);
    }

    #[test]
    fn test_non_object_patch_only_touches_timestamp() {
        let base = Settings { dark_mode: true, results_count: 5, last_updated: String::new() };
        let next = base.apply_patch(&json!([1, 2, 3]), &now());
        assert!(next.dark_mode);
        assert_eq!(next.results_count, 5);
    }

    #[test]
    fn test_partial_stored_record_deserializes() {
        let s: Settings = serde_json::from_str(r#"{"darkMode":true}"#).unwrap();
        assert!(s.dark_mode);
        assert_eq!(s.results_count, 7);

        let s: Settings = serde_json::from_str(r#"{"resultsCount":99}"#).unwrap();
        assert_eq!(s.sanitized().results_count, 7);
    }
}
