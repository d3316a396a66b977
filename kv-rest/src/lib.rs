//! ==============================================================================
//! lib.rs - rest key-value client for cloudflare workers
//! ==============================================================================
//!
//! purpose:
//!     implements `shared::KvStore` on top of an upstash-style redis rest
//!     api, using the workers fetch() api. each command is one http call:
//! ```text
//!         GET  {base}/get/{key}
//!         POST {base}/set/{key}            body = value
//!         POST {base}/incr/{key}
//!         POST {base}/expire/{key}/{seconds}
//!         POST {base}/lpush/{key}/{value}
//!         GET  {base}/lrange/{key}/{start}/{stop}
//!         POST {base}/ltrim/{key}/{start}/{stop}
//!
//!     replies are `{"result": ...}` on success and `{"error": "..."}`
//!     otherwise.
//! ```
//!
//! relationships:
//!     - implements: shared::KvStore
//!     - used by: workers/check-usage, user-data, user-settings,
//!       generate-analysis
//!
//! configuration:
//!     UPSTASH_REDIS_REST_URL and UPSTASH_REDIS_REST_TOKEN, as secrets or
//!     plain vars. when either is missing the workers run without a store.
//!
//! ==============================================================================

use serde::Deserialize;
use serde_json::Value;
use shared::{KvStore, StoreError};
use worker::*;

pub const URL_VAR: &str = "UPSTASH_REDIS_REST_URL";
pub const TOKEN_VAR: &str = "UPSTASH_REDIS_REST_TOKEN";

// ==============================================================================
// configuration
// ==============================================================================

/// read a secret, falling back to a plain var; blank values count as missing
pub fn env_value(env: &Env, name: &str) -> Option<String> {
    env.secret(name)
        .map(|s| s.to_string())
        .or_else(|_| env.var(name).map(|v| v.to_string()))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct RestStore {
    base: Url,
    token: String,
}

impl RestStore {
    pub fn new(base_url: &str, token: impl Into<String>) -> std::result::Result<Self, StoreError> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| StoreError::Transport(format!("invalid store url: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Transport(format!("invalid store url: {}", base_url)));
        }
        Ok(Self { base, token: token.into() })
    }

    /// `None` when the store is not configured or the url is unusable
    pub fn from_env(env: &Env) -> Option<Self> {
        let url = env_value(env, URL_VAR)?;
        let token = env_value(env, TOKEN_VAR)?;
        match Self::new(&url, token) {
            Ok(store) => Some(store),
            Err(e) => {
                console_error!("store disabled: {}", e);
                None
            }
        }
    }

    /// the token doubles as the pepper for client hashes
    pub fn token(&self) -> &str {
        &self.token
    }

    /// `{base}/{segments...}` with each segment percent-encoded
    pub fn command_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }

    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&str>,
    ) -> std::result::Result<Value, StoreError> {
        let command = segments.first().copied().unwrap_or_default();
        let url = self.command_url(segments);

        let headers = Headers::new();
        headers
            .set("Authorization", &format!("Bearer {}", self.token))
            .map_err(transport)?;
        if body.is_some() {
            headers.set("Content-Type", "application/json").map_err(transport)?;
        }

        let mut init = RequestInit::new();
        init.with_method(method).with_headers(headers);
        if let Some(body) = body {
            init.with_body(Some(body.into()));
        }

        let request = Request::new_with_init(url.as_str(), &init).map_err(transport)?;
        let mut response = Fetch::Request(request).send().await.map_err(transport)?;
        let status = response.status_code();
        let text = response.text().await.map_err(transport)?;

        decode_reply(command, status, &text)
    }
}

fn transport(e: Error) -> StoreError {
    StoreError::Transport(e.to_string())
}

// ==============================================================================
// reply decoding
// ==============================================================================

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// turn an http reply into the command's `result`
pub fn decode_reply(command: &str, status: u16, text: &str) -> std::result::Result<Value, StoreError> {
    let reply: Reply = match serde_json::from_str(text) {
        Ok(reply) => reply,
        Err(_) if !(200..300).contains(&status) => {
            return Err(StoreError::Rejected {
                command: command.to_string(),
                message: format!("http {}", status),
            })
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(message) = reply.error {
        return Err(StoreError::Rejected { command: command.to_string(), message });
    }
    if !(200..300).contains(&status) {
        return Err(StoreError::Rejected {
            command: command.to_string(),
            message: format!("http {}", status),
        });
    }
    Ok(reply.result)
}

/// `get` results are strings, but some clients store raw json values
pub fn result_as_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

pub fn result_as_int(value: &Value) -> std::result::Result<i64, StoreError> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| StoreError::Decode(format!("expected integer, got {}", value)))
}

pub fn result_as_list(value: Value) -> std::result::Result<Vec<String>, StoreError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.into_iter().filter_map(result_as_text).collect()),
        other => Err(StoreError::Decode(format!("expected list, got {}", other))),
    }
}

// ==============================================================================
// KvStore
// ==============================================================================

impl KvStore for RestStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        let value = self.call(Method::Get, &["get", key], None).await?;
        Ok(result_as_text(value))
    }

    async fn set(&self, key: &str, value: &str) -> std::result::Result<(), StoreError> {
        self.call(Method::Post, &["set", key], Some(value)).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> std::result::Result<i64, StoreError> {
        let value = self.call(Method::Post, &["incr", key], None).await?;
        result_as_int(&value)
    }

    async fn expire(&self, key: &str, seconds: u64) -> std::result::Result<(), StoreError> {
        let seconds = seconds.to_string();
        self.call(Method::Post, &["expire", key, &seconds], None).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> std::result::Result<(), StoreError> {
        self.call(Method::Post, &["lpush", key, value], None).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> std::result::Result<Vec<String>, StoreError> {
        let (start, stop) = (start.to_string(), stop.to_string());
        let value = self.call(Method::Get, &["lrange", key, &start, &stop], None).await?;
        result_as_list(value)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> std::result::Result<(), StoreError> {
        let (start, stop) = (start.to_string(), stop.to_string());
        self.call(Method::Post, &["ltrim", key, &start, &stop], None).await?;
        Ok(())
    }
}

// ==============================================================================
// tests
// ==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_url_encodes_segments() {
        let store = RestStore::new("https://eu1-demo.upstash.io/", "tok").unwrap();
        let url = store.command_url(&["get", "usage:abc:2024-03-09"]);
        assert_eq!(url.as_str(), "https://eu1-demo.upstash.io/get/usage:abc:2024-03-09");

        let url = store.command_url(&["lpush", "k", "a b/c"]);
        assert_eq!(url.as_str(), "https://eu1-demo.upstash.io/lpush/k/a%20b%2Fc");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(RestStore::new("not a url", "tok").is_err());
        assert!(RestStore::new("mailto:someone@example.com", "tok").is_err());
    }

    #[test]
    fn test_decode_success_and_error() {
        assert_eq!(decode_reply("get", 200, r#"{"result":"7"}"#).unwrap(), json!("7"));
        assert_eq!(decode_reply("get", 200, r#"{"result":null}"#).unwrap(), Value::Null);

        let err = decode_reply("incr", 400, r#"{"error":"ERR value is not an integer"}"#).unwrap_err();
        assert!(matches!(err, StoreError::Rejected { ref command, .. } if command == "incr"));

        let err = decode_reply("get", 401, "Unauthorized").unwrap_err();
        assert!(err.to_string().contains("http 401"));

        assert!(matches!(decode_reply("get", 200, "<html>"), Err(StoreError::Decode(_))));
    }

    #[test]
    fn test_result_conversions() {
        assert_eq!(result_as_text(json!("x")), Some("x".to_string()));
        assert_eq!(result_as_text(json!({"a": 1})), Some(r#"{"a":1}"#.to_string()));
        assert_eq!(result_as_text(Value::Null), None);

        assert_eq!(result_as_int(&json!(3)).unwrap(), 3);
        assert_eq!(result_as_int(&json!("4")).unwrap(), 4);
        assert!(result_as_int(&json!("four")).is_err());

        assert_eq!(result_as_list(json!(["1", 2])).unwrap(), vec!["1", "2"]);
        assert!(result_as_list(Value::Null).unwrap().is_empty());
        assert!(result_as_list(json!("nope")).is_err());
    }
}
