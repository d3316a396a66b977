//! response header sets, small reply bodies, and the status/body/header
//! triple the workers build before turning it into a runtime response.

use serde::Serialize;
use serde_json::Value;

/// hardening headers sent with every usage/profile response
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "DENY"),
    ("X-XSS-Protection", "1; mode=block"),
    ("Referrer-Policy", "strict-origin-when-cross-origin"),
];

/// usage numbers must never be cached by browsers or proxies
pub const NO_STORE_HEADERS: &[(&str, &str)] = &[
    ("Cache-Control", "no-cache, no-store, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

/// cors headers for a worker allowing `methods` and request `headers`
pub fn cors_headers(methods: &'static str, headers: &'static str) -> [(&'static str, &'static str); 3] {
    [
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", methods),
        ("Access-Control-Allow-Headers", headers),
    ]
}

/// `{"success": false, "error": ...}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { success: false, error: error.into() }
    }
}

/// a json reply decided but not yet sent
#[derive(Debug, Clone, PartialEq)]
pub struct JsonReply {
    pub status: u16,
    pub body: Value,
    pub headers: Vec<(&'static str, String)>,
}

impl JsonReply {
    pub fn json<T: Serialize>(status: u16, body: &T) -> serde_json::Result<Self> {
        Ok(Self {
            status,
            body: serde_json::to_value(body)?,
            headers: Vec::new(),
        })
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// request body as json. a blank body is an empty object; `None` when the
/// body is not valid json.
pub fn parse_json_body(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return Some(Value::Object(Default::default()));
    }
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_body_shape() {
        let json = serde_json::to_string(&ErrorBody::new("Invalid action")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"Invalid action"}"#);
    }

    #[test]
    fn test_cors_headers() {
        let headers = cors_headers("GET, OPTIONS", "Content-Type");
        assert_eq!(headers[0], ("Access-Control-Allow-Origin", "*"));
        assert_eq!(headers[1].1, "GET, OPTIONS");
    }

    #[test]
    fn test_json_reply_headers() {
        let reply = JsonReply::json(429, &ErrorBody::new("slow down"))
            .unwrap()
            .with_header("Retry-After", "60");
        assert_eq!(reply.status, 429);
        assert_eq!(reply.body["error"], "slow down");
        assert_eq!(reply.header("retry-after"), Some("60"));
        assert_eq!(reply.header("X-RateLimit-Limit"), None);
    }

    #[test]
    fn test_parse_json_body() {
        assert_eq!(parse_json_body(""), Some(json!({})));
        assert_eq!(parse_json_body("  \n"), Some(json!({})));
        assert_eq!(parse_json_body(r#"{"darkMode":true}"#), Some(json!({"darkMode": true})));
        assert_eq!(parse_json_body("{bad"), None);
    }
}
