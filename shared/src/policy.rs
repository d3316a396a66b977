//! content policy for scenario submissions: length limits, blocked
//! pattern families, sensitive-topic tagging and input sanitizing.

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::settings::{DEFAULT_RESULTS_COUNT, MAX_RESULTS_COUNT, MIN_RESULTS_COUNT};

pub const MIN_TOPIC_LEN: usize = 3;
pub const MAX_TOPIC_LEN: usize = 500;
pub const MAX_PERSPECTIVE_LEN: usize = 200;
/// hard cap applied by [`sanitize`]
pub const SANITIZED_MAX_LEN: usize = 1000;
/// a run longer than this of one character is treated as spam
const MAX_CHAR_RUN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Topic must be at least 3 characters long")]
    TopicTooShort,
    #[error("Topic must be less than 500 characters")]
    TopicTooLong,
    #[error("Perspective must be less than 200 characters")]
    PerspectiveTooLong,
    #[error("Content contains inappropriate or harmful material")]
    Blocked,
}

lazy_static! {
    static ref BLOCKED: Vec<Regex> = [
        // harmful content
        r"(?i)suicide|self.?harm|kill.?(?:myself|yourself)",
        r"(?i)bomb|explosive|terrorist|attack",
        r"(?i)drug.?dealing|illegal.?drugs|cocaine|heroin",
        r"(?i)hack|exploit|ddos|malware",
        r"(?i)gore|violence|torture|murder",
        r"(?i)child.?abuse|pedophile|minor.?sexual",
        // links and handles
        r"(?i)http|www\.|\.[a-z]{2,4}/",
        r"[@#](?-u:\w)+",
        // prompt injection
        r"(?i)(?:ignore|forget|disregard).{0,20}(?:previous|above|instruction)",
        r"(?i)(?:system|admin|root|debug)\s*(?:mode|access|prompt)",
        r"(?i)(?:execute|run|eval)\s*(?:code|script|command)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("blocked pattern compiles"))
    .collect();

    static ref SENSITIVE: Vec<(&'static str, Regex)> = [
        ("political", r"(?i)political|election|vote|democrat|republican"),
        ("religious", r"(?i)religious|christian|muslim|jewish|hindu|buddhist"),
        ("discrimination", r"(?i)race|racist|discrimination|prejudice"),
        ("adult", r"(?i)sexual|erotic|nsfw|adult.?content"),
    ]
    .iter()
    .map(|(name, p)| (*name, Regex::new(p).expect("sensitive pattern compiles")))
    .collect();

    static ref CONTROL_CHARS: Regex = Regex::new(r"[\x00-\x1F\x7F-\x9F]").expect("control class compiles");
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").expect("whitespace class compiles");
    static ref WORDLIKE: Regex = Regex::new(r"[a-zA-Z]{2,}").expect("word class compiles");
}

/// result of a passing policy check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Review {
    /// sensitive families the text touches; informational only
    pub sensitive: Vec<&'static str>,
}

fn has_long_run(text: &str) -> bool {
    let mut run = 0;
    let mut prev = None;
    for c in text.chars() {
        if Some(c) == prev {
            run += 1;
            if run > MAX_CHAR_RUN {
                return true;
            }
        } else {
            prev = Some(c);
            run = 1;
        }
    }
    false
}

/// length as browsers count it, in utf-16 code units
pub fn js_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// check raw (unsanitized) input against length and content rules
pub fn review(topic: &str, perspective: &str) -> Result<Review, PolicyError> {
    let topic_len = js_len(topic);
    if topic_len < MIN_TOPIC_LEN {
        return Err(PolicyError::TopicTooShort);
    }
    if topic_len > MAX_TOPIC_LEN {
        return Err(PolicyError::TopicTooLong);
    }
    if js_len(perspective) > MAX_PERSPECTIVE_LEN {
        return Err(PolicyError::PerspectiveTooLong);
    }

    let combined = format!("{} {}", topic, perspective).to_lowercase();
    if has_long_run(&combined) || BLOCKED.iter().any(|re| re.is_match(&combined)) {
        return Err(PolicyError::Blocked);
    }

    Ok(Review {
        sensitive: SENSITIVE
            .iter()
            .filter(|(_, re)| re.is_match(&combined))
            .map(|(name, _)| *name)
            .collect(),
    })
}

/// trim, delete control characters (newlines and tabs included) and angle
/// brackets, collapse whitespace, cap length
pub fn sanitize(text: &str) -> String {
    let stripped = CONTROL_CHARS.replace_all(text.trim(), "");
    let stripped = stripped.replace(['<', '>'], "");
    let collapsed = WHITESPACE_RUN.replace_all(stripped.trim(), " ");
    collapsed.chars().take(SANITIZED_MAX_LEN).collect()
}

/// at least one run of two ascii letters
pub fn has_words(text: &str) -> bool {
    WORDLIKE.is_match(text)
}

/// accepts numbers or numeric strings; anything else means the default.
/// the result is clamped into the supported range.
pub fn results_count(raw: Option<&serde_json::Value>) -> u8 {
    let parsed = match raw {
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|f| f.trunc() as i64),
        Some(serde_json::Value::String(s)) => leading_int(s),
        _ => None,
    };
    match parsed {
        // zero counts as missing, like a falsy parse
        Some(n) if n != 0 => n.clamp(MIN_RESULTS_COUNT as i64, MAX_RESULTS_COUNT as i64) as u8,
        _ => DEFAULT_RESULTS_COUNT,
    }
}

/// integer prefix of a string, e.g. "8 please" -> 8
fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| n * sign)
}
