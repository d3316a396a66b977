//! the analysis prompt and the parsing of whatever the model sends back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// minimum items per list for a reply to be usable
pub const MIN_ITEMS: usize = 3;

const FALLBACK_OUTCOME: &str = "This scenario offers potential for growth and new opportunities";
const FALLBACK_CHALLENGE: &str =
    "This scenario may present some challenges that require careful consideration";

/// perspective value meaning "no particular perspective"
pub const GENERAL_PERSPECTIVE: &str = "general";

pub fn build_prompt(topic: &str, perspective: &str, count: u8) -> String {
    let perspective_text = if !perspective.is_empty() && perspective != GENERAL_PERSPECTIVE {
        format!(" from a {} perspective", perspective)
    } else {
        String::new()
    };

    let placeholders = |stem: &str| {
        (1..=count)
            .map(|i| format!("\"{}{}\"", stem, i))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        r#"You are a helpful AI assistant that analyzes "what if" scenarios responsibly.

STRICT INSTRUCTIONS:
- Only respond to legitimate hypothetical scenarios
- Do not provide advice on illegal, harmful, or dangerous activities
- If the scenario involves sensitive topics, provide balanced, educational responses
- Focus on realistic outcomes and challenges

Analyze this scenario: "{topic}"{perspective_text}

Provide exactly {count} positive outcomes and {count} potential challenges.

Respond ONLY in this JSON format:
{{
  "positiveOutcomes": [{outcomes}],
  "potentialChallenges": [{challenges}]
}}

If this scenario is inappropriate, respond with:
{{"error": "This scenario cannot be analyzed due to content policy restrictions"}}"#,
        topic = topic,
        perspective_text = perspective_text,
        count = count,
        outcomes = placeholders("outcome"),
        challenges = placeholders("challenge"),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub positive_outcomes: Vec<String>,
    pub potential_challenges: Vec<String>,
}

impl Analysis {
    pub fn fallback(count: u8) -> Self {
        Self {
            positive_outcomes: vec![FALLBACK_OUTCOME.to_string(); count as usize],
            potential_challenges: vec![FALLBACK_CHALLENGE.to_string(); count as usize],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.positive_outcomes.len() >= MIN_ITEMS && self.potential_challenges.len() >= MIN_ITEMS
    }
}

/// how a model reply was interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Analysis(Analysis),
    /// the model refused on content grounds
    Refused,
    /// json was present but not the shape we asked for
    Malformed,
    /// no json at all; the stock analysis was substituted
    Fallback(Analysis),
}

/// text between the first `{` and the last `}`
fn outer_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value?
        .as_array()?
        .iter()
        .map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .collect()
}

/// javascript truthiness: null, false, 0, NaN and "" are falsy
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn parse_reply(text: &str, count: u8) -> Reply {
    let parsed = outer_object(text).and_then(|raw| serde_json::from_str::<Value>(raw).ok());
    let Some(value) = parsed else {
        return Reply::Fallback(Analysis::fallback(count));
    };

    if value.get("error").is_some_and(is_truthy) {
        return Reply::Refused;
    }

    let analysis = string_list(value.get("positiveOutcomes")).zip(string_list(value.get("potentialChallenges")));
    match analysis {
        Some((positive_outcomes, potential_challenges)) => {
            let analysis = Analysis { positive_outcomes, potential_challenges };
            if analysis.is_complete() {
                Reply::Analysis(analysis)
            } else {
                Reply::Malformed
            }
        }
        None => Reply::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_placeholders_and_perspective() {
        let prompt = build_prompt("we lived on mars", "an engineer", 3);
        assert!(prompt.contains(r#"Analyze this scenario: "we lived on mars" from a an engineer perspective"#));
        assert!(prompt.contains("Provide exactly 3 positive outcomes and 3 potential challenges."));
        assert!(prompt.contains(r#""positiveOutcomes": ["outcome1", "outcome2", "outcome3"]"#));
        assert!(prompt.contains(r#""potentialChallenges": ["challenge1", "challenge2", "challenge3"]"#));
    }

    #[test]
    fn test_prompt_general_perspective_omitted() {
        let prompt = build_prompt("we lived on mars", "general", 4);
        assert!(prompt.contains("Analyze this scenario: \"we lived on mars\"\n"));
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = "```json\n{\"positiveOutcomes\":[\"a\",\"b\",\"c\"],\"potentialChallenges\":[\"x\",\"y\",\"z\"]}\n```";
        match parse_reply(text, 3) {
            Reply::Analysis(a) => {
                assert_eq!(a.positive_outcomes, vec!["a", "b", "c"]);
                assert_eq!(a.potential_challenges.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_refusal() {
        let text = r#"{"error": "This scenario cannot be analyzed due to content policy restrictions"}"#;
        assert_eq!(parse_reply(text, 5), Reply::Refused);
    }

    #[test]
    fn test_falsy_error_is_not_a_refusal() {
        let lists = r#""positiveOutcomes":["a","b","c"],"potentialChallenges":["x","y","z"]"#;
        for error in [r#""""#, "0", "false", "null"] {
            let text = format!("{{\"error\":{},{}}}", error, lists);
            assert!(matches!(parse_reply(&text, 3), Reply::Analysis(_)), "error = {}", error);
        }
        assert_eq!(parse_reply(r#"{"error":{}}"#, 3), Reply::Refused);
        assert_eq!(parse_reply(r#"{"error":"no"}"#, 3), Reply::Refused);
    }

    #[test]
    fn test_parse_no_json_falls_back() {
        match parse_reply("I'd rather not.", 4) {
            Reply::Fallback(a) => {
                assert_eq!(a.positive_outcomes.len(), 4);
                assert_eq!(a.potential_challenges.len(), 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse_reply("{ broken", 4), Reply::Fallback(_)));
    }

    #[test]
    fn test_parse_short_lists_malformed() {
        let text = r#"{"positiveOutcomes":["a","b"],"potentialChallenges":["x","y","z"]}"#;
        assert_eq!(parse_reply(text, 3), Reply::Malformed);
        assert_eq!(parse_reply(r#"{"positiveOutcomes":"a"}"#, 3), Reply::Malformed);
    }
}
