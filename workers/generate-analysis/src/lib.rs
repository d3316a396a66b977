//! ==============================================================================
//! lib.rs - scenario analysis cloudflare worker
//! ==============================================================================
//!
//! purpose:
//!     takes a "what if" scenario, screens it, asks the language model for
//!     positive outcomes and potential challenges, and returns both lists.
//!
//! relationships:
//!     - uses: shared::policy (length rules, blocked patterns, sanitizing)
//!     - uses: shared::prompt (prompt template, reply parsing)
//!     - uses: shared::window (fixed-window limiter)
//!     - uses: kv-rest (RestStore, limiter state)
//!
//! api:
//!     POST /api/generate-pros-cons
//!         body: {"topic": "...", "perspective": "general", "resultsCount": 7}
//!         response: {"success": true, "data": {"topic", "perspective",
//!                   "positiveOutcomes", "potentialChallenges", "generatedAt"}}
//!
//! configuration:
//!     GEMINI_API_KEY (secret), RATE_LIMIT, RATE_WINDOW_SECONDS (vars).
//!
//! ==============================================================================

use std::time::Duration;

use futures::future::{select, Either};
use futures::pin_mut;
use kv_rest::{env_value, RestStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::identity::{client_ip, hash_client};
use shared::http::{cors_headers, JsonReply, SECURITY_HEADERS};
use shared::policy::{self, PolicyError};
use shared::prompt::{build_prompt, parse_reply, Analysis, Reply, GENERAL_PERSPECTIVE};
use shared::window::{self, WindowDecision};
use shared::{Now, WindowConfig};
use worker::*;

const ALLOWED_METHODS: &str = "POST, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type";

const MAX_BODY_LEN: usize = 10_240;
const MODEL_TIMEOUT: Duration = Duration::from_secs(30);
const MODEL_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent";
const API_KEY_VAR: &str = "GEMINI_API_KEY";

/// clients without a resolvable address share one limiter bucket
const UNKNOWN_CLIENT: &str = "unknown";

const UNAVAILABLE: &str = "AI service temporarily unavailable";
const UNAVAILABLE_RETRY: &str = "AI service temporarily unavailable. Please try again.";
const TIMED_OUT: &str = "Request timed out. Please try again.";

// ==============================================================================
// types
// ==============================================================================

/// a screened and sanitized request, ready for the model
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scenario {
    topic: String,
    perspective: String,
    count: u8,
    /// sensitive families the topic touches; logged, never blocked
    sensitive: Vec<&'static str>,
}

/// a 400 reply produced while screening input
#[derive(Debug, Clone, PartialEq)]
struct Rejection(Value);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisData {
    topic: String,
    perspective: String,
    positive_outcomes: Vec<String>,
    potential_challenges: Vec<String>,
    generated_at: String,
}

#[derive(Debug)]
enum ModelError {
    Timeout,
    Failed(Error),
}

impl From<Error> for ModelError {
    fn from(e: Error) -> Self {
        ModelError::Failed(e)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        ModelError::Failed(e.into())
    }
}

// generateContent wire format

#[derive(Debug, Serialize, Deserialize, Default)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

impl GenerateRequest {
    fn new(prompt: &str) -> Self {
        Self {
            contents: vec![Content { parts: vec![Part { text: prompt.to_string() }] }],
        }
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

// ==============================================================================
// worker entry point
// ==============================================================================

#[event(fetch)]
async fn fetch(req: Request, env: Env, _ctx: Context) -> Result<Response> {
    console_error_panic_hook::set_once();

    let router = Router::new();

    router
        .on_async("/api/generate-pros-cons", handle_generate)
        .get("/health", |_, _| Response::ok("ok"))
        .run(req, env)
        .await
}

// ==============================================================================
// request handlers
// ==============================================================================

async fn handle_generate(mut req: Request, ctx: RouteContext<()>) -> Result<Response> {
    match req.method() {
        Method::Options => render(200, String::new(), &[]),
        Method::Post => match serve(&mut req, &ctx).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                console_error!("error generating analysis: {}", e);
                json_response(unavailable_reply())
            }
        },
        _ => json_response(method_not_allowed()),
    }
}

async fn serve(req: &mut Request, ctx: &RouteContext<()>) -> Result<Response> {
    let now = Now::from_millis(js_sys::Date::now() as u64);
    let config = WindowConfig::from_lookup(|name| env_value(&ctx.env, name));

    let decision = check_window(req, ctx, &now, &config).await;
    if !decision.allowed {
        return json_response(limited_reply(&decision, &config, &now));
    }

    let body = match parse_body(&req.text().await?) {
        Ok(body) => body,
        Err(reply) => return json_response(reply),
    };

    let scenario = match screen(&body) {
        Ok(scenario) => scenario,
        Err(Rejection(reply)) => return json_response(plain(400, reply)),
    };
    if !scenario.sensitive.is_empty() {
        console_log!("sensitive scenario: {}", scenario.sensitive.join(", "));
    }

    let Some(api_key) = env_value(&ctx.env, API_KEY_VAR) else {
        console_error!("{} not configured", API_KEY_VAR);
        return json_response(plain(500, json!({"error": UNAVAILABLE})));
    };

    let prompt = build_prompt(&scenario.topic, &scenario.perspective, scenario.count);
    let text = match ask_model(&api_key, &prompt).await {
        Ok(text) => text,
        Err(e) => {
            match &e {
                ModelError::Timeout => console_error!("model request timed out after {:?}", MODEL_TIMEOUT),
                ModelError::Failed(err) => console_error!("model request failed: {}", err),
            }
            return json_response(model_error_reply(&e));
        }
    };

    let parsed = parse_reply(&text, scenario.count);
    match &parsed {
        Reply::Fallback(_) => console_error!("failed to parse model reply: {}", text),
        Reply::Malformed => console_error!("invalid analysis structure from model: {}", text),
        Reply::Analysis(_) | Reply::Refused => {}
    }
    let analysis = match interpret(parsed) {
        Ok(analysis) => analysis,
        Err(reply) => return json_response(reply),
    };

    json_response(success_reply(analysis_data(scenario, analysis, &now), &decision, &config))
}

/// consume one request from the client's window; fails open without a store
async fn check_window(req: &Request, ctx: &RouteContext<()>, now: &Now, config: &WindowConfig) -> WindowDecision {
    let now_secs = now.ms / 1000;
    let open = WindowDecision {
        allowed: true,
        remaining: config.limit,
        reset_at: now_secs.saturating_add(config.window_seconds),
    };

    let Some(store) = RestStore::from_env(&ctx.env) else {
        return open;
    };

    let ip = client_ip(
        header(req, "X-Forwarded-For").as_deref(),
        header(req, "X-Real-IP").as_deref(),
        header(req, "CF-Connecting-IP").as_deref(),
    )
    .unwrap_or_else(|_| UNKNOWN_CLIENT.to_string());
    let hash = hash_client(&ip, "", Some(store.token()));

    match window::check(&store, &hash, now_secs, config).await {
        Ok(decision) => {
            if !decision.allowed {
                console_log!("client {} rate limited until {}", hash, decision.reset_at);
            }
            decision
        }
        Err(e) => {
            console_error!("limiter store error: {}", e);
            open
        }
    }
}

// ==============================================================================
// screening
// ==============================================================================

/// policy review on the raw fields, then sanitizing and the word checks
fn screen(body: &Value) -> std::result::Result<Scenario, Rejection> {
    let topic = body.get("topic").and_then(Value::as_str).unwrap_or_default();
    let perspective = body
        .get("perspective")
        .and_then(Value::as_str)
        .unwrap_or(GENERAL_PERSPECTIVE);

    let review = policy::review(topic, perspective).map_err(|e| policy_rejection(&e))?;

    let topic = policy::sanitize(topic);
    let perspective = policy::sanitize(perspective);

    if topic.is_empty() {
        return Err(Rejection(json!({"error": "Topic is required after sanitization"})));
    }
    if policy::js_len(&topic) < policy::MIN_TOPIC_LEN {
        return Err(Rejection(json!({
            "error": "Please enter a more detailed scenario (at least 3 characters)"
        })));
    }
    if !policy::has_words(&topic) {
        return Err(Rejection(json!({
            "error": "Please enter a meaningful scenario with actual words"
        })));
    }

    Ok(Scenario {
        topic,
        perspective,
        count: policy::results_count(body.get("resultsCount")),
        sensitive: review.sensitive,
    })
}

fn policy_rejection(e: &PolicyError) -> Rejection {
    Rejection(json!({
        "error": e.to_string(),
        "details": "Content policy violation",
    }))
}

fn analysis_data(scenario: Scenario, analysis: Analysis, now: &Now) -> AnalysisData {
    let perspective = if scenario.perspective.is_empty() {
        GENERAL_PERSPECTIVE.to_string()
    } else {
        scenario.perspective
    };

    AnalysisData {
        topic: scenario.topic,
        perspective,
        positive_outcomes: analysis.positive_outcomes,
        potential_challenges: analysis.potential_challenges,
        generated_at: now.iso(),
    }
}

// ==============================================================================
// model call
// ==============================================================================

async fn ask_model(api_key: &str, prompt: &str) -> std::result::Result<String, ModelError> {
    let call = generate(api_key, prompt);
    let timeout = Delay::from(MODEL_TIMEOUT);
    pin_mut!(call, timeout);

    match select(call, timeout).await {
        Either::Left((result, _)) => result,
        Either::Right(_) => Err(ModelError::Timeout),
    }
}

async fn generate(api_key: &str, prompt: &str) -> std::result::Result<String, ModelError> {
    let mut url = Url::parse(MODEL_URL).map_err(|e| Error::RustError(e.to_string()))?;
    url.query_pairs_mut().append_pair("key", api_key);

    let headers = Headers::new();
    headers.set("Content-Type", "application/json")?;

    let mut init = RequestInit::new();
    init.with_method(Method::Post)
        .with_headers(headers)
        .with_body(Some(serde_json::to_string(&GenerateRequest::new(prompt))?.into()));

    let request = Request::new_with_init(url.as_str(), &init)?;
    let mut response = Fetch::Request(request).send().await?;
    let status = response.status_code();
    let text = response.text().await?;

    if !(200..300).contains(&status) {
        return Err(Error::RustError(format!("model api returned http {}", status)).into());
    }
    reply_text(&text)
}

/// text of the first part of the first candidate
fn reply_text(raw: &str) -> std::result::Result<String, ModelError> {
    let response: GenerateResponse = serde_json::from_str(raw)?;
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content.parts.into_iter().next())
        .map(|p| p.text)
        .ok_or_else(|| Error::RustError("model reply has no candidates".to_string()).into())
}

// ==============================================================================
// replies
// ==============================================================================

fn plain(status: u16, body: Value) -> JsonReply {
    JsonReply { status, body, headers: Vec::new() }
}

fn method_not_allowed() -> JsonReply {
    plain(405, json!({"error": "Method not allowed"}))
}

fn unavailable_reply() -> JsonReply {
    plain(500, json!({"success": false, "error": UNAVAILABLE_RETRY}))
}

/// request text to json: empty is 400, oversized is 413, unparsable is 400
fn parse_body(text: &str) -> std::result::Result<Value, JsonReply> {
    if text.is_empty() {
        return Err(plain(400, json!({"error": "Request body is required"})));
    }
    if policy::js_len(text) > MAX_BODY_LEN {
        return Err(plain(413, json!({"error": "Request too large"})));
    }
    serde_json::from_str(text).map_err(|_| plain(400, json!({"error": "Invalid JSON format"})))
}

fn model_error_reply(e: &ModelError) -> JsonReply {
    match e {
        ModelError::Timeout => plain(500, json!({"success": false, "error": TIMED_OUT})),
        ModelError::Failed(_) => unavailable_reply(),
    }
}

/// the stock analysis stands in for a reply without json
fn interpret(reply: Reply) -> std::result::Result<Analysis, JsonReply> {
    match reply {
        Reply::Analysis(analysis) | Reply::Fallback(analysis) => Ok(analysis),
        Reply::Refused => Err(plain(
            400,
            json!({"error": "This scenario cannot be analyzed due to content restrictions"}),
        )),
        Reply::Malformed => Err(unavailable_reply()),
    }
}

fn limited_reply(decision: &WindowDecision, config: &WindowConfig, now: &Now) -> JsonReply {
    let reset_time = Now::from_millis(decision.reset_at.saturating_mul(1000)).iso();
    let body = json!({
        "error": "Rate limit exceeded. Please try again later.",
        "resetTime": reset_time,
    });
    plain(429, body)
        .with_header("Retry-After", decision.retry_after(now.ms / 1000).to_string())
        .with_header("X-RateLimit-Limit", config.limit.to_string())
        .with_header("X-RateLimit-Remaining", "0")
        .with_header("X-RateLimit-Reset", reset_time)
}

fn success_reply(data: AnalysisData, decision: &WindowDecision, config: &WindowConfig) -> JsonReply {
    plain(200, json!({"success": true, "data": data}))
        .with_header("X-RateLimit-Limit", config.limit.to_string())
        .with_header("X-RateLimit-Remaining", decision.remaining.to_string())
}

fn json_response(reply: JsonReply) -> Result<Response> {
    render(reply.status, reply.body.to_string(), &reply.headers)
}

fn render(status: u16, body: String, extra: &[(&str, String)]) -> Result<Response> {
    let headers = Headers::new();
    headers.set("Content-Type", "application/json")?;
    for (name, value) in cors_headers(ALLOWED_METHODS, ALLOWED_HEADERS).iter().chain(SECURITY_HEADERS) {
        headers.set(name, value)?;
    }
    for (name, value) in extra {
        headers.set(name, value)?;
    }

    Ok(Response::ok(body)?.with_status(status).with_headers(headers))
}

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers().get(name).ok().flatten()
}

// ==============================================================================
// tests
// ==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rejection_error(body: Value) -> String {
        match screen(&body) {
            Err(Rejection(reply)) => reply["error"].as_str().unwrap_or_default().to_string(),
            Ok(scenario) => panic!("unexpectedly accepted {:?}", scenario),
        }
    }

    #[test]
    fn test_screen_accepts_and_cleans() {
        let body = json!({"topic": "  what if  cats <could> talk ", "resultsCount": "5"});
        let scenario = screen(&body).unwrap();
        assert_eq!(scenario.topic, "what if cats could talk");
        assert_eq!(scenario.perspective, "general");
        assert_eq!(scenario.count, 5);
    }

    #[test]
    fn test_screen_policy_violations() {
        let reply = match screen(&json!({"topic": "what if I build a bomb"})) {
            Err(Rejection(reply)) => reply,
            Ok(_) => panic!("blocked topic accepted"),
        };
        assert_eq!(reply["error"], "Content contains inappropriate or harmful material");
        assert_eq!(reply["details"], "Content policy violation");

        assert_eq!(rejection_error(json!({})), "Topic must be at least 3 characters long");
        assert_eq!(rejection_error(json!({"topic": 42})), "Topic must be at least 3 characters long");
    }

    #[test]
    fn test_screen_after_sanitizing() {
        assert_eq!(rejection_error(json!({"topic": "<<<>>>"})), "Topic is required after sanitization");
        assert_eq!(
            rejection_error(json!({"topic": "<a>   "})),
            "Please enter a more detailed scenario (at least 3 characters)"
        );
        assert_eq!(
            rejection_error(json!({"topic": "1 2 3 4"})),
            "Please enter a meaningful scenario with actual words"
        );
    }

    #[test]
    fn test_generate_request_shape() {
        let json = serde_json::to_value(GenerateRequest::new("hello")).unwrap();
        assert_eq!(json, json!({"contents": [{"parts": [{"text": "hello"}]}]}));
    }

    #[test]
    fn test_reply_text_extraction() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":1}"}],"role":"model"}}]}"#;
        assert_eq!(reply_text(raw).unwrap(), r#"{"a":1}"#);

        assert!(matches!(reply_text(r#"{"candidates":[]}"#), Err(ModelError::Failed(_))));
        assert!(matches!(reply_text("not json"), Err(ModelError::Failed(_))));
    }

    #[test]
    fn test_analysis_data_defaults_perspective() {
        let scenario = Scenario {
            topic: "t".to_string(),
            perspective: String::new(),
            count: 3,
            sensitive: Vec::new(),
        };
        let now = Now::from_millis(1_710_006_312_345);
        let data = analysis_data(scenario, Analysis::fallback(3), &now);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["perspective"], "general");
        assert_eq!(json["generatedAt"], "2024-03-09T17:45:12.345Z");
        assert_eq!(json["positiveOutcomes"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_method_not_allowed() {
        let reply = method_not_allowed();
        assert_eq!(reply.status, 405);
        assert_eq!(reply.body, json!({"error": "Method not allowed"}));
    }

    #[test]
    fn test_parse_body_statuses() {
        let status = |text: &str| parse_body(text).err().map(|r| r.status);
        assert_eq!(status(""), Some(400));
        assert_eq!(status(&"x".repeat(MAX_BODY_LEN + 1)), Some(413));
        assert_eq!(status("{topic"), Some(400));
        assert_eq!(status(r#"{"topic": "what if"}"#), None);

        let reply = parse_body("{topic").unwrap_err();
        assert_eq!(reply.body["error"], "Invalid JSON format");
    }

    #[test]
    fn test_size_limit_counts_utf16_units() {
        let wide = format!(r#"{{"topic": "{}"}}"#, "\u{2603}".repeat(4_000));
        assert!(wide.len() > MAX_BODY_LEN);
        assert!(parse_body(&wide).is_ok());

        let astral = "\u{1F600}".repeat(MAX_BODY_LEN / 2 + 1);
        assert_eq!(parse_body(&astral).unwrap_err().status, 413);
    }

    #[test]
    fn test_model_error_replies() {
        let reply = model_error_reply(&ModelError::Timeout);
        assert_eq!(reply.status, 500);
        assert_eq!(reply.body["error"], "Request timed out. Please try again.");

        let reply = model_error_reply(&ModelError::Failed(Error::RustError("http 503".to_string())));
        assert_eq!(reply.status, 500);
        assert_eq!(reply.body["error"], "AI service temporarily unavailable. Please try again.");
        assert_eq!(reply.body["success"], false);
    }

    #[test]
    fn test_interpret_reply() {
        let analysis = Analysis::fallback(3);
        assert_eq!(interpret(Reply::Analysis(analysis.clone())).unwrap(), analysis);
        assert_eq!(interpret(Reply::Fallback(analysis.clone())).unwrap(), analysis);

        let refused = interpret(Reply::Refused).unwrap_err();
        assert_eq!(refused.status, 400);
        assert_eq!(refused.body["error"], "This scenario cannot be analyzed due to content restrictions");

        let malformed = interpret(Reply::Malformed).unwrap_err();
        assert_eq!(malformed.status, 500);
    }

    #[test]
    fn test_limited_reply_headers() {
        let now = Now::from_millis(1_710_006_312_345);
        let decision = WindowDecision { allowed: false, remaining: 0, reset_at: 1_710_006_340 };
        let reply = limited_reply(&decision, &WindowConfig::default(), &now);
        assert_eq!(reply.status, 429);
        assert_eq!(reply.header("Retry-After"), Some("28"));
        assert_eq!(reply.header("X-RateLimit-Limit"), Some("10"));
        assert_eq!(reply.header("X-RateLimit-Remaining"), Some("0"));
        assert_eq!(reply.header("X-RateLimit-Reset"), Some("2024-03-09T17:45:40.000Z"));
        assert_eq!(reply.body["resetTime"], "2024-03-09T17:45:40.000Z");
    }

    #[test]
    fn test_limited_reply_survives_huge_reset() {
        let now = Now::from_millis(1_710_006_312_345);
        let decision = WindowDecision { allowed: false, remaining: 0, reset_at: u64::MAX };
        let reply = limited_reply(&decision, &WindowConfig::default(), &now);
        assert_eq!(reply.status, 429);
        assert!(reply.header("X-RateLimit-Reset").is_some());
    }

    #[test]
    fn test_success_reply_headers() {
        let scenario = Scenario {
            topic: "what if cats could talk".to_string(),
            perspective: "general".to_string(),
            count: 3,
            sensitive: Vec::new(),
        };
        let now = Now::from_millis(1_710_006_312_345);
        let decision = WindowDecision { allowed: true, remaining: 6, reset_at: 1_710_006_360 };
        let data = analysis_data(scenario, Analysis::fallback(3), &now);

        let reply = success_reply(data, &decision, &WindowConfig::default());
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["success"], true);
        assert_eq!(reply.body["data"]["topic"], "what if cats could talk");
        assert_eq!(reply.header("X-RateLimit-Remaining"), Some("6"));
    }
}
