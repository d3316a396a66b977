//! ==============================================================================
//! lib.rs - usage check cloudflare worker
//! ==============================================================================
//!
//! purpose:
//!     per-client usage accounting for the analysis generator. tracks a daily
//!     counter, an hourly counter and a per-day log of request timestamps
//!     (for burst and abuse detection) in the rest key-value store.
//!
//! relationships:
//!     - uses: shared::counters (key layout, record/peek)
//!     - uses: shared::identity (client ip, hashing, block list)
//!     - uses: kv-rest (RestStore)
//!
//! privacy:
//!     the client ip is hashed with a deployment secret before any key is
//!     built. logs only ever show the hash.
//!
//! api:
//!     GET /api/check-usage
//!         response: {"success": true, "count": 3, "remaining": 7, ...}
//!
//!     POST /api/check-usage
//!         counts one generation against the limits.
//!         response: same as GET, or 429 {"success": false, "error": "..."}
//!
//! degraded mode:
//!     without a configured or reachable store every call answers 200 with
//!     zero counts and "redisAvailable": false.
//!
//! ==============================================================================

use kv_rest::{env_value, RestStore};
use serde::Serialize;
use shared::config::BLOCKED_RETRY_AFTER_SECONDS;
use shared::counters::{self, RecordOutcome};
use shared::http::{cors_headers, JsonReply, NO_STORE_HEADERS, SECURITY_HEADERS};
use shared::identity::{client_ip, hash_client, BlockList};
use shared::usage::{remaining, UsageSnapshot};
use shared::{Limits, Now, StoreError};
use worker::*;

const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, X-Requested-With";
const DAY_MS: u64 = 86_400_000;

// ==============================================================================
// types
// ==============================================================================

/// body for refusals that happen before any counting
#[derive(Debug, Serialize)]
struct RejectedBody {
    success: bool,
    error: String,
    count: u32,
    limit: u32,
    remaining: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FailureBody {
    success: bool,
    error: String,
    count: u32,
    redis_available: bool,
    limit: u32,
    remaining: u32,
}

// ==============================================================================
// worker entry point
// ==============================================================================

#[event(fetch)]
async fn fetch(req: Request, env: Env, _ctx: Context) -> Result<Response> {
    console_error_panic_hook::set_once();

    let router = Router::new();

    router
        .get_async("/api/check-usage", handle_usage)
        .post_async("/api/check-usage", handle_usage)
        .options("/api/check-usage", handle_cors)
        .get("/health", |_, _| Response::ok("ok"))
        .run(req, env)
        .await
}

// ==============================================================================
// request handlers
// ==============================================================================

/// shared by GET (peek) and POST (record)
async fn handle_usage(req: Request, ctx: RouteContext<()>) -> Result<Response> {
    let limits = Limits::from_lookup(|name| env_value(&ctx.env, name));

    match serve(&req, &ctx, &limits).await {
        Ok(resp) => Ok(resp),
        Err(e) => {
            console_error!("check-usage failed: {}", e);
            json_response(failure_reply(&limits)?)
        }
    }
}

async fn serve(req: &Request, ctx: &RouteContext<()>, limits: &Limits) -> Result<Response> {
    let now = Now::from_millis(js_sys::Date::now() as u64);

    let ip = match request_ip(req) {
        Ok(ip) => ip,
        Err(e) => {
            console_warn!("rejecting request: {}", e);
            return json_response(invalid_source_reply(limits)?);
        }
    };

    let blocked = env_value(&ctx.env, "BLOCKED_IPS")
        .map(|raw| BlockList::parse(&raw))
        .unwrap_or_default();
    if blocked.contains(&ip) {
        return json_response(blocked_reply(limits)?);
    }

    let store = RestStore::from_env(&ctx.env);
    let hash = hash_client(&ip, "", store.as_ref().map(|s| s.token()));

    let Some(store) = store else {
        return json_response(usage_reply(&UsageSnapshot::default(), limits, false, &now)?);
    };

    let result = if req.method() == Method::Post {
        counters::record(&store, &hash, &now, limits).await
    } else {
        counters::peek(&store, &hash, &now)
            .await
            .map(|snapshot| RecordOutcome::Recorded { snapshot, report: Default::default() })
    };

    match &result {
        Ok(RecordOutcome::Recorded { report, .. }) if report.suspicious => {
            console_warn!(
                "suspicious activity detected for client {}: {} requests logged today",
                hash,
                report.total
            );
        }
        Ok(RecordOutcome::Denied(denial)) => console_log!("client {} denied: {}", hash, denial.message()),
        Err(e) => console_error!("store error: {}", e),
        Ok(_) => {}
    }

    json_response(outcome_reply(result, limits, &now)?)
}

fn handle_cors(_req: Request, _ctx: RouteContext<()>) -> Result<Response> {
    render(200, String::new(), &[])
}

// ==============================================================================
// replies
// ==============================================================================

/// store failures degrade to zero counts instead of an error
fn outcome_reply(
    result: std::result::Result<RecordOutcome, StoreError>,
    limits: &Limits,
    now: &Now,
) -> serde_json::Result<JsonReply> {
    match result {
        Ok(RecordOutcome::Recorded { snapshot, .. }) => usage_reply(&snapshot, limits, true, now),
        Ok(RecordOutcome::Denied(denial)) => denial.reply(limits),
        Err(_) => usage_reply(&UsageSnapshot::default(), limits, false, now),
    }
}

fn usage_reply(
    snapshot: &UsageSnapshot,
    limits: &Limits,
    redis_available: bool,
    now: &Now,
) -> serde_json::Result<JsonReply> {
    let body = snapshot.body(limits, redis_available, Some(now.date()));
    Ok(JsonReply::json(200, &body)?
        .with_header("X-RateLimit-Limit", limits.daily.to_string())
        .with_header("X-RateLimit-Remaining", remaining(limits.daily, snapshot.daily).to_string())
        .with_header("X-RateLimit-Reset", now.plus_millis(DAY_MS).iso()))
}

fn invalid_source_reply(limits: &Limits) -> serde_json::Result<JsonReply> {
    rejected(400, "Invalid request source", 0, limits)
}

fn blocked_reply(limits: &Limits) -> serde_json::Result<JsonReply> {
    Ok(rejected(429, "Access temporarily restricted", limits.daily, limits)?
        .with_header("Retry-After", BLOCKED_RETRY_AFTER_SECONDS.to_string()))
}

fn failure_reply(limits: &Limits) -> serde_json::Result<JsonReply> {
    let body = FailureBody {
        success: false,
        error: "Service temporarily unavailable".to_string(),
        count: 0,
        redis_available: false,
        limit: limits.daily,
        remaining: limits.daily,
    };
    JsonReply::json(500, &body)
}

fn rejected(status: u16, error: &str, count: u32, limits: &Limits) -> serde_json::Result<JsonReply> {
    let body = RejectedBody {
        success: false,
        error: error.to_string(),
        count,
        limit: limits.daily,
        remaining: 0,
    };
    JsonReply::json(status, &body)
}

fn json_response(reply: JsonReply) -> Result<Response> {
    render(reply.status, reply.body.to_string(), &reply.headers)
}

fn render(status: u16, body: String, extra: &[(&str, String)]) -> Result<Response> {
    let headers = Headers::new();
    headers.set("Content-Type", "application/json")?;
    for (name, value) in cors_headers(ALLOWED_METHODS, ALLOWED_HEADERS)
        .iter()
        .chain(SECURITY_HEADERS)
        .chain(NO_STORE_HEADERS)
    {
        headers.set(name, value)?;
    }
    for (name, value) in extra {
        headers.set(name, value)?;
    }

    Ok(Response::ok(body)?.with_status(status).with_headers(headers))
}

// ==============================================================================
// helpers
// ==============================================================================

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers().get(name).ok().flatten()
}

fn request_ip(req: &Request) -> std::result::Result<String, shared::identity::IdentityError> {
    client_ip(
        header(req, "X-Forwarded-For").as_deref(),
        header(req, "X-Real-IP").as_deref(),
        header(req, "CF-Connecting-IP").as_deref(),
    )
}

// ==============================================================================
// tests
// ==============================================================================
