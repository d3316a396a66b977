//! ==============================================================================
//! lib.rs - user data cloudflare worker
//! ==============================================================================
//!
//! purpose:
//!     one record per client holding settings, usage windows and security
//!     metadata. serves settings reads/writes and usage counting from the
//!     same document, so a client costs one key instead of several.
//!
//! relationships:
//!     - uses: shared::profile (UserProfile, load/save)
//!     - uses: shared::identity, shared::usage, shared::settings
//!     - uses: kv-rest (RestStore)
//!
//! api:
//!     GET  /api/user-data?action=settings   -> {"success", "settings", "redisAvailable"}
//!     GET  /api/user-data?action=usage      -> usage counters
//!     GET  /api/user-data                   -> {"success", "user": {...}, "redisAvailable"}
//!     PUT  /api/user-data                   -> same as GET
//!     POST /api/user-data?action=usage      -> count one request (200 or 429)
//!     POST /api/user-data?action=settings   -> body is a settings patch
//!
//!     a POST body that is not json gets the degraded 200 reply and nothing
//!     is written.
//!
//! ==============================================================================

use kv_rest::{env_value, RestStore};
use serde::Serialize;
use serde_json::json;
use shared::http::{cors_headers, parse_json_body, ErrorBody, JsonReply, NO_STORE_HEADERS, SECURITY_HEADERS};
use shared::identity::{client_ip, hash_client};
use shared::profile::{self, UserProfile};
use shared::settings::Settings;
use shared::usage::{remaining, UsageSnapshot};
use shared::{Limits, Now};
use worker::*;

const ALLOWED_METHODS: &str = "GET, POST, PUT, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, X-Requested-With";

// ==============================================================================
// types
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Summary,
    Settings,
    Usage,
    Unknown,
}

impl Action {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("get") => Action::Summary,
            Some("settings") => Action::Settings,
            Some("usage") => Action::Usage,
            Some(_) => Action::Unknown,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettingsBody<'a> {
    success: bool,
    settings: &'a Settings,
    redis_available: bool,
}

// ==============================================================================
// worker entry point
// ==============================================================================

#[event(fetch)]
async fn fetch(req: Request, env: Env, _ctx: Context) -> Result<Response> {
    console_error_panic_hook::set_once();

    let router = Router::new();

    router
        .get_async("/api/user-data", handle_user_data)
        .post_async("/api/user-data", handle_user_data)
        .put_async("/api/user-data", handle_user_data)
        .options("/api/user-data", handle_cors)
        .get("/health", |_, _| Response::ok("ok"))
        .run(req, env)
        .await
}

// ==============================================================================
// request handlers
// ==============================================================================

/// GET and PUT read, POST writes
async fn handle_user_data(mut req: Request, ctx: RouteContext<()>) -> Result<Response> {
    match serve(&mut req, &ctx).await {
        Ok(resp) => Ok(resp),
        Err(e) => {
            console_error!("user-data failed: {}", e);
            json_response(failure_reply()?)
        }
    }
}

async fn serve(req: &mut Request, ctx: &RouteContext<()>) -> Result<Response> {
    let limits = Limits::from_lookup(|name| env_value(&ctx.env, name));
    let now = Now::from_millis(js_sys::Date::now() as u64);

    let ip = match request_ip(req) {
        Ok(ip) => ip,
        Err(e) => {
            console_warn!("rejecting request: {}", e);
            return json_response(JsonReply::json(400, &ErrorBody::new("Invalid request source"))?);
        }
    };

    let action = Action::parse(query_param(req, "action")?.as_deref());

    let Some(store) = RestStore::from_env(&ctx.env) else {
        return json_response(fallback_reply(&Settings::defaults(&now), &limits)?);
    };
    let hash = hash_client(&ip, "", Some(store.token()));

    let loaded = match profile::load(&store, &hash, &now).await {
        Ok(loaded) => loaded,
        Err(e) => {
            console_error!("store error: {}", e);
            return json_response(fallback_reply(&Settings::defaults(&now), &limits)?);
        }
    };
    let mut profile = loaded.profile;

    if req.method() == Method::Post {
        let text = req.text().await.unwrap_or_default();
        let Some(body) = parse_json_body(&text) else {
            console_warn!("malformed user-data body from client {}", hash);
            return json_response(fallback_reply(&profile.settings, &limits)?);
        };

        return match action {
            Action::Usage => register_usage(&store, &hash, &mut profile, &now, &limits).await,
            Action::Settings => {
                profile.update_settings(&body, &now);
                save_profile(&store, &hash, &profile).await;
                json_response(settings_reply(&profile.settings, true)?)
            }
            Action::Summary | Action::Unknown => {
                json_response(JsonReply::json(400, &ErrorBody::new("Invalid action"))?)
            }
        };
    }

    // reads only report the store as available when a record came back
    let redis_available = loaded.existing;
    let reply = match action {
        Action::Settings => settings_reply(&profile.settings, redis_available)?,
        Action::Usage => {
            profile.roll_windows(&now);
            usage_read_reply(&profile, &limits, redis_available)?
        }
        Action::Summary | Action::Unknown => {
            let body = json!({
                "success": true,
                "user": profile.summary(&limits),
                "redisAvailable": redis_available,
            });
            JsonReply::json(200, &body)?
        }
    };
    json_response(reply)
}

async fn register_usage(
    store: &RestStore,
    hash: &str,
    profile: &mut UserProfile,
    now: &Now,
    limits: &Limits,
) -> Result<Response> {
    match profile.register_usage(now, limits) {
        Ok(report) => {
            if report.suspicious {
                console_warn!(
                    "suspicious activity detected for client {}: {} requests in the last hour",
                    hash,
                    report.total
                );
            }
            save_profile(store, hash, profile).await;
            json_response(registered_reply(&profile.snapshot(), limits)?)
        }
        Err(denial) => {
            console_log!("client {} denied: {}", hash, denial.message());
            json_response(denial.reply(limits)?)
        }
    }
}

/// failures to persist are logged; the caller still gets its answer
async fn save_profile(store: &RestStore, hash: &str, profile: &UserProfile) {
    if let Err(e) = profile::save(store, hash, profile).await {
        console_error!("failed to save user data: {}", e);
    }
}

fn handle_cors(_req: Request, _ctx: RouteContext<()>) -> Result<Response> {
    render(200, String::new(), &[])
}

// ==============================================================================
// replies
// ==============================================================================

/// reply used when there is no usable store or no usable body
fn fallback_reply(settings: &Settings, limits: &Limits) -> serde_json::Result<JsonReply> {
    let body = json!({
        "success": true,
        "settings": settings,
        "usage": {
            "daily": 0,
            "remaining": limits.daily,
            "limit": limits.daily,
        },
        "redisAvailable": false,
    });
    JsonReply::json(200, &body)
}

fn settings_reply(settings: &Settings, redis_available: bool) -> serde_json::Result<JsonReply> {
    JsonReply::json(200, &SettingsBody { success: true, settings, redis_available })
}

fn usage_read_reply(profile: &UserProfile, limits: &Limits, redis_available: bool) -> serde_json::Result<JsonReply> {
    let body = profile
        .snapshot()
        .body(limits, redis_available, Some(profile.usage.daily.date.clone()));
    let remaining = body.remaining;
    Ok(JsonReply::json(200, &body)?
        .with_header("X-RateLimit-Limit", limits.daily.to_string())
        .with_header("X-RateLimit-Remaining", remaining.to_string()))
}

/// after an increment only the day's room decides `withinLimits`
fn registered_reply(snapshot: &UsageSnapshot, limits: &Limits) -> serde_json::Result<JsonReply> {
    let mut body = snapshot.body(limits, true, None);
    body.security.within_limits = body.remaining > 0;
    Ok(JsonReply::json(200, &body)?
        .with_header("X-RateLimit-Limit", limits.daily.to_string())
        .with_header("X-RateLimit-Remaining", remaining(limits.daily, snapshot.daily).to_string()))
}

fn failure_reply() -> serde_json::Result<JsonReply> {
    let body = json!({
        "success": false,
        "error": "Service temporarily unavailable",
        "redisAvailable": false,
    });
    JsonReply::json(500, &body)
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

fn query_param(req: &Request, name: &str) -> Result<Option<String>> {
    let url = req.url()?;
    Ok(url
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.to_string()))
}

// ==============================================================================
// tests
// ==============================================================================
