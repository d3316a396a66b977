//! ==============================================================================
//! lib.rs - user settings cloudflare worker
//! ==============================================================================
//!
//! purpose:
//!     stores display settings (dark mode, results per list) per client in
//!     the rest key-value store so they follow the visitor across sessions
//!     without any account.
//!
//! relationships:
//!     - uses: shared::settings (Settings, patch validation)
//!     - uses: shared::identity (client hashing)
//!     - uses: kv-rest (RestStore)
//!
//! api:
//!     GET /api/user-settings
//!         response: {"success": true, "settings": {...}, "redisAvailable": true}
//!
//!     POST|PUT /api/user-settings
//!         body: {"darkMode": true, "resultsCount": 5}
//!         response: same shape, with the stored settings
//!
//!     without a store, or when the body is not json, the reply is the
//!     defaults with "redisAvailable": false and nothing is written.
//!
//! ==============================================================================

use kv_rest::RestStore;
use serde::Serialize;
use shared::config::RECORD_TTL_SECONDS;
use shared::http::{cors_headers, parse_json_body};
use shared::identity::{client_ip, hash_client};
use shared::settings::Settings;
use shared::{KvStore, Now, StoreError};
use worker::*;

const ALLOWED_METHODS: &str = "GET, POST, PUT, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type";

/// clients without a resolvable address share one bucket
const ANONYMOUS: &str = "anonymous";

// ==============================================================================
// types
// ==============================================================================

#[derive(Debug)]
enum Failure {
    MalformedBody,
    Store(StoreError),
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Failure::Store(e)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettingsResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    settings: Settings,
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
        .get_async("/api/user-settings", handle_settings)
        .post_async("/api/user-settings", handle_settings)
        .put_async("/api/user-settings", handle_settings)
        .options("/api/user-settings", handle_cors)
        .get("/health", |_, _| Response::ok("ok"))
        .run(req, env)
        .await
}

// ==============================================================================
// request handlers
// ==============================================================================

async fn handle_settings(mut req: Request, ctx: RouteContext<()>) -> Result<Response> {
    let now = Now::from_millis(js_sys::Date::now() as u64);

    match serve(&mut req, &ctx, &now).await {
        Ok(resp) => Ok(resp),
        Err(e) => {
            console_error!("user-settings failed: {}", e);
            let body = SettingsResponse {
                success: false,
                error: Some("Failed to handle user settings".to_string()),
                settings: Settings::defaults(&now),
                redis_available: false,
            };
            json_response(500, &body)
        }
    }
}

async fn serve(req: &mut Request, ctx: &RouteContext<()>, now: &Now) -> Result<Response> {
    let defaults = Settings::defaults(now);
    let Some(store) = RestStore::from_env(&ctx.env) else {
        return json_response(200, &ok_body(defaults, false));
    };

    let ip = client_ip(
        header(req, "X-Forwarded-For").as_deref(),
        header(req, "X-Real-IP").as_deref(),
        header(req, "CF-Connecting-IP").as_deref(),
    )
    .unwrap_or_else(|_| ANONYMOUS.to_string());
    let key = settings_key(&hash_client(&ip, "", Some(store.token())));

    let body = match req.method() {
        Method::Post | Method::Put => Some(req.text().await?),
        _ => None,
    };

    match resolve(&store, &key, body.as_deref(), now).await {
        Ok(Some(settings)) => json_response(200, &ok_body(settings, true)),
        Ok(None) => json_response(200, &ok_body(defaults, false)),
        Err(Failure::MalformedBody) => {
            console_warn!("malformed settings body for {}", key);
            json_response(200, &ok_body(defaults, false))
        }
        Err(Failure::Store(e)) => {
            console_error!("store error: {}", e);
            json_response(200, &ok_body(defaults, false))
        }
    }
}

fn handle_cors(_req: Request, _ctx: RouteContext<()>) -> Result<Response> {
    let headers = Headers::new();
    for (name, value) in cors_headers(ALLOWED_METHODS, ALLOWED_HEADERS) {
        headers.set(name, value)?;
    }

    Ok(Response::empty()?.with_headers(headers))
}

// ==============================================================================
// storage
// ==============================================================================

/// `body` is the raw request text on writes. `Ok(None)` means nothing is
/// stored yet and the defaults apply.
async fn resolve<S: KvStore>(
    store: &S,
    key: &str,
    body: Option<&str>,
    now: &Now,
) -> std::result::Result<Option<Settings>, Failure> {
    let Some(text) = body else {
        return Ok(load_settings(store, key).await?);
    };
    let patch = parse_json_body(text).ok_or(Failure::MalformedBody)?;
    let settings = Settings::defaults(now).apply_patch(&patch, now);
    store_settings(store, key, &settings).await?;
    Ok(Some(settings))
}

fn settings_key(hash: &str) -> String {
    format!("settings:{}", hash)
}

async fn load_settings<S: KvStore>(store: &S, key: &str) -> std::result::Result<Option<Settings>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(serde_json::from_str::<Settings>(&raw).ok().map(Settings::sanitized)),
        None => Ok(None),
    }
}

async fn store_settings<S: KvStore>(store: &S, key: &str, settings: &Settings) -> std::result::Result<(), StoreError> {
    store.set(key, &serde_json::to_string(settings)?).await?;
    store.expire(key, RECORD_TTL_SECONDS).await
}

// ==============================================================================
// helpers
// ==============================================================================

fn ok_body(settings: Settings, redis_available: bool) -> SettingsResponse {
    SettingsResponse { success: true, error: None, settings, redis_available }
}

fn json_response<T: Serialize>(status: u16, body: &T) -> Result<Response> {
    let json = serde_json::to_string(body)?;
    let headers = Headers::new();
    headers.set("Content-Type", "application/json")?;
    for (name, value) in cors_headers(ALLOWED_METHODS, ALLOWED_HEADERS) {
        headers.set(name, value)?;
    }

    Ok(Response::ok(json)?.with_status(status).with_headers(headers))
}

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers().get(name).ok().flatten()
}

// ==============================================================================
// tests
// ==============================================================================
