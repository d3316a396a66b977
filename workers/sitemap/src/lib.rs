//! ==============================================================================
//! lib.rs - sitemap cloudflare worker
//! ==============================================================================
//!
//! purpose:
//!     serves sitemap.xml for the public pages, with lastmod set to the time
//!     of the request.
//!
//! relationships:
//!     - uses: shared::sitemap (page list, rendering)
//!
//! configuration:
//!     SITE_URL (var), defaults to https://whatif.diy
//!
//! ==============================================================================

use shared::sitemap::{self, DEFAULT_SITE_URL, PAGES};
use shared::Now;
use worker::*;

const CACHE_CONTROL: &str = "max-age=3600";

#[event(fetch)]
async fn fetch(req: Request, env: Env, _ctx: Context) -> Result<Response> {
    console_error_panic_hook::set_once();

    let router = Router::new();

    router
        .get("/sitemap.xml", handle_sitemap)
        .get("/health", |_, _| Response::ok("ok"))
        .run(req, env)
        .await
}

fn handle_sitemap(_req: Request, ctx: RouteContext<()>) -> Result<Response> {
    let base = site_url(ctx.var("SITE_URL").ok().map(|v| v.to_string()));
    let now = Now::from_millis(js_sys::Date::now() as u64);

    let headers = Headers::new();
    headers.set("Content-Type", "application/xml")?;
    headers.set("Cache-Control", CACHE_CONTROL)?;

    Ok(Response::ok(sitemap::render(&base, &now.iso(), PAGES))?.with_headers(headers))
}

/// configured base url, or the default when unset or blank
fn site_url(configured: Option<String>) -> String {
    configured
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SITE_URL.to_string())
}
