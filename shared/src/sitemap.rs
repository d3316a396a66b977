//! sitemap.xml for the public pages.

pub const DEFAULT_SITE_URL: &str = "https://whatif.diy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub path: &'static str,
    pub changefreq: &'static str,
    pub priority: &'static str,
}

pub const PAGES: &[Page] = &[
    Page { path: "", changefreq: "daily", priority: "1.0" },
    Page { path: "/privacy", changefreq: "monthly", priority: "0.5" },
    Page { path: "/terms", changefreq: "monthly", priority: "0.5" },
    Page { path: "/cookies", changefreq: "monthly", priority: "0.5" },
];

/// minimal xml text escaping for `<loc>` values
fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn render(base_url: &str, lastmod: &str, pages: &[Page]) -> String {
    let base = base_url.trim_end_matches('/');
    let urls = pages
        .iter()
        .map(|page| {
            format!(
                "  <url>\n    <loc>{}</loc>\n    <lastmod>{}</lastmod>\n    <changefreq>{}</changefreq>\n    <priority>{}</priority>\n  </url>",
                escape(&format!("{}{}", base, page.path)),
                lastmod,
                page.changefreq,
                page.priority,
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"
        xmlns:news="http://www.google.com/schemas/sitemap-news/0.9"
        xmlns:xhtml="http://www.w3.org/1999/xhtml"
        xmlns:mobile="http://www.google.com/schemas/sitemap-mobile/1.0"
        xmlns:image="http://www.google.com/schemas/sitemap-image/1.1"
        xmlns:video="http://www.google.com/schemas/sitemap-video/1.1">
{}
</urlset>"#,
        urls
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_all_pages() {
        let xml = render(DEFAULT_SITE_URL, "2024-03-09T17:45:12.345Z", PAGES);
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert_eq!(xml.matches("<url>").count(), 4);
        assert!(xml.contains("<loc>https://whatif.diy</loc>"));
        assert!(xml.contains("<loc>https://whatif.diy/cookies</loc>"));
        assert!(xml.contains("<lastmod>2024-03-09T17:45:12.345Z</lastmod>"));
        assert!(xml.trim_end().ends_with("</urlset>"));
    }

    #[test]
    fn test_trailing_slash_and_escaping() {
        let xml = render("https://a.test/?x=1&y=2/", "t", &PAGES[1..2]);
        assert!(xml.contains("<loc>https://a.test/?x=1&amp;y=2/privacy</loc>"));
    }
}
