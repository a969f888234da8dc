//! Landing-page scraping for any DOI

use super::traits::{Strategy, StrategyStats};
use crate::retry::{FailureKind, classify_failure};
use crate::utils::{detect_block_page, is_url, normalize_doi};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<([a-z][a-z0-9]*)\b([^>]*)>").expect("valid regex"));

#[allow(clippy::expect_used)]
static ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a>").expect("valid regex"));

#[allow(clippy::expect_used)]
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z_:][a-z0-9_:.\-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid regex")
});

#[allow(clippy::expect_used)]
static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Href shapes publishers use for their PDF endpoints
#[allow(clippy::expect_used)]
static PUBLISHER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)/doi/pdf/",
        r"(?i)/doi/pdfdirect/",
        r"(?i)/content/pdf/",
        r"(?i)/fulltext\.pdf",
        r"(?i)/article.*\.pdf",
        r"(?i)/viewPDFInterstitial",
        r"(?i)/pdf/[0-9.]+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Anchor texts that label a PDF link
const PDF_LINK_TEXTS: &[&str] = &[
    "download pdf",
    "pdf",
    "full text pdf",
    "view pdf",
    "download article",
    "download full text",
];

const GENERIC_HREF_MARKERS: &[&str] = &[".pdf", "/pdf/", "/download/", "/getpdf"];

const IGNORED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".svg", ".css", ".js"];

const TRACKING_MARKERS: &[&str] = &["tracking", "analytics", "pixel", "beacon"];

/// One start tag with its attributes (names lowercased)
struct Tag {
    name: String,
    attrs: Vec<(String, String)>,
}

impl Tag {
    fn get(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_attrs(raw: &str) -> Vec<(String, String)> {
    ATTRIBUTE
        .captures_iter(raw)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map_or("", |m| m.as_str());
            (
                caps[1].to_lowercase(),
                value.trim().replace("&amp;", "&"),
            )
        })
        .collect()
}

fn tags(html: &str) -> impl Iterator<Item = Tag> + '_ {
    TAG.captures_iter(html).map(|caps| Tag {
        name: caps[1].to_lowercase(),
        attrs: parse_attrs(&caps[2]),
    })
}

fn is_junk_link(href: &str) -> bool {
    let lower = href.to_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    href.starts_with('#')
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || IGNORED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        || TRACKING_MARKERS.iter().any(|m| lower.contains(m))
}

/// Finds the PDF link on a publisher landing page
///
/// Looks, in order, at `<meta>` tags (`citation_pdf_url` and friends), hrefs
/// matching known publisher PDF endpoints, `data-*` attributes, anchors whose
/// text reads like a PDF link, and finally any `.pdf`/`/pdf/`/`/download/` href.
/// Relative links are resolved against the landing page URL.
#[derive(Debug, Default)]
pub struct GenericStrategy {
    stats: StrategyStats,
}

impl GenericStrategy {
    /// New strategy with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// PDF link found in `html`, made absolute against `landing_url`
    pub fn find_pdf_link(html: &str, landing_url: &str) -> Option<String> {
        let href = Self::from_meta(html)
            .or_else(|| Self::from_publisher_patterns(html))
            .or_else(|| Self::from_data_attributes(html))
            .or_else(|| Self::from_link_text(html))
            .or_else(|| Self::from_generic_hrefs(html))?;
        resolve(landing_url, &href)
    }

    fn from_meta(html: &str) -> Option<String> {
        tags(html).filter(|t| t.name == "meta").find_map(|tag| {
            let key = tag.get("name").or_else(|| tag.get("property"))?;
            let content = tag.get("content").filter(|c| !c.is_empty())?;
            let key = key.to_lowercase();
            let is_pdf_meta = key == "citation_pdf_url"
                || key == "og:pdf"
                || key == "eprints.document_url"
                || (key == "dc.identifier" && content.to_lowercase().ends_with(".pdf"));
            is_pdf_meta.then(|| content.to_string())
        })
    }

    fn from_publisher_patterns(html: &str) -> Option<String> {
        let hrefs: Vec<String> = tags(html)
            .filter(|t| t.name == "a" || t.name == "link")
            .filter_map(|t| t.get("href").map(str::to_string))
            .filter(|href| !is_junk_link(href))
            .collect();

        PUBLISHER_PATTERNS
            .iter()
            .find_map(|pattern| hrefs.iter().find(|href| pattern.is_match(href)).cloned())
    }

    fn from_data_attributes(html: &str) -> Option<String> {
        tags(html).find_map(|tag| {
            if let Some(url) = tag.get("data-pdf-url").or_else(|| tag.get("data-article-pdf"))
                && !url.is_empty()
            {
                return Some(url.to_string());
            }
            tag.get("data-download")
                .filter(|url| url.to_lowercase().contains(".pdf"))
                .map(str::to_string)
        })
    }

    fn from_link_text(html: &str) -> Option<String> {
        ANCHOR.captures_iter(html).find_map(|caps| {
            let text = MARKUP.replace_all(&caps[2], " ");
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
            if !PDF_LINK_TEXTS.contains(&text.as_str()) {
                return None;
            }
            parse_attrs(&caps[1])
                .into_iter()
                .find(|(k, _)| k == "href")
                .map(|(_, href)| href)
                .filter(|href| !href.is_empty() && !is_junk_link(href))
        })
    }

    fn from_generic_hrefs(html: &str) -> Option<String> {
        tags(html)
            .filter(|t| t.name == "a")
            .filter_map(|t| t.get("href").map(str::to_string))
            .filter(|href| !is_junk_link(href))
            .find(|href| {
                let lower = href.to_lowercase();
                GENERIC_HREF_MARKERS.iter().any(|m| lower.contains(m))
            })
    }
}

/// Absolute form of `href` relative to `base`
fn resolve(base: &str, href: &str) -> Option<String> {
    if is_url(href) {
        return Some(href.to_string());
    }
    let base = url::Url::parse(base).ok()?;
    base.join(href).ok().map(String::from)
}

#[async_trait]
impl Strategy for GenericStrategy {
    fn name(&self) -> &str {
        "Generic"
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn can_handle(&self, identifier: &str) -> bool {
        normalize_doi(identifier.trim()).starts_with("10.") || is_url(identifier)
    }

    async fn get_pdf_url(&self, _identifier: &str, landing_url: &str, html: &str) -> Option<String> {
        if html.is_empty() {
            return None;
        }
        let url = Self::find_pdf_link(html, landing_url);
        tracing::debug!(landing_url, found = url.is_some(), "Searched landing page for PDF link");
        url
    }

    fn should_postpone(&self, error: &str, html: Option<&str>) -> bool {
        if let Some(html) = html
            && let Some(block) = detect_block_page(html.as_bytes())
        {
            return block.is_challenge();
        }
        classify_failure(error) == FailureKind::Transient
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const LANDING: &str = "https://publisher.example.com/article/10.1234/abc";

    #[test]
    fn test_meta_tag_wins() {
        let html = r#"<html><head>
            <meta content="https://cdn.example.com/paper.pdf" name="citation_pdf_url">
            </head><body><a href="/other/download/file.pdf">PDF</a></body></html>"#;
        assert_eq!(
            GenericStrategy::find_pdf_link(html, LANDING).as_deref(),
            Some("https://cdn.example.com/paper.pdf")
        );
    }

    #[test]
    fn test_dc_identifier_needs_pdf_suffix() {
        let html = r#"<meta name="DC.identifier" content="doi:10.1234/abc">
            <meta name="dc.identifier" content="/files/abc.PDF">"#;
        assert_eq!(
            GenericStrategy::find_pdf_link(html, LANDING).as_deref(),
            Some("https://publisher.example.com/files/abc.PDF")
        );
    }

    #[test]
    fn test_publisher_pattern_resolved_relative() {
        let html = r#"<a href="/about">About</a>
            <a href="/doi/pdf/10.1234/abc?download=true&amp;x=1">Get it</a>"#;
        assert_eq!(
            GenericStrategy::find_pdf_link(html, LANDING).as_deref(),
            Some("https://publisher.example.com/doi/pdf/10.1234/abc?download=true&x=1")
        );
    }

    #[test]
    fn test_data_attribute() {
        let html = r#"<button class="btn" data-pdf-url='/content/abc/file'>Download</button>"#;
        assert_eq!(
            GenericStrategy::find_pdf_link(html, LANDING).as_deref(),
            Some("https://publisher.example.com/content/abc/file")
        );
    }

    #[test]
    fn test_link_text() {
        let html = r#"<a href="/help">Help</a>
            <a class="x" href="/stream/abc"><span>Download</span> <b>PDF</b></a>"#;
        assert_eq!(
            GenericStrategy::find_pdf_link(html, LANDING).as_deref(),
            Some("https://publisher.example.com/stream/abc")
        );
    }

    #[test]
    fn test_generic_href_skips_junk() {
        let html = r#"<a href="/static/pdf/icon.png">x</a>
            <a href="https://tracking.example.com/pdf/pixel">y</a>
            <a href="files/paper.pdf">z</a>"#;
        assert_eq!(
            GenericStrategy::find_pdf_link(html, LANDING).as_deref(),
            Some("https://publisher.example.com/article/10.1234/files/paper.pdf")
        );
    }

    #[test]
    fn test_no_link() {
        let html = "<html><body><p>Nothing to see</p><a href=\"/home\">Home</a></body></html>";
        assert_eq!(GenericStrategy::find_pdf_link(html, LANDING), None);
    }

    #[tokio::test]
    async fn test_empty_landing_page_yields_nothing() {
        let strategy = GenericStrategy::new();
        assert_eq!(strategy.get_pdf_url("10.1234/abc", LANDING, "").await, None);
    }

    #[test]
    fn test_can_handle() {
        let strategy = GenericStrategy::new();
        assert!(strategy.can_handle("10.1007/s10623-024-01403-z"));
        assert!(strategy.can_handle("https://doi.org/10.1007/abc"));
        assert!(strategy.can_handle("https://publisher.example.com/article/1"));
        assert!(!strategy.can_handle("2301.12345"));
        assert!(!strategy.can_handle("not a doi"));
    }

    #[test]
    fn test_should_postpone_follows_failure_taxonomy() {
        let strategy = GenericStrategy::new();
        assert!(strategy.should_postpone("HTTP 403", None));
        assert!(strategy.should_postpone("Cloudflare challenge page detected", None));
        assert!(strategy.should_postpone("Timeout after 30s", None));
        assert!(strategy.should_postpone("Downloaded file is not a PDF", None));

        assert!(!strategy.should_postpone("Could not find PDF URL", None));
        assert!(!strategy.should_postpone("HTTP 404", None));
        assert!(!strategy.should_postpone("Paywall: subscription required", None));
    }

    #[test]
    fn test_should_postpone_reads_served_page() {
        let strategy = GenericStrategy::new();
        let captcha = "<html><div class=\"g-recaptcha\"></div></html>";
        let paywall = "<html><p>Purchase this article to read on</p></html>";

        assert!(strategy.should_postpone("Could not find PDF URL", Some(captcha)));
        assert!(!strategy.should_postpone("Downloaded file is not a PDF", Some(paywall)));
        assert!(strategy.should_postpone(
            "Downloaded file is not a PDF",
            Some("<html>Abstract</html>")
        ));
    }
}
