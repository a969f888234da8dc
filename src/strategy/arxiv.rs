//! arXiv preprints

use super::traits::{Strategy, StrategyStats};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

/// Default host for PDF links
pub const ARXIV_BASE_URL: &str = "https://arxiv.org";

// 2301.12345, 2301.12345v2
#[allow(clippy::expect_used)]
static NEW_STYLE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}\.\d{4,5})(v\d+)?").expect("valid regex"));

// math.GT/0309136, hep-th/9901001
#[allow(clippy::expect_used)]
static OLD_STYLE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z\-]+(?:\.[A-Z]{2})?/\d{7})").expect("valid regex"));

// 10.48550/arXiv.2301.12345
#[allow(clippy::expect_used)]
static ARXIV_DOI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)10\.48550/arxiv\.(\d{4}\.\d{4,5})(v\d+)?").expect("valid regex")
});

/// Markers of failures arXiv recovers from on its own
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "request failed",
    "stall",
    "rate limit",
    "429",
    "500",
    "502",
    "503",
];

/// Builds PDF links straight from arXiv identifiers, no landing page needed
#[derive(Debug)]
pub struct ArxivStrategy {
    base_url: String,
    stats: StrategyStats,
}

impl Default for ArxivStrategy {
    fn default() -> Self {
        Self::new(ARXIV_BASE_URL)
    }
}

impl ArxivStrategy {
    /// Strategy producing links under `base_url` (normally [`ARXIV_BASE_URL`])
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            stats: StrategyStats::default(),
        }
    }

    /// arXiv id (with version suffix, if any) from any accepted identifier form
    ///
    /// ```
    /// use pdf_fetch::strategy::ArxivStrategy;
    ///
    /// assert_eq!(ArxivStrategy::extract_arxiv_id("arXiv:2301.12345v2").as_deref(), Some("2301.12345v2"));
    /// assert_eq!(ArxivStrategy::extract_arxiv_id("10.48550/arXiv.2301.12345").as_deref(), Some("2301.12345"));
    /// assert_eq!(ArxivStrategy::extract_arxiv_id("https://arxiv.org/abs/2301.12345").as_deref(), Some("2301.12345"));
    /// assert_eq!(ArxivStrategy::extract_arxiv_id("10.1007/s10623-024-01403-z"), None);
    /// ```
    pub fn extract_arxiv_id(identifier: &str) -> Option<String> {
        let identifier = identifier.trim();
        let bare = identifier
            .get(..6)
            .filter(|head| head.eq_ignore_ascii_case("arxiv:"))
            .map_or(identifier, |_| &identifier[6..]);

        if let Some(caps) = ARXIV_DOI.captures(bare) {
            let version = caps.get(2).map_or("", |m| m.as_str());
            return Some(format!("{}{}", &caps[1], version));
        }

        if bare.to_lowercase().contains("arxiv.org") {
            return Self::id_from_url(bare);
        }

        if let Some(m) = NEW_STYLE_ID.find(bare) {
            return Some(m.as_str().to_string());
        }
        OLD_STYLE_ID.find(bare).map(|m| m.as_str().to_string())
    }

    /// Id from an abs/pdf URL; old-style ids keep their archive segment
    fn id_from_url(url: &str) -> Option<String> {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        let path = path.trim_end_matches(".pdf");

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (i, segment) in segments.iter().enumerate() {
            if let Some(m) = NEW_STYLE_ID.find(segment) {
                return Some(m.as_str().to_string());
            }
            if let Some(next) = segments.get(i + 1) {
                let joined = format!("{}/{}", segment, next);
                if let Some(m) = OLD_STYLE_ID.find(&joined) {
                    return Some(m.as_str().to_string());
                }
            }
        }
        None
    }
}

#[async_trait]
impl Strategy for ArxivStrategy {
    fn name(&self) -> &str {
        "ArXiv"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn can_handle(&self, identifier: &str) -> bool {
        Self::extract_arxiv_id(identifier).is_some()
    }

    fn needs_landing_page(&self) -> bool {
        false
    }

    async fn get_pdf_url(
        &self,
        identifier: &str,
        _landing_url: &str,
        _html: &str,
    ) -> Option<String> {
        let id = Self::extract_arxiv_id(identifier)?;
        Some(format!("{}/pdf/{}.pdf", self.base_url, id))
    }

    fn should_postpone(&self, error: &str, _html: Option<&str>) -> bool {
        let error = error.to_lowercase();
        if error.contains("404") || error.contains("not found") {
            return false;
        }
        TRANSIENT_MARKERS.iter().any(|m| error.contains(m))
    }

    fn domains(&self) -> &[&str] {
        &["arxiv.org", "export.arxiv.org"]
    }

    fn doi_prefixes(&self) -> &[&str] {
        &["10.48550"]
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_identifier_forms() {
        let cases = [
            ("2301.12345", Some("2301.12345")),
            ("2301.1234v3", Some("2301.1234v3")),
            ("arxiv:2301.12345", Some("2301.12345")),
            ("ARXIV:hep-th/9901001", Some("hep-th/9901001")),
            ("math.GT/0309136", Some("math.GT/0309136")),
            ("10.48550/arXiv.2212.01234v1", Some("2212.01234v1")),
            ("https://arxiv.org/pdf/2301.12345v2.pdf", Some("2301.12345v2")),
            ("https://export.arxiv.org/abs/hep-th/9901001", Some("hep-th/9901001")),
            ("https://arxiv.org/list/recent", None),
            ("10.1007/s10623-024-01403-z", None),
            ("", None),
        ];
        for (input, expected) in cases {
            assert_eq!(
                ArxivStrategy::extract_arxiv_id(input).as_deref(),
                expected,
                "input: {input}"
            );
        }
    }

    #[tokio::test]
    async fn test_pdf_url_uses_base() {
        let strategy = ArxivStrategy::new("http://127.0.0.1:9000/");
        let url = strategy
            .get_pdf_url("10.48550/arXiv.2301.12345", "", "")
            .await;
        assert_eq!(url.as_deref(), Some("http://127.0.0.1:9000/pdf/2301.12345.pdf"));

        assert_eq!(strategy.get_pdf_url("10.1016/x", "", "").await, None);
    }

    #[test]
    fn test_should_postpone() {
        let strategy = ArxivStrategy::default();
        assert!(strategy.should_postpone("Timeout after 30s", None));
        assert!(strategy.should_postpone("Stalled: no data for 15s", None));
        assert!(strategy.should_postpone("HTTP 503", None));
        assert!(strategy.should_postpone("Rate limited (HTTP 429)", None));
        assert!(strategy.should_postpone("Request failed: connection reset", None));

        assert!(!strategy.should_postpone("HTTP 404", None));
        assert!(!strategy.should_postpone("Paper not found", None));
        assert!(!strategy.should_postpone("Downloaded file is not a PDF", None));
    }

    #[test]
    fn test_metadata() {
        let strategy = ArxivStrategy::default();
        assert_eq!(strategy.name(), "ArXiv");
        assert!(strategy.priority() < 100);
        assert!(!strategy.needs_landing_page());
        assert_eq!(strategy.doi_prefixes(), &["10.48550"]);
        assert!(strategy.domains().contains(&"arxiv.org"));
    }
}
