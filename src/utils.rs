//! Identifier, filename and content helpers

use crate::error::FetchError;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// Magic bytes every PDF starts with
pub const PDF_MAGIC: &[u8] = b"%PDF";

/// Publisher name for a DOI prefix not in [`DOI_PREFIX_TO_PUBLISHER`]
pub const UNKNOWN_PUBLISHER: &str = "Unknown";

/// Registrant prefixes of the publishers this tool sees most
pub const DOI_PREFIX_TO_PUBLISHER: &[(&str, &str)] = &[
    ("10.1007", "Springer"),
    ("10.1016", "Elsevier"),
    ("10.1109", "IEEE"),
    ("10.1090", "AMS"),
    ("10.1137", "SIAM"),
    ("10.1080", "Taylor & Francis"),
    ("10.1093", "Oxford University Press"),
    ("10.1017", "Cambridge University Press"),
    ("10.3390", "MDPI"),
    ("10.1088", "IOP Publishing"),
    ("10.1038", "Nature Publishing Group"),
    ("10.1126", "Science/AAAS"),
    ("10.1145", "ACM"),
    ("10.1002", "Wiley"),
    ("10.1215", "Duke University Press"),
    ("10.4171", "EMS Press"),
    ("10.1201", "CRC Press"),
    ("10.1112", "London Mathematical Society"),
    ("10.2307", "JSTOR"),
    ("10.4213", "Russian Academy of Sciences"),
    ("10.1134", "Pleiades Publishing"),
    ("10.3842", "Institute of Mathematics of NAS of Ukraine"),
    ("10.48550", "arXiv"),
];

#[allow(clippy::expect_used)]
static DOI_IN_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"10\.\d{4,}[/_\-.][\w\-._/]+").expect("valid regex"));

#[allow(clippy::expect_used)]
static DOI_PREFIX_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(10\.\d{4,})[/_\-](.+)$").expect("valid regex"));

/// Turn an identifier into a filesystem-safe PDF filename
///
/// `/` and `:` become `_`; anything other than ASCII alphanumerics and `._-` is dropped.
/// The mapping is not injective (`10.1234/a:b` and `10.1234/a/b` share a name), so the
/// fetcher checks the store for an owner before using it.
///
/// ```
/// use pdf_fetch::utils::sanitize_filename;
///
/// assert_eq!(sanitize_filename("10.1007/s10623-024-01403-z"), "10.1007_s10623-024-01403-z.pdf");
/// assert_eq!(sanitize_filename("10.1234/abc:def/xyz"), "10.1234_abc_def_xyz.pdf");
/// ```
pub fn sanitize_filename(identifier: &str) -> String {
    let safe: String = identifier
        .chars()
        .map(|c| if c == '/' || c == ':' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    format!("{}.pdf", safe)
}

/// Whether the identifier is an http(s) URL rather than a DOI
pub fn is_url(identifier: &str) -> bool {
    identifier.starts_with("http://") || identifier.starts_with("https://")
}

/// Strip a resolver prefix such as `https://doi.org/` from a DOI
pub fn normalize_doi(identifier: &str) -> &str {
    match identifier.find("doi.org/") {
        Some(idx) => &identifier[idx + "doi.org/".len()..],
        None => identifier,
    }
}

/// Registrant prefix of a DOI (`10.1007` for `10.1007/s11784-025-01219-x`)
///
/// Returns `None` unless the identifier is a `10.`-style DOI containing a `/`.
pub fn doi_prefix(identifier: &str) -> Option<&str> {
    let doi = normalize_doi(identifier);
    if !doi.starts_with("10.") {
        return None;
    }
    let (prefix, _) = doi.split_once('/')?;
    (!prefix.is_empty()).then_some(prefix)
}

/// Publisher name inferred from a DOI prefix, `"Unknown"` when not recognised
pub fn publisher_from_doi(identifier: &str) -> &'static str {
    doi_prefix(identifier)
        .and_then(|prefix| {
            DOI_PREFIX_TO_PUBLISHER
                .iter()
                .find(|(p, _)| *p == prefix)
                .map(|(_, name)| *name)
        })
        .unwrap_or(UNKNOWN_PUBLISHER)
}

/// Host part of a URL identifier
pub fn url_host(identifier: &str) -> Option<String> {
    url::Url::parse(identifier)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

/// Recover a DOI from a PDF filename such as `10.1007_s10623-024-01403-z.pdf`
///
/// Only the separator right after the registrant prefix is turned back into `/`.
pub fn infer_doi_from_filename(filename: &str) -> Option<String> {
    let stem = filename
        .strip_suffix(".pdf")
        .or_else(|| filename.strip_suffix(".PDF"))
        .unwrap_or(filename);

    let found = DOI_IN_FILENAME.find(stem)?.as_str();
    match DOI_PREFIX_SPLIT.captures(found) {
        Some(caps) => Some(format!("{}/{}", &caps[1], &caps[2])),
        None => Some(found.to_string()),
    }
}

/// Whether `bytes` start with the PDF magic
pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}

/// Whether the file at `path` starts with the PDF magic
pub fn is_pdf_file(path: &Path) -> bool {
    use std::io::Read;

    let mut header = [0u8; 4];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .map(|()| is_pdf(&header))
        .unwrap_or(false)
}

/// Classify an HTML body served where a PDF was expected
///
/// Returns the specific failure for Cloudflare interstitials, captchas and
/// subscription walls; `None` when the page is not recognisable.
pub fn detect_block_page(body: &[u8]) -> Option<FetchError> {
    // Challenge markers live in the head of the document
    let head = &body[..body.len().min(64 * 1024)];
    let text = String::from_utf8_lossy(head).to_lowercase();

    const CLOUDFLARE_MARKERS: &[&str] = &[
        "cf-browser-verification",
        "challenge-platform",
        "cf_chl_opt",
        "cf-ray",
        "checking your browser",
        "just a moment...",
        "attention required! | cloudflare",
    ];
    const CAPTCHA_MARKERS: &[&str] = &["g-recaptcha", "h-captcha", "hcaptcha", "captcha"];
    const PAYWALL_MARKERS: &[&str] = &[
        "subscription required",
        "purchase this article",
        "buy this article",
        "access to this content requires",
        "log in to access",
    ];

    if CLOUDFLARE_MARKERS.iter().any(|m| text.contains(m)) {
        Some(FetchError::CloudflareChallenge)
    } else if CAPTCHA_MARKERS.iter().any(|m| text.contains(m)) {
        Some(FetchError::CaptchaChallenge)
    } else if PAYWALL_MARKERS.iter().any(|m| text.contains(m)) {
        Some(FetchError::Paywall)
    } else {
        None
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(
            sanitize_filename("10.1007/s10623-024-01403-z"),
            "10.1007_s10623-024-01403-z.pdf"
        );
        assert_eq!(sanitize_filename("arxiv:2301.12345"), "arxiv_2301.12345.pdf");
        assert_eq!(sanitize_filename("10.1000/a b<c>"), "10.1000_abc.pdf");
    }

    #[test]
    fn test_doi_prefix() {
        assert_eq!(doi_prefix("10.1007/s11784-025-01219-x"), Some("10.1007"));
        assert_eq!(doi_prefix("https://doi.org/10.1093/imrn/rnaf173"), Some("10.1093"));
        assert_eq!(doi_prefix("10.1007"), None);
        assert_eq!(doi_prefix("https://example.com/paper"), None);
        assert_eq!(doi_prefix("2301.12345"), None);
    }

    #[test]
    fn test_publisher_from_doi() {
        assert_eq!(publisher_from_doi("10.1007/s10623-024-01403-z"), "Springer");
        assert_eq!(publisher_from_doi("10.1093/imrn/rnaf173"), "Oxford University Press");
        assert_eq!(publisher_from_doi("10.9999/unknown"), "Unknown");
        assert_eq!(publisher_from_doi("not-a-doi"), "Unknown");
    }

    #[test]
    fn test_url_host() {
        assert_eq!(
            url_host("https://Paywalled.Example.com/doi/x").as_deref(),
            Some("paywalled.example.com")
        );
        assert_eq!(url_host("10.1234/x"), None);
    }

    #[test]
    fn test_infer_doi_from_filename() {
        assert_eq!(
            infer_doi_from_filename("10.1007_s10623-024-01403-z.pdf").as_deref(),
            Some("10.1007/s10623-024-01403-z")
        );
        assert_eq!(
            infer_doi_from_filename("doi_10.1234_abcd.PDF").as_deref(),
            Some("10.1234/abcd")
        );
        assert_eq!(infer_doi_from_filename("lecture-notes.pdf"), None);
    }

    #[test]
    fn test_sanitized_name_round_trips_through_inference() {
        let doi = "10.1016/j.ecresq.2020.04.004";
        let name = sanitize_filename(doi);
        assert_eq!(infer_doi_from_filename(&name).as_deref(), Some(doi));
    }

    #[test]
    fn test_is_pdf_file() {
        let dir = TempDir::new().unwrap();
        let pdf = dir.path().join("a.pdf");
        let html = dir.path().join("b.pdf");
        let tiny = dir.path().join("c.pdf");
        std::fs::write(&pdf, b"%PDF-1.7\n...").unwrap();
        std::fs::write(&html, b"<html></html>").unwrap();
        std::fs::write(&tiny, b"%P").unwrap();

        assert!(is_pdf_file(&pdf));
        assert!(!is_pdf_file(&html));
        assert!(!is_pdf_file(&tiny));
        assert!(!is_pdf_file(&dir.path().join("missing.pdf")));
    }

    #[test]
    fn test_detect_block_page() {
        let cf = b"<html><head><title>Just a moment...</title></head><body>cf-ray: 123</body></html>";
        assert_eq!(detect_block_page(cf), Some(FetchError::CloudflareChallenge));

        let captcha = b"<div class=\"g-recaptcha\" data-sitekey=\"x\"></div>";
        assert_eq!(detect_block_page(captcha), Some(FetchError::CaptchaChallenge));

        let paywall = b"<h1>Subscription required</h1><p>Purchase this article</p>";
        assert_eq!(detect_block_page(paywall), Some(FetchError::Paywall));

        assert_eq!(detect_block_page(b"<html><body>Abstract</body></html>"), None);
    }
}
