//! Common test utilities for pdf-fetch integration tests

#![allow(dead_code)]

use pdf_fetch::{Config, FetchConfig, RetryConfig, StrategyConfig};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Smallest body the fetcher accepts as a PDF
pub const PDF_BODY: &[u8] = b"%PDF-1.5\n%\xe2\xe3\xcf\xd3\n1 0 obj\n<<>>\nendobj\ntrailer\n<<>>\n%%EOF\n";

/// Cloudflare interstitial as served in place of a PDF
pub const CHALLENGE_PAGE: &str = r#"<!DOCTYPE html>
<html><head><title>Just a moment...</title></head>
<body><div id="challenge-platform"></div></body></html>"#;

/// Config pointing the DOI resolver and arXiv at `server`, with fast timeouts
pub fn mock_config(server: &MockServer, dir: &TempDir) -> Config {
    Config {
        output_dir: dir.path().join("pdfs"),
        database_path: dir.path().join("metadata.db"),
        fetch: FetchConfig {
            max_workers: 4,
            timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(2),
            rate_limit_cooldown: Duration::from_millis(100),
            doi_resolver: server.uri(),
            ..Default::default()
        },
        retry: RetryConfig {
            max_attempts: 0,
            jitter: false,
            ..Default::default()
        },
        strategies: StrategyConfig {
            arxiv_base_url: server.uri(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Landing page for `doi` advertising `pdf_path` through `citation_pdf_url`
pub async fn mount_article(server: &MockServer, doi: &str, pdf_path: &str) {
    let html = format!(
        r#"<html><head><meta name="citation_pdf_url" content="{}{}"></head><body><h1>{}</h1></body></html>"#,
        server.uri(),
        pdf_path,
        doi
    );
    Mock::given(method("GET"))
        .and(path(format!("/{}", doi)))
        .respond_with(ResponseTemplate::new(200).set_body_string(html))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(pdf_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/pdf")
                .set_body_bytes(PDF_BODY),
        )
        .mount(server)
        .await;
}

/// Landing page for `doi` that answers with `status` and `body`
pub async fn mount_landing_status(server: &MockServer, doi: &str, status: u16, body: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", doi)))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(server)
        .await;
}

/// arXiv PDF for `id`
pub async fn mount_arxiv(server: &MockServer, id: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/pdf/{}.pdf", id)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PDF_BODY))
        .mount(server)
        .await;
}

/// Owned identifiers
pub fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}
