//! HTTP side of a fetch: landing pages and PDF bodies

use super::PdfFetcher;
use super::batch::INTERRUPTED_REASON;
use crate::error::{Error, FetchError};
use crate::retry::with_retry;
use crate::utils::{PDF_MAGIC, detect_block_page, is_pdf, is_url, normalize_doi};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Bytes of a non-PDF body kept for challenge-page detection
const SNIFF_LIMIT: usize = 64 * 1024;

/// A failed PDF download, with the page served in its place if any
#[derive(Debug)]
pub(super) struct DownloadFailure {
    pub(super) error: Error,
    pub(super) html: Option<String>,
}

impl From<Error> for DownloadFailure {
    fn from(error: Error) -> Self {
        Self { error, html: None }
    }
}

impl From<FetchError> for DownloadFailure {
    fn from(error: FetchError) -> Self {
        Error::from(error).into()
    }
}

impl From<std::io::Error> for DownloadFailure {
    fn from(error: std::io::Error) -> Self {
        Error::from(error).into()
    }
}

/// Landing page as seen after redirects
#[derive(Debug, Clone)]
pub(super) struct LandingPage {
    pub(super) url: String,
    pub(super) html: String,
}

impl PdfFetcher {
    /// Where the landing page for `identifier` lives
    pub(super) fn landing_url_for(&self, identifier: &str) -> String {
        if is_url(identifier) {
            identifier.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.fetch.doi_resolver.trim_end_matches('/'),
                normalize_doi(identifier)
            )
        }
    }

    /// Fetch the landing page, retrying transient failures with backoff
    pub(super) async fn fetch_landing_page(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<LandingPage, FetchError> {
        let url = self.landing_url_for(identifier);
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Request(INTERRUPTED_REASON.to_string())),
            result = with_retry(&self.config.retry, || self.get_landing_page(&url, cancel)) => result,
        }
    }

    async fn get_landing_page(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<LandingPage, FetchError> {
        if !self.rate_limit.wait(cancel).await {
            return Err(FetchError::Request(INTERRUPTED_REASON.to_string()));
        }

        tracing::debug!(url, "Fetching landing page");
        let response = self
            .client
            .get(url)
            .timeout(self.config.fetch.timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        self.check_rate_limit(status)?;

        let body = response.bytes().await.map_err(|e| self.request_error(e))?;
        if let Some(block) = detect_block_page(&body)
            && (block.is_challenge() || !status.is_success())
        {
            return Err(block);
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        Ok(LandingPage {
            url: final_url,
            html: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    /// Download `url` to `dest` under the stall and total timeouts
    ///
    /// The body goes to a `.part` file that is renamed into place only once it
    /// is complete and starts with the PDF magic. Returns the size in bytes.
    pub(super) async fn download_pdf(
        &self,
        url: &str,
        headers: HeaderMap,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<u64, DownloadFailure> {
        if !self.rate_limit.wait(cancel).await {
            return Err(Error::Other(INTERRUPTED_REASON.to_string()).into());
        }

        let part = part_path(dest);
        let total = self.config.fetch.timeout;
        let result = match tokio::time::timeout(total, self.stream_pdf(url, headers, &part)).await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(total.as_secs()).into()),
        };

        match result {
            Ok(size) => {
                tokio::fs::rename(&part, dest).await?;
                tracing::debug!(url, dest = %dest.display(), size, "PDF saved");
                Ok(size)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&part).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(path = %part.display(), error = %cleanup, "Failed to remove partial download");
                }
                Err(e)
            }
        }
    }

    async fn stream_pdf(
        &self,
        url: &str,
        headers: HeaderMap,
        part: &Path,
    ) -> std::result::Result<u64, DownloadFailure> {
        let stall = self.config.fetch.stall_timeout;
        tracing::debug!(url, "Downloading PDF");

        let mut response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        self.check_rate_limit(status)?;

        let mut head: Vec<u8> = Vec::new();
        let mut file: Option<tokio::fs::File> = None;
        let mut written: u64 = 0;

        loop {
            let chunk = match tokio::time::timeout(stall, response.chunk()).await {
                Err(_) => return Err(FetchError::Stalled(stall.as_secs()).into()),
                Ok(Err(e)) => return Err(self.request_error(e).into()),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => chunk,
            };

            if let Some(file) = file.as_mut() {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
                continue;
            }

            head.extend_from_slice(&chunk);
            if head.len() < PDF_MAGIC.len() {
                continue;
            }
            if status.is_success() && is_pdf(&head) {
                if let Some(parent) = part.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut created = tokio::fs::File::create(part).await?;
                created.write_all(&head).await?;
                written = head.len() as u64;
                head.clear();
                file = Some(created);
            } else if head.len() >= SNIFF_LIMIT {
                break;
            }
        }

        match file {
            Some(mut file) => {
                file.flush().await?;
                file.sync_all().await?;
                Ok(written)
            }
            None => Err(DownloadFailure {
                error: classify_non_pdf(status, &head).into(),
                html: (!head.is_empty()).then(|| String::from_utf8_lossy(&head).into_owned()),
            }),
        }
    }

    /// Trip the shared cooldown on 429
    fn check_rate_limit(&self, status: StatusCode) -> std::result::Result<(), FetchError> {
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.rate_limit.trip(self.config.fetch.rate_limit_cooldown);
            return Err(FetchError::RateLimited);
        }
        Ok(())
    }

    fn request_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.config.fetch.timeout.as_secs())
        } else {
            FetchError::from(e)
        }
    }
}

/// Failure for a body that did not start with `%PDF`
fn classify_non_pdf(status: StatusCode, head: &[u8]) -> FetchError {
    if let Some(block) = detect_block_page(head) {
        return block;
    }
    if !status.is_success() {
        return FetchError::HttpStatus(status.as_u16());
    }
    FetchError::NotPdf
}

pub(super) fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/pdfs/10.1007_x.pdf")),
            PathBuf::from("/pdfs/10.1007_x.pdf.part")
        );
    }

    #[test]
    fn test_classify_non_pdf() {
        assert_eq!(
            classify_non_pdf(StatusCode::OK, b"<html>Just a moment...</html>"),
            FetchError::CloudflareChallenge
        );
        assert_eq!(
            classify_non_pdf(StatusCode::FORBIDDEN, b"<html>denied</html>"),
            FetchError::HttpStatus(403)
        );
        assert_eq!(
            classify_non_pdf(StatusCode::OK, b"<html>hello</html>"),
            FetchError::NotPdf
        );
        assert_eq!(classify_non_pdf(StatusCode::OK, b""), FetchError::NotPdf);
    }
}
