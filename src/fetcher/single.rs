//! Fetching one identifier

use super::PdfFetcher;
use super::batch::INTERRUPTED_REASON;
use super::download::LandingPage;
use crate::db::{NewFailure, NewSuccess};
use crate::error::{Error, FetchError, Result};
use crate::retry::RetryDecision;
use crate::strategy::Strategy;
use crate::types::{DownloadStatus, FetchOutcome, PRE_EXISTING_STRATEGY};
use crate::utils::{is_pdf_file, publisher_from_doi, sanitize_filename};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Failure reason when no registered strategy accepts an identifier
pub const NO_STRATEGY_REASON: &str = "No strategy can handle this identifier";

/// What the strategies that failed left behind
#[derive(Debug, Default)]
struct FailureTally {
    last_error: Option<String>,
    last_strategy: Option<String>,
    last_pdf_url: Option<String>,
    should_retry: bool,
    challenge_seen: bool,
}

impl FailureTally {
    fn note(
        &mut self,
        strategy: &dyn Strategy,
        error: &Error,
        html: Option<&str>,
        pdf_url: Option<String>,
    ) {
        let message = match error {
            Error::Fetch(e) => {
                self.challenge_seen |= e.is_challenge();
                e.to_string()
            }
            other => other.to_string(),
        };

        let postpone = strategy.should_postpone(&message, html);
        if postpone {
            strategy.stats().record_postponed();
        }
        self.should_retry |= postpone;

        tracing::warn!(
            strategy = strategy.name(),
            error = %message,
            postpone,
            "Strategy failed"
        );

        self.last_error = Some(message);
        self.last_strategy = Some(strategy.name().to_string());
        if pdf_url.is_some() {
            self.last_pdf_url = pdf_url;
        }
    }
}

impl PdfFetcher {
    /// Fetch one identifier and record the outcome in the store
    ///
    /// Unless `force` is set, the store is consulted first (resolved or exhausted
    /// identifiers come back as `skipped`) and a valid PDF already sitting at the
    /// destination path is registered instead of downloaded again.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty identifier or when the store cannot be read
    /// or written. Fetch failures are outcomes, not errors.
    pub async fn fetch(&self, identifier: &str, force: bool) -> Result<FetchOutcome> {
        self.fetch_cancellable(identifier, force, None, &CancellationToken::new())
            .await
    }

    /// Fetch one identifier with the registered strategy called `strategy` only
    ///
    /// The named strategy is used even if its `can_handle` declines the
    /// identifier. Everything else behaves as in [`PdfFetcher::fetch`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no registered strategy has that name,
    /// plus the errors of [`PdfFetcher::fetch`].
    pub async fn fetch_with_strategy(
        &self,
        identifier: &str,
        strategy: &str,
        force: bool,
    ) -> Result<FetchOutcome> {
        if !self.strategies.iter().any(|s| s.name() == strategy) {
            return Err(Error::NotFound(format!("strategy {}", strategy)));
        }
        self.fetch_cancellable(identifier, force, Some(strategy), &CancellationToken::new())
            .await
    }

    pub(super) async fn fetch_cancellable(
        &self,
        identifier: &str,
        force: bool,
        only: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(Error::InvalidIdentifier("empty identifier".to_string()));
        }

        if !force && let Some(skip) = self.check_eligibility(identifier).await? {
            return Ok(skip);
        }

        let (filename, dest) = self.destination_for(identifier).await?;
        let publisher = Some(publisher_from_doi(identifier).to_string());

        if !force && is_pdf_file(&dest) {
            return self
                .register_existing(identifier, &dest, &filename, publisher)
                .await;
        }

        let capable: Vec<Arc<dyn Strategy>> = self
            .strategies
            .iter()
            .filter(|s| match only {
                Some(name) => s.name() == name,
                None => s.can_handle(identifier),
            })
            .cloned()
            .collect();

        if capable.is_empty() {
            tracing::warn!(identifier, "No strategy can handle identifier");
            self.db
                .record_failure(
                    &NewFailure {
                        publisher: publisher.clone(),
                        ..NewFailure::new(identifier, NO_STRATEGY_REASON)
                    }
                    .permanent(),
                )
                .await?;
            return Ok(FetchOutcome::failure(identifier, NO_STRATEGY_REASON).with_publisher(publisher));
        }

        let (landing, landing_error) = if capable.iter().any(|s| s.needs_landing_page()) {
            match self.fetch_landing_page(identifier, cancel).await {
                Ok(page) => (page, None),
                Err(e) => {
                    tracing::warn!(identifier, error = %e, "Landing page unavailable");
                    (self.empty_landing(identifier), Some(e))
                }
            }
        } else {
            (self.empty_landing(identifier), None)
        };

        let mut tally = FailureTally {
            challenge_seen: landing_error.as_ref().is_some_and(FetchError::is_challenge),
            ..Default::default()
        };

        for strategy in &capable {
            if cancel.is_cancelled() {
                return Ok(FetchOutcome::postponed(identifier, INTERRUPTED_REASON));
            }
            strategy.stats().record_handled();
            tracing::debug!(identifier, strategy = strategy.name(), "Trying strategy");

            let found = strategy
                .get_pdf_url(identifier, &landing.url, &landing.html)
                .await;
            strategy.stats().record_lookup(found.is_some());

            let Some(pdf_url) = found else {
                let error = landing_error.clone().unwrap_or(FetchError::NoPdfUrl);
                let html = (!landing.html.is_empty()).then_some(landing.html.as_str());
                tally.note(strategy.as_ref(), &error.into(), html, None);
                continue;
            };

            let pdf_url = strategy.preprocess_url(&pdf_url);
            match self
                .download_pdf(&pdf_url, strategy.custom_headers(identifier), &dest, cancel)
                .await
            {
                Ok(size) => {
                    self.db
                        .record_success(&NewSuccess {
                            publisher: publisher.clone(),
                            strategy_used: Some(strategy.name().to_string()),
                            landing_url: Some(landing.url.clone()),
                            pdf_url: Some(pdf_url),
                            sanitized_filename: Some(filename),
                            file_size: Some(size as i64),
                            ..NewSuccess::new(identifier, dest.to_string_lossy())
                        })
                        .await?;
                    tracing::info!(
                        identifier,
                        strategy = strategy.name(),
                        size,
                        "Downloaded PDF"
                    );
                    return Ok(FetchOutcome::success(
                        identifier,
                        dest,
                        strategy.name(),
                        publisher,
                    ));
                }
                Err(failure) => tally.note(
                    strategy.as_ref(),
                    &failure.error,
                    failure.html.as_deref(),
                    Some(pdf_url),
                ),
            }
        }

        if cancel.is_cancelled() {
            return Ok(FetchOutcome::postponed(identifier, INTERRUPTED_REASON));
        }

        let reason = tally
            .last_error
            .clone()
            .unwrap_or_else(|| FetchError::NoPdfUrl.to_string());
        self.db
            .record_failure(&NewFailure {
                publisher: publisher.clone(),
                strategy_used: tally.last_strategy.clone(),
                landing_url: Some(landing.url),
                pdf_url: tally.last_pdf_url.clone(),
                cloudflare_detected: tally.challenge_seen,
                should_retry: tally.should_retry,
                ..NewFailure::new(identifier, reason.clone())
            })
            .await?;

        let outcome = if tally.should_retry {
            FetchOutcome::postponed(identifier, reason)
        } else {
            FetchOutcome::failure(identifier, reason)
        };
        Ok(outcome
            .with_strategy(tally.last_strategy.as_deref())
            .with_publisher(publisher))
    }

    /// `Some(skipped)` when the store says not to fetch
    ///
    /// A success whose file has disappeared is flagged missing and fetched again.
    async fn check_eligibility(&self, identifier: &str) -> Result<Option<FetchOutcome>> {
        let decision = self
            .db
            .should_download(identifier, self.config.fetch.max_attempts)
            .await?;
        let RetryDecision::Deny(reason) = decision else {
            return Ok(None);
        };

        if let Some(record) = self.db.get(identifier).await?
            && record.status == DownloadStatus::Success
            && !record.archived
            && let Some(path) = record.local_path_buf()
            && !tokio::fs::try_exists(&path).await.unwrap_or(false)
        {
            tracing::info!(identifier, path = %path.display(), "Recorded PDF is missing, fetching again");
            self.db.mark_file_missing(identifier).await?;
            return Ok(None);
        }

        tracing::debug!(identifier, reason = %reason, "Skipping");
        Ok(Some(FetchOutcome::skipped(identifier, Some(reason))))
    }

    /// Filename and path this identifier downloads to
    ///
    /// When another identifier already owns the sanitized name, a numbered
    /// variant is used so neither file is registered or overwritten as the other's.
    pub(super) async fn destination_for(&self, identifier: &str) -> Result<(String, PathBuf)> {
        let base = sanitize_filename(identifier);
        let stem = base.trim_end_matches(".pdf");
        let mut filename = base.clone();
        let mut n = 1;
        loop {
            let dest = self.config.output_dir.join(&filename);
            let owner = self
                .db
                .file_owner(&filename, &dest.to_string_lossy(), identifier)
                .await?;
            let Some(owner) = owner else {
                return Ok((filename, dest));
            };
            n += 1;
            tracing::debug!(identifier, owner = %owner, filename = %filename, "Filename taken");
            filename = format!("{}_{}.pdf", stem, n);
        }
    }

    async fn register_existing(
        &self,
        identifier: &str,
        dest: &Path,
        filename: &str,
        publisher: Option<String>,
    ) -> Result<FetchOutcome> {
        let size = tokio::fs::metadata(dest).await?.len();
        self.db
            .record_success(&NewSuccess {
                publisher: publisher.clone(),
                strategy_used: Some(PRE_EXISTING_STRATEGY.to_string()),
                sanitized_filename: Some(filename.to_string()),
                file_size: Some(size as i64),
                ..NewSuccess::new(identifier, dest.to_string_lossy())
            })
            .await?;
        tracing::info!(identifier, path = %dest.display(), "Registered existing PDF");
        Ok(FetchOutcome::success(
            identifier,
            PathBuf::from(dest),
            PRE_EXISTING_STRATEGY,
            publisher,
        ))
    }

    fn empty_landing(&self, identifier: &str) -> LandingPage {
        LandingPage {
            url: self.landing_url_for(identifier),
            html: String::new(),
        }
    }
}
