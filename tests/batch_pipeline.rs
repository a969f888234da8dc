//! End-to-end batch runs against a mock publisher
//!
//! Each test drives the public API the way a caller would: build a fetcher,
//! run batches, then look at the store, the postponement cache and the PDFs
//! left on disk.

mod common;

use common::{
    CHALLENGE_PAGE, PDF_BODY, ids, mock_config, mount_arxiv, mount_article, mount_landing_status,
};
use futures::future::join_all;
use pdf_fetch::{
    Database, DownloadStatus, MergeOptions, PdfFetcher, PostponedKind, StrategyConfig,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_repeat_run_only_fetches_what_can_still_succeed() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_article(&server, "10.1000/a", "/files/a.pdf").await;
    mount_landing_status(&server, "10.1000/gone", 404, "").await;
    mount_landing_status(&server, "10.1000/busy", 503, "").await;
    mount_arxiv(&server, "2301.00001").await;

    let fetcher = PdfFetcher::new(mock_config(&server, &dir)).await.unwrap();
    let batch = ids(&["10.1000/a", "10.1000/gone", "10.1000/busy", "2301.00001"]);

    let first = fetcher
        .fetch_batch(&batch, false, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.summary.success, 2);
    assert_eq!(first.summary.failure, 1);
    assert_eq!(first.summary.postponed, 1);
    assert_eq!(
        first.outcome("10.1000/gone").unwrap().error_reason.as_deref(),
        Some("HTTP 404")
    );
    assert_eq!(
        first.outcome("10.1000/busy").unwrap().error_reason.as_deref(),
        Some("HTTP 503")
    );

    let requests_after_first = server.received_requests().await.unwrap().len();

    let second = fetcher
        .fetch_batch(&batch, false, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.summary.skipped, 4);
    assert_eq!(
        second.outcome("10.1000/a").unwrap().error_reason.as_deref(),
        Some("Already downloaded successfully")
    );
    assert_eq!(
        second.outcome("10.1000/gone").unwrap().error_reason.as_deref(),
        Some("Permanent failure: HTTP 404")
    );
    assert!(
        second
            .outcome("10.1000/busy")
            .unwrap()
            .error_reason
            .as_deref()
            .unwrap()
            .starts_with("Too soon to retry")
    );
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        requests_after_first
    );

    let stats = fetcher.db().get_stats().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.by_status.success, 2);
    assert_eq!(stats.by_status.failure, 2);
    assert_eq!(stats.strategy_stats["ArXiv"].success, 1);
    assert_eq!(stats.strategy_stats["Generic"].success, 1);

    let retry = fetcher.db().get_retry_stats(3).await.unwrap();
    assert_eq!(retry.total_retry, 1);
    assert_eq!(retry.never_retry, 1);
}

#[tokio::test]
async fn test_deleted_pdf_is_detected_and_refetched() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_arxiv(&server, "2302.00002").await;

    let fetcher = PdfFetcher::new(mock_config(&server, &dir)).await.unwrap();
    let outcome = fetcher.fetch("2302.00002", false).await.unwrap();
    let pdf = outcome.local_path.unwrap();
    assert_eq!(std::fs::read(&pdf).unwrap(), PDF_BODY);

    std::fs::remove_file(&pdf).unwrap();
    let report = fetcher.db().verify_files().await.unwrap();
    assert_eq!(report.missing, 1);
    assert_eq!(report.verified, 0);
    assert_eq!(fetcher.db().get_missing().await.unwrap().len(), 1);

    let again = fetcher.fetch("2302.00002", false).await.unwrap();
    assert_eq!(again.status, DownloadStatus::Success);
    assert!(pdf.exists());
    assert!(fetcher.db().get_missing().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_postponement_survives_restart() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_landing_status(&server, "10.2000/first", 200, CHALLENGE_PAGE).await;
    Mock::given(method("GET"))
        .and(path("/10.2000/second"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    {
        let fetcher = PdfFetcher::new(mock_config(&server, &dir)).await.unwrap();
        let report = fetcher
            .fetch_batch(&ids(&["10.2000/first"]), false, CancellationToken::new())
            .await
            .unwrap();
        let outcome = report.outcome("10.2000/first").unwrap();
        assert_eq!(outcome.status, DownloadStatus::Postponed);
        assert_eq!(
            outcome.error_reason.as_deref(),
            Some("Cloudflare challenge page detected")
        );
        assert_eq!(report.cache_analysis.prefixes_added, 1);

        let record = fetcher.db().get("10.2000/first").await.unwrap().unwrap();
        assert!(record.cloudflare_detected);
    }

    let restarted = PdfFetcher::new(mock_config(&server, &dir)).await.unwrap();
    let stats = restarted.cache().get_stats().await;
    assert_eq!(stats.doi_prefixes, vec!["10.2000".to_string()]);

    let report = restarted
        .fetch_batch(&ids(&["10.2000/second"]), false, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.summary.postponed, 1);
    assert_eq!(
        report.outcome("10.2000/second").unwrap().error_reason.as_deref(),
        Some(pdf_fetch::fetcher::POSTPONED_SKIP_REASON)
    );
    assert!(restarted.db().get("10.2000/second").await.unwrap().is_none());
}

#[tokio::test]
async fn test_disabled_postponement_fetches_everything() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_landing_status(&server, "10.3000/a", 403, "").await;
    mount_landing_status(&server, "10.3000/b", 403, "").await;

    let mut config = mock_config(&server, &dir);
    config.postponement.enabled = false;
    config.fetch.sub_batch_size = 1;
    let fetcher = PdfFetcher::new(config).await.unwrap();

    let report = fetcher
        .fetch_batch(&ids(&["10.3000/a", "10.3000/b"]), false, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.summary.error_reasons["HTTP 403"], 2);
    assert_eq!(report.cache_analysis.prefixes_added, 0);
    assert!(
        fetcher
            .db()
            .load_postponed(PostponedKind::DoiPrefix)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_concurrent_batches_share_one_store() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let arxiv_ids = ["2303.00001", "2303.00002", "2303.00003", "2303.00004"];
    for id in arxiv_ids {
        mount_arxiv(&server, id).await;
    }

    let fetcher = PdfFetcher::new(mock_config(&server, &dir)).await.unwrap();
    let runs = arxiv_ids.chunks(2).map(|chunk| {
        let fetcher = fetcher.clone();
        let batch = ids(chunk);
        async move {
            fetcher
                .fetch_batch(&batch, false, CancellationToken::new())
                .await
        }
    });

    for report in join_all(runs).await {
        assert_eq!(report.unwrap().summary.success, 2);
    }
    assert_eq!(
        fetcher
            .db()
            .list_records(Some(DownloadStatus::Success))
            .await
            .unwrap()
            .len(),
        4
    );
    let arxiv = fetcher
        .strategy_stats()
        .into_iter()
        .find(|(name, _)| name == "ArXiv")
        .unwrap();
    assert_eq!(arxiv.1.pdf_found, 4);
}

#[tokio::test]
async fn test_merge_store_from_second_machine() {
    let server = MockServer::start().await;
    let here = TempDir::new().unwrap();
    let there = TempDir::new().unwrap();
    mount_arxiv(&server, "2304.00001").await;
    mount_arxiv(&server, "2304.00002").await;

    {
        let remote = PdfFetcher::new(mock_config(&server, &there)).await.unwrap();
        remote.fetch("2304.00001", false).await.unwrap();
        remote.fetch("2304.00002", false).await.unwrap();
        remote.db().clone().close().await;
    }

    // Attempted here no earlier than there, so the local record is kept
    let local = PdfFetcher::new(mock_config(&server, &here)).await.unwrap();
    local.fetch("2304.00001", false).await.unwrap();

    let stats = local
        .db()
        .merge_from(&MergeOptions {
            source_db: there.path().join("metadata.db"),
            source_pdf_dir: None,
            target_pdf_dir: Some(here.path().join("pdfs")),
            move_files: false,
            dry_run: false,
        })
        .await
        .unwrap();

    assert_eq!(stats.total_source_entries, 2);
    assert_eq!(stats.added, 1);
    assert_eq!(stats.kept_existing, 1);
    assert_eq!(stats.files_copied, 1);
    assert_eq!(stats.errors, 0);

    let merged = local.db().get("2304.00002").await.unwrap().unwrap();
    assert_eq!(
        merged.local_path_buf().unwrap(),
        here.path().join("pdfs").join("2304.00002.pdf")
    );
    assert!(here.path().join("pdfs").join("2304.00002.pdf").exists());
    assert!(there.path().join("pdfs").join("2304.00002.pdf").exists());
}

#[tokio::test]
async fn test_export_lists_every_record() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_arxiv(&server, "2305.00001").await;
    mount_landing_status(&server, "10.4000/x", 404, "").await;

    let fetcher = PdfFetcher::new(mock_config(&server, &dir)).await.unwrap();
    fetcher
        .fetch_batch(&ids(&["2305.00001", "10.4000/x"]), false, CancellationToken::new())
        .await
        .unwrap();

    let out = dir.path().join("export.json");
    assert_eq!(fetcher.db().export_to_json(&out).await.unwrap(), 2);

    let exported: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(exported[0]["identifier"], "10.4000/x");
    assert_eq!(exported[1]["identifier"], "2305.00001");
    assert_eq!(exported[1]["strategy_used"], "ArXiv");
}

#[tokio::test]
async fn test_arxiv_disabled_leaves_generic_only() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let mut config = mock_config(&server, &dir);
    config.strategies = StrategyConfig {
        arxiv: false,
        ..config.strategies
    };
    let fetcher = PdfFetcher::new(config).await.unwrap();
    assert_eq!(fetcher.strategies().len(), 1);

    let outcome = fetcher.fetch("2306.00001", false).await.unwrap();
    assert_eq!(outcome.status, DownloadStatus::Failure);
    assert_eq!(
        outcome.error_reason.as_deref(),
        Some(pdf_fetch::fetcher::NO_STRATEGY_REASON)
    );

    let reopened = Database::new(&dir.path().join("metadata.db")).await.unwrap();
    assert!(reopened.get("2306.00001").await.unwrap().is_some());
}
