use super::{set_last_attempted, test_db};
use crate::db::*;
use crate::types::DownloadStatus;
use tempfile::TempDir;

async fn store_at(dir: &TempDir, name: &str) -> Database {
    Database::new(&dir.path().join(name)).await.unwrap()
}

#[tokio::test]
async fn test_merge_success_beats_failure_both_directions() {
    let dir = TempDir::new().unwrap();

    let a = store_at(&dir, "a.db").await;
    a.record_success(&NewSuccess::new("10.1/x", "/pdfs/x.pdf"))
        .await
        .unwrap();
    set_last_attempted(&a, "10.1/x", 100).await;

    let b = store_at(&dir, "b.db").await;
    b.record_failure(&NewFailure::new("10.1/x", "HTTP 503"))
        .await
        .unwrap();

    // A into B: source success replaces newer target failure
    let stats = b
        .merge_from(&MergeOptions {
            source_db: dir.path().join("a.db"),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stats.total_source_entries, 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.conflicts_resolved, 1);
    assert_eq!(
        b.get("10.1/x").await.unwrap().unwrap().status,
        DownloadStatus::Success
    );

    // Reverse direction: a failing source never replaces a successful target
    let c = store_at(&dir, "c.db").await;
    c.record_failure(&NewFailure::new("10.1/x", "HTTP 503"))
        .await
        .unwrap();
    let stats = a
        .merge_from(&MergeOptions {
            source_db: dir.path().join("c.db"),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stats.kept_existing, 1);
    assert_eq!(
        a.get("10.1/x").await.unwrap().unwrap().status,
        DownloadStatus::Success
    );

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn test_merge_two_failures_keeps_later() {
    let dir = TempDir::new().unwrap();

    let source = store_at(&dir, "source.db").await;
    source
        .record_failure(&NewFailure::new("10.1/newer", "source newer"))
        .await
        .unwrap();
    source
        .record_failure(&NewFailure::new("10.1/older", "source older"))
        .await
        .unwrap();
    set_last_attempted(&source, "10.1/newer", 2_000).await;
    set_last_attempted(&source, "10.1/older", 1_000).await;
    source
        .record_failure(&NewFailure::new("10.1/only-source", "HTTP 500"))
        .await
        .unwrap();
    source.close().await;

    let (target, _file) = test_db().await;
    target
        .record_failure(&NewFailure::new("10.1/newer", "target"))
        .await
        .unwrap();
    target
        .record_failure(&NewFailure::new("10.1/older", "target"))
        .await
        .unwrap();
    set_last_attempted(&target, "10.1/newer", 1_500).await;
    set_last_attempted(&target, "10.1/older", 1_500).await;

    let stats = target
        .merge_from(&MergeOptions {
            source_db: dir.path().join("source.db"),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(stats.total_source_entries, 3);
    assert_eq!(stats.added, 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.kept_existing, 1);
    assert_eq!(stats.errors, 0);

    let newer = target.get("10.1/newer").await.unwrap().unwrap();
    assert_eq!(newer.error_reason.as_deref(), Some("source newer"));
    assert_eq!(newer.last_attempted, 2_000);

    let older = target.get("10.1/older").await.unwrap().unwrap();
    assert_eq!(older.error_reason.as_deref(), Some("target"));

    assert!(target.get("10.1/only-source").await.unwrap().is_some());

    target.close().await;
}

#[tokio::test]
async fn test_merge_dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();

    let source = store_at(&dir, "source.db").await;
    source
        .record_success(&NewSuccess::new("10.1/x", "x.pdf"))
        .await
        .unwrap();
    source.close().await;
    std::fs::write(dir.path().join("x.pdf"), b"%PDF").unwrap();

    let (target, _file) = test_db().await;
    let stats = target
        .merge_from(&MergeOptions {
            source_db: dir.path().join("source.db"),
            target_pdf_dir: Some(dir.path().join("out")),
            move_files: true,
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(stats.added, 1);
    assert_eq!(stats.files_moved, 0);
    assert!(target.get("10.1/x").await.unwrap().is_none());
    assert!(dir.path().join("x.pdf").exists());

    target.close().await;
}

#[tokio::test]
async fn test_merge_relocates_files() {
    let dir = TempDir::new().unwrap();
    let source_pdfs = dir.path().join("source_pdfs");
    let target_pdfs = dir.path().join("target_pdfs");
    std::fs::create_dir_all(&source_pdfs).unwrap();

    let source = store_at(&dir, "source.db").await;
    for name in ["moved", "copied"] {
        source
            .record_success(&NewSuccess::new(
                format!("10.1/{}", name),
                format!("/elsewhere/{}.pdf", name),
            ))
            .await
            .unwrap();
    }
    source
        .record_success(&NewSuccess::new("10.1/absent", "/elsewhere/absent.pdf"))
        .await
        .unwrap();
    source.close().await;
    std::fs::write(source_pdfs.join("moved.pdf"), b"%PDF moved").unwrap();
    std::fs::write(source_pdfs.join("copied.pdf"), b"%PDF copied").unwrap();

    // Move pass
    let (target, _file) = test_db().await;
    let stats = target
        .merge_from(&MergeOptions {
            source_db: dir.path().join("source.db"),
            source_pdf_dir: Some(source_pdfs.clone()),
            target_pdf_dir: Some(target_pdfs.clone()),
            move_files: true,
            dry_run: false,
        })
        .await
        .unwrap();

    assert_eq!(stats.added, 3);
    assert_eq!(stats.files_moved, 2);
    assert_eq!(stats.files_skipped, 1);
    assert!(target_pdfs.join("moved.pdf").exists());
    assert!(!source_pdfs.join("moved.pdf").exists());

    let moved = target.get("10.1/moved").await.unwrap().unwrap();
    assert_eq!(
        moved.local_path_buf(),
        Some(target_pdfs.join("moved.pdf"))
    );

    target.close().await;
}

#[tokio::test]
async fn test_merge_copy_keeps_source_file() {
    let dir = TempDir::new().unwrap();
    let target_pdfs = dir.path().join("target_pdfs");

    let source = store_at(&dir, "source.db").await;
    // Relative path resolves against the source store's directory
    source
        .record_success(&NewSuccess::new("10.1/rel", "rel.pdf"))
        .await
        .unwrap();
    source.close().await;
    std::fs::write(dir.path().join("rel.pdf"), b"%PDF rel").unwrap();

    let (target, _file) = test_db().await;
    let stats = target
        .merge_from(&MergeOptions {
            source_db: dir.path().join("source.db"),
            target_pdf_dir: Some(target_pdfs.clone()),
            move_files: false,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(stats.files_copied, 1);
    assert!(dir.path().join("rel.pdf").exists());
    assert!(target_pdfs.join("rel.pdf").exists());

    target.close().await;
}

#[tokio::test]
async fn test_merge_missing_source_fails() {
    let dir = TempDir::new().unwrap();
    let (target, _file) = test_db().await;

    let result = target
        .merge_from(&MergeOptions {
            source_db: dir.path().join("missing.db"),
            ..Default::default()
        })
        .await;
    assert!(result.is_err());
    assert!(!dir.path().join("missing.db").exists());

    target.close().await;
}
