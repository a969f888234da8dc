use super::test_db;
use crate::db::*;
use crate::types::{DownloadStatus, ORPHAN_SCAN_STRATEGY};
use tempfile::TempDir;

#[tokio::test]
async fn test_verify_files_corrects_drift() {
    let (db, _file) = test_db().await;
    let dir = TempDir::new().unwrap();

    let present = dir.path().join("present.pdf");
    std::fs::write(&present, b"%PDF-1.4").unwrap();
    let gone = dir.path().join("gone.pdf");

    db.record_success(&NewSuccess::new("10.1/present", present.to_string_lossy()))
        .await
        .unwrap();
    db.record_success(&NewSuccess::new("10.1/gone", gone.to_string_lossy()))
        .await
        .unwrap();
    db.record_success(&NewSuccess::new("10.1/archived", "/nowhere.pdf"))
        .await
        .unwrap();
    db.mark_archived("10.1/archived", "s3://bucket/a.pdf")
        .await
        .unwrap();
    // Stale flag on a file that is actually there
    db.mark_file_missing("10.1/present").await.unwrap();

    let report = db.verify_files().await.unwrap();
    assert_eq!(report.verified, 1);
    assert_eq!(report.missing, 1);
    assert_eq!(report.archived, 1);

    assert!(db.get("10.1/present").await.unwrap().unwrap().file_exists);
    assert!(!db.get("10.1/gone").await.unwrap().unwrap().file_exists);

    let archived = db.get("10.1/archived").await.unwrap().unwrap();
    assert!(archived.archived);
    assert!(!archived.file_exists);

    db.close().await;
}

#[tokio::test]
async fn test_scan_for_orphaned_pdfs() {
    let (db, _file) = test_db().await;
    let dir = TempDir::new().unwrap();

    let known = dir.path().join("10.1007_known.pdf");
    std::fs::write(&known, b"%PDF-1.4").unwrap();
    db.record_success(&NewSuccess::new("10.1007/known", known.to_string_lossy()))
        .await
        .unwrap();

    // Recorded under a different path, but the DOI in its name is known
    db.record_failure(&NewFailure::new("10.1016/failed", "HTTP 503"))
        .await
        .unwrap();
    std::fs::write(dir.path().join("10.1016_failed.pdf"), b"%PDF-1.4").unwrap();

    std::fs::write(dir.path().join("10.1093_orphan.pdf"), b"%PDF-1.4 orphan").unwrap();
    std::fs::write(dir.path().join("lecture-notes.PDF"), b"%PDF-1.4").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();

    let orphans = db.scan_for_orphaned_pdfs(dir.path()).await.unwrap();
    assert_eq!(orphans.len(), 2);

    let doi_orphan = orphans
        .iter()
        .find(|o| o.path.ends_with("10.1093_orphan.pdf"))
        .unwrap();
    assert_eq!(doi_orphan.inferred_identifier.as_deref(), Some("10.1093/orphan"));
    assert_eq!(doi_orphan.size_bytes, 15);

    let plain = orphans
        .iter()
        .find(|o| o.path.ends_with("lecture-notes.PDF"))
        .unwrap();
    assert_eq!(plain.inferred_identifier, None);

    db.close().await;
}

#[tokio::test]
async fn test_add_orphaned_pdf() {
    let (db, _file) = test_db().await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("10.1007_orphan.pdf");
    std::fs::write(&path, b"%PDF-1.4 body").unwrap();

    db.add_orphaned_pdf(&path, "10.1007/orphan").await.unwrap();

    let record = db.get("10.1007/orphan").await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Success);
    assert_eq!(record.strategy_used.as_deref(), Some(ORPHAN_SCAN_STRATEGY));
    assert_eq!(record.publisher.as_deref(), Some("Springer"));
    assert_eq!(record.file_size, Some(13));
    assert_eq!(
        record.sanitized_filename.as_deref(),
        Some("10.1007_orphan.pdf")
    );

    assert!(db.scan_for_orphaned_pdfs(dir.path()).await.unwrap().is_empty());

    db.close().await;
}
