mod merge;
mod verify;

use crate::db::*;
use tempfile::NamedTempFile;

/// Fresh store in a temp file; keep the `NamedTempFile` alive for the test's duration
pub(super) async fn test_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

/// Overwrite `last_attempted` to simulate an old attempt
pub(super) async fn set_last_attempted(db: &Database, identifier: &str, ts: i64) {
    sqlx::query("UPDATE download_results SET last_attempted = ? WHERE identifier = ?")
        .bind(ts)
        .bind(identifier)
        .execute(&db.pool)
        .await
        .unwrap();
}
