#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;
use tracing::subscriber::{self, DefaultGuard};
use tracing_subscriber::{fmt, EnvFilter};

use attachment_reconcile::config::MigrationOptions;
use attachment_reconcile::progress::ProgressLedger;
use attachment_reconcile::registry::SqliteRegistry;
use util::{
    count, insert_row, migration, migration_with_registry, row_files, seed_model, seed_model_in,
    temp_pool, upload_keys, FailingRegistry, MemoryStorage,
};

struct BufferWriter(Arc<StdMutex<Vec<u8>>>);

impl std::io::Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_buffer_subscriber() -> (Arc<StdMutex<Vec<u8>>>, DefaultGuard) {
    let buffer: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
    let writer = buffer.clone();
    let subscriber = fmt()
        .with_env_filter(EnvFilter::new("attachment_reconcile=debug"))
        .with_writer(move || BufferWriter(writer.clone()))
        .json()
        .finish();
    let guard = subscriber::set_default(subscriber);
    (buffer, guard)
}

fn logs_to_string(buffer: &Arc<StdMutex<Vec<u8>>>) -> String {
    String::from_utf8(buffer.lock().unwrap().clone()).expect("log utf8")
}

async fn seed_fifteen_rows(pool: &sqlx::SqlitePool) {
    seed_model(pool, "m1", "photos").await;
    for i in 0..15 {
        insert_row(
            pool,
            "photos",
            i + 1,
            json!([{"path": format!("download/2024/f{i:03}.png")}]),
        )
        .await;
    }
}

#[tokio::test]
async fn registry_failure_keeps_checkpoints_and_resumes() {
    let pool = temp_pool().await;
    seed_fifteen_rows(&pool).await;

    // Each row costs two inserts: the orphan entry then the scoped one.
    let failing = Arc::new(FailingRegistry {
        inner: SqliteRegistry::new(pool.clone()),
        allowed_inserts: 25,
        inserts: AtomicUsize::new(0),
    });
    let ok = migration_with_registry(
        &pool,
        MemoryStorage::new(upload_keys(20)),
        failing,
        MigrationOptions::default(),
    )
    .run()
    .await;
    assert!(!ok);

    let ledger = ProgressLedger::new(pool.clone());
    let progress = ledger.get("m1").await.unwrap().unwrap();
    assert_eq!(progress.offset, 10);
    assert!(!progress.completed);
    for id in 1..=10 {
        assert!(row_files(&pool, "photos", id).await[0]["id"].is_string());
    }
    for id in 11..=15 {
        assert!(row_files(&pool, "photos", id).await[0]["id"].is_null());
    }

    let summary = migration(&pool, MemoryStorage::new(upload_keys(20)), MigrationOptions::default())
        .execute()
        .await
        .unwrap();
    assert_eq!(summary.files_staged, 0);
    assert_eq!(summary.stats.rows_scanned, 5);
    assert!(ledger.get("m1").await.unwrap().unwrap().completed);
    for id in 1..=15 {
        assert!(row_files(&pool, "photos", id).await[0]["id"].is_string());
    }
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(DISTINCT file_url) FROM nc_file_references WHERE deleted = 1"
        )
        .await,
        15
    );
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM nc_file_references WHERE deleted = 1").await,
        15
    );
}

#[tokio::test]
async fn scan_failure_fails_the_run_and_keeps_committed_batches() {
    let pool = temp_pool().await;
    seed_fifteen_rows(&pool).await;

    let mut broken = MemoryStorage::new(upload_keys(250));
    broken.fail_after = Some(150);
    let ok = migration(&pool, broken, MigrationOptions::default()).run().await;
    assert!(!ok);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM nc_temp_file_references").await, 100);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM nc_temp_processed_models").await, 0);

    let summary = migration(
        &pool,
        MemoryStorage::new(upload_keys(250)),
        MigrationOptions::default(),
    )
        .execute()
        .await
        .unwrap();
    assert_eq!(summary.files_scanned, 250);
    assert_eq!(summary.files_staged, 150);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM nc_temp_file_references").await, 250);
}

#[tokio::test]
async fn repeated_runs_stage_nothing_new() {
    let pool = temp_pool().await;
    let options = MigrationOptions {
        scan_batch_size: 7,
        max_in_flight_batches: 3,
        ..MigrationOptions::default()
    };
    let first = migration(&pool, MemoryStorage::new(upload_keys(50)), options.clone())
        .execute()
        .await
        .unwrap();
    let second = migration(&pool, MemoryStorage::new(upload_keys(50)), options)
        .execute()
        .await
        .unwrap();
    assert_eq!(first.files_staged, 50);
    assert_eq!(second.files_staged, 0);
    assert_eq!(second.passes, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM nc_temp_file_references").await, 50);
}

#[tokio::test]
async fn unresolvable_model_is_skipped_without_looping() {
    let pool = temp_pool().await;
    seed_fifteen_rows(&pool).await;
    seed_model_in(&pool, "m_orphaned", "s_gone", "ghost").await;

    let summary = migration(&pool, MemoryStorage::new(upload_keys(20)), MigrationOptions::default())
        .execute()
        .await
        .unwrap();

    assert_eq!(summary.passes, 1);
    assert_eq!(summary.models_completed, 1);
    assert_eq!(summary.models_skipped, 1);
    let ledger = ProgressLedger::new(pool.clone());
    assert!(ledger.get("m_orphaned").await.unwrap().is_none());

    let again = migration(&pool, MemoryStorage::new(upload_keys(20)), MigrationOptions::default())
        .execute()
        .await
        .unwrap();
    assert_eq!(again.models_skipped, 1, "retried on the next run");
    assert_eq!(again.models_completed, 0);
}

#[tokio::test]
async fn model_without_primary_key_is_completed_untouched() {
    let pool = temp_pool().await;
    seed_model(&pool, "m1", "photos").await;
    insert_row(&pool, "photos", 1, json!([{"path": "download/2024/f000.png"}])).await;
    sqlx::query("UPDATE nc_columns SET pk = 0 WHERE fk_model_id = 'm1'")
        .execute(&pool)
        .await
        .unwrap();

    let summary = migration(&pool, MemoryStorage::new(upload_keys(3)), MigrationOptions::default())
        .execute()
        .await
        .unwrap();

    assert_eq!(summary.models_completed, 1);
    assert_eq!(summary.stats.rows_scanned, 0);
    assert!(row_files(&pool, "photos", 1).await[0]["id"].is_null());
    assert!(ProgressLedger::new(pool.clone())
        .get("m1")
        .await
        .unwrap()
        .unwrap()
        .completed);
}

#[tokio::test]
async fn run_logs_job_events() {
    let (buffer, _guard) = init_buffer_subscriber();
    let pool = temp_pool().await;
    seed_model(&pool, "m1", "photos").await;
    insert_row(&pool, "photos", 1, json!([{"path": "download/elsewhere/gone.pdf"}])).await;

    let ok = migration(&pool, MemoryStorage::new(upload_keys(3)), MigrationOptions::default())
        .run()
        .await;
    assert!(ok);

    let logs = logs_to_string(&buffer);
    assert!(logs.contains("\"event\":\"job_started\""), "{logs}");
    assert!(logs.contains("\"event\":\"staged_file_missing\""), "{logs}");
    assert!(logs.contains("\"event\":\"model_completed\""), "{logs}");
    assert!(logs.contains("\"event\":\"job_succeeded\""), "{logs}");
    assert!(logs.contains("nc_job_001_attachment"), "{logs}");
}
