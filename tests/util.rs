#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use attachment_reconcile::catalog::sqlite::{ensure_meta_schema, SqliteCatalog};
use attachment_reconcile::catalog::ScopeContext;
use attachment_reconcile::config::MigrationOptions;
use attachment_reconcile::registry::{FileReferenceRegistry, NewFileReference, SqliteRegistry};
use attachment_reconcile::storage::{PathStream, StorageAdapter};
use attachment_reconcile::{AppError, AppResult, AttachmentMigration};

pub const BASE: &str = "b1";
pub const SOURCE: &str = "s1";

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    ensure_meta_schema(&pool).await.expect("meta schema");
    sqlx::query("INSERT INTO nc_sources (id, base_id, is_meta) VALUES (?1, ?2, 1)")
        .bind(SOURCE)
        .bind(BASE)
        .execute(&pool)
        .await
        .unwrap();
    pool
}

/// A model backed by table `table_name` with an integer `id` pk and one
/// attachment column `files` titled "Files".
pub async fn seed_model(pool: &SqlitePool, model_id: &str, table_name: &str) {
    seed_model_in(pool, model_id, SOURCE, table_name).await;
    sqlx::query(&format!(
        "CREATE TABLE {table_name} (id INTEGER PRIMARY KEY, files TEXT)"
    ))
    .execute(pool)
    .await
    .unwrap();
}

/// Metadata rows only; the data table is left to the caller.
pub async fn seed_model_in(pool: &SqlitePool, model_id: &str, source_id: &str, table_name: &str) {
    sqlx::query(
        "INSERT INTO nc_models (id, base_id, source_id, table_name, title)
         VALUES (?1, ?2, ?3, ?4, ?4)",
    )
    .bind(model_id)
    .bind(BASE)
    .bind(source_id)
    .bind(table_name)
    .execute(pool)
    .await
    .unwrap();
    for (suffix, name, title, uidt, pk) in [
        ("pk", "id", "Id", "ID", true),
        ("files", "files", "Files", "Attachment", false),
    ] {
        sqlx::query(
            "INSERT INTO nc_columns
                 (id, base_id, source_id, fk_model_id, column_name, title, uidt, pk)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(format!("{model_id}_{suffix}"))
        .bind(BASE)
        .bind(source_id)
        .bind(model_id)
        .bind(name)
        .bind(title)
        .bind(uidt)
        .bind(pk)
        .execute(pool)
        .await
        .unwrap();
    }
}

pub async fn insert_row(pool: &SqlitePool, table_name: &str, id: i64, files: Value) {
    let cell = match files {
        Value::Null => None,
        Value::String(raw) => Some(raw),
        other => Some(other.to_string()),
    };
    sqlx::query(&format!("INSERT INTO {table_name} (id, files) VALUES (?1, ?2)"))
        .bind(id)
        .bind(cell)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn row_files(pool: &SqlitePool, table_name: &str, id: i64) -> Value {
    let raw: Option<String> =
        sqlx::query_scalar(&format!("SELECT files FROM {table_name} WHERE id = ?1"))
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap();
    match raw {
        Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        None => Value::Null,
    }
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

/// Fixed listing served as the storage scan, optionally failing after
/// `fail_after` keys.
pub struct MemoryStorage {
    pub paths: Vec<String>,
    pub fail_after: Option<usize>,
}

impl MemoryStorage {
    pub fn new(paths: Vec<String>) -> Self {
        Self {
            paths,
            fail_after: None,
        }
    }
}

impl StorageAdapter for MemoryStorage {
    fn name(&self) -> &str {
        "Local"
    }

    fn scan_files(&self, _pattern: &str) -> AppResult<PathStream> {
        let mut items: Vec<AppResult<String>> = self.paths.iter().cloned().map(Ok).collect();
        if let Some(limit) = self.fail_after {
            items.truncate(limit);
            items.push(Err(AppError::new("STORAGE/SCAN", "listing interrupted")));
        }
        Ok(stream::iter(items).boxed())
    }
}

pub fn upload_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("nc/uploads/2024/f{i:03}.png")).collect()
}

/// Delegates to the SQLite registry until `allowed_inserts` inserts succeeded.
pub struct FailingRegistry {
    pub inner: SqliteRegistry,
    pub allowed_inserts: usize,
    pub inserts: AtomicUsize,
}

#[async_trait]
impl FileReferenceRegistry for FailingRegistry {
    async fn find(&self, file_url: &str, storage: &str) -> AppResult<Option<String>> {
        self.inner.find(file_url, storage).await
    }

    async fn insert(&self, scope: &ScopeContext, entry: &NewFileReference) -> AppResult<String> {
        if self.inserts.fetch_add(1, Ordering::SeqCst) >= self.allowed_inserts {
            return Err(AppError::new("REGISTRY/INSERT", "registry unavailable"));
        }
        self.inner.insert(scope, entry).await
    }
}

pub fn migration(
    pool: &SqlitePool,
    storage: MemoryStorage,
    options: MigrationOptions,
) -> AttachmentMigration {
    migration_with_registry(
        pool,
        storage,
        Arc::new(SqliteRegistry::new(pool.clone())),
        options,
    )
}

pub fn migration_with_registry(
    pool: &SqlitePool,
    storage: MemoryStorage,
    registry: Arc<dyn FileReferenceRegistry>,
    options: MigrationOptions,
) -> AttachmentMigration {
    AttachmentMigration::new(
        pool.clone(),
        Arc::new(storage),
        Arc::new(SqliteCatalog::new(pool.clone())),
        registry,
        options,
    )
}
