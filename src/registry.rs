use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::catalog::sqlite::FILE_REFERENCES_TABLE;
use crate::catalog::ScopeContext;
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// A registry entry to be appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NewFileReference {
    pub storage: String,
    pub file_url: String,
    pub file_size: Option<i64>,
    pub source_id: Option<String>,
    pub model_id: Option<String>,
    pub column_id: Option<String>,
    pub is_external: bool,
    pub deleted: bool,
}

/// The host system's global file-reference registry. This crate only ever
/// appends to it.
#[async_trait]
pub trait FileReferenceRegistry: Send + Sync {
    /// Id of any entry recorded for `file_url` under `storage`.
    async fn find(&self, file_url: &str, storage: &str) -> AppResult<Option<String>>;

    /// Append an entry and return its generated id.
    async fn insert(&self, scope: &ScopeContext, entry: &NewFileReference) -> AppResult<String>;
}

#[derive(Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileReferenceRegistry for SqliteRegistry {
    async fn find(&self, file_url: &str, storage: &str) -> AppResult<Option<String>> {
        sqlx::query_scalar(&format!(
            "SELECT id FROM {FILE_REFERENCES_TABLE} WHERE file_url = ?1 AND storage = ?2 LIMIT 1"
        ))
        .bind(file_url)
        .bind(storage)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "registry_find")
                .with_context("file_url", file_url.to_string())
        })
    }

    async fn insert(&self, scope: &ScopeContext, entry: &NewFileReference) -> AppResult<String> {
        let id = Uuid::now_v7().to_string();
        sqlx::query(&format!(
            "INSERT INTO {FILE_REFERENCES_TABLE} (
                id, fk_workspace_id, base_id, source_id, fk_model_id, fk_column_id,
                storage, file_url, file_size, is_external, deleted, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ))
        .bind(&id)
        .bind(scope.workspace_id.as_deref())
        .bind(&scope.base_id)
        .bind(entry.source_id.as_deref())
        .bind(entry.model_id.as_deref())
        .bind(entry.column_id.as_deref())
        .bind(&entry.storage)
        .bind(&entry.file_url)
        .bind(entry.file_size)
        .bind(entry.is_external)
        .bind(entry.deleted)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            AppError::new("REGISTRY/INSERT", "Failed to record file reference.")
                .with_context("file_url", entry.file_url.clone())
                .with_context("base_id", scope.base_id.clone())
                .with_cause(err)
        })?;
        Ok(id)
    }
}
