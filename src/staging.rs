use std::collections::HashSet;

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::db::placeholders;
use crate::schema::STAGING_TABLE;
use crate::{AppError, AppResult};

/// One path observed in the backing store during the scan phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedFile {
    pub path: String,
    pub mimetype: Option<String>,
    pub referenced: bool,
    pub thumbnail_generated: bool,
}

/// Durable inventory of scanned paths; doubles as the dedup oracle.
#[derive(Clone)]
pub struct StagingStore {
    pool: SqlitePool,
}

impl StagingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The subset of `paths` that is already staged.
    pub async fn existing_paths(&self, paths: &[String]) -> AppResult<HashSet<String>> {
        if paths.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT file_path FROM {STAGING_TABLE} WHERE file_path IN ({})",
            placeholders(paths.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for path in paths {
            query = query.bind(path);
        }
        let found = query.fetch_all(&self.pool).await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "staging_existing_paths")
                .with_context("batch_len", paths.len().to_string())
        })?;
        Ok(found.into_iter().collect())
    }

    /// Stage every path not yet present. Returns the number of rows written.
    pub async fn insert_new(&self, paths: &[String]) -> AppResult<u64> {
        if paths.is_empty() {
            return Ok(0);
        }
        let values = (1..=paths.len())
            .map(|idx| format!("(?{idx})"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {STAGING_TABLE} (file_path) VALUES {values}
             ON CONFLICT(file_path) DO NOTHING"
        );
        let mut query = sqlx::query(&sql);
        for path in paths {
            query = query.bind(path);
        }
        let result = query.execute(&self.pool).await.map_err(|err| {
            AppError::new("STAGING/INSERT", "Failed to stage scanned files.")
                .with_context("operation", "staging_insert_new")
                .with_context("batch_len", paths.len().to_string())
                .with_cause(err)
        })?;
        Ok(result.rows_affected())
    }

    pub async fn find(&self, path: &str) -> AppResult<Option<StagedFile>> {
        let row = sqlx::query(&format!(
            "SELECT file_path, mimetype, referenced, thumbnail_generated
             FROM {STAGING_TABLE} WHERE file_path = ?1"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "staging_find")
                .with_context("path", path.to_string())
        })?;

        row.map(|row| -> AppResult<StagedFile> {
            Ok(StagedFile {
                path: row.try_get("file_path")?,
                mimetype: row.try_get("mimetype")?,
                referenced: row.try_get("referenced")?,
                thumbnail_generated: row.try_get("thumbnail_generated")?,
            })
        })
        .transpose()
    }

    /// Flip `referenced` to true and record the mimetype.
    ///
    /// Only an unreferenced entry is touched, so the flag never regresses and
    /// exactly one caller observes `true` for a given path.
    pub async fn mark_referenced(&self, path: &str, mimetype: Option<&str>) -> AppResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {STAGING_TABLE} SET mimetype = ?1, referenced = 1
             WHERE file_path = ?2 AND referenced = 0"
        ))
        .bind(mimetype)
        .bind(path)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "staging_mark_referenced")
                .with_context("path", path.to_string())
        })?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count(&self) -> AppResult<u64> {
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {STAGING_TABLE}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "staging_count"))?;
        Ok(total.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_work_tables;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> StagingStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ensure_work_tables(&pool).await.unwrap();
        StagingStore::new(pool)
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn insert_new_skips_existing_and_duplicate_paths() {
        let store = store().await;
        assert_eq!(store.insert_new(&paths(&["a", "b"])).await.unwrap(), 2);
        assert_eq!(store.insert_new(&paths(&["b", "c", "c"])).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 3);

        let existing = store.existing_paths(&paths(&["a", "z"])).await.unwrap();
        assert_eq!(existing, HashSet::from(["a".to_string()]));
    }

    #[tokio::test]
    async fn mark_referenced_flips_once() {
        let store = store().await;
        store.insert_new(&paths(&["nc/uploads/a.png"])).await.unwrap();

        assert!(store
            .mark_referenced("nc/uploads/a.png", Some("image/png"))
            .await
            .unwrap());
        assert!(!store
            .mark_referenced("nc/uploads/a.png", Some("text/plain"))
            .await
            .unwrap());

        let staged = store.find("nc/uploads/a.png").await.unwrap().unwrap();
        assert!(staged.referenced);
        assert_eq!(staged.mimetype.as_deref(), Some("image/png"));
        assert!(!staged.thumbnail_generated);
    }

    #[tokio::test]
    async fn find_missing_is_none() {
        let store = store().await;
        assert!(store.find("nope").await.unwrap().is_none());
        assert!(!store.mark_referenced("nope", None).await.unwrap());
    }
}
