use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::schema::PROGRESS_TABLE;
use crate::{AppError, AppResult};

/// Resumable cursor for one model: rows before `offset` are done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelProgress {
    pub model_id: String,
    pub offset: i64,
    pub completed: bool,
}

#[derive(Clone)]
pub struct ProgressLedger {
    pool: SqlitePool,
}

impl ProgressLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, model_id: &str) -> AppResult<Option<ModelProgress>> {
        let row = sqlx::query(&format!(
            "SELECT fk_model_id, \"offset\", completed FROM {PROGRESS_TABLE} WHERE fk_model_id = ?1"
        ))
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "progress_get")
                .with_context("model_id", model_id.to_string())
        })?;

        row.map(|row| -> AppResult<ModelProgress> {
            Ok(ModelProgress {
                model_id: row.try_get("fk_model_id")?,
                offset: row.try_get("offset")?,
                completed: row.try_get("completed")?,
            })
        })
        .transpose()
    }

    /// Return the stored cursor, creating one at offset 0 on first sight.
    pub async fn load_or_init(&self, model_id: &str) -> AppResult<ModelProgress> {
        sqlx::query(&format!(
            "INSERT INTO {PROGRESS_TABLE} (fk_model_id, \"offset\") VALUES (?1, 0)
             ON CONFLICT(fk_model_id) DO NOTHING"
        ))
        .bind(model_id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "progress_init")
                .with_context("model_id", model_id.to_string())
        })?;

        self.get(model_id).await?.ok_or_else(|| {
            AppError::new("PROGRESS/MISSING", "Progress row vanished after initialisation.")
                .with_context("model_id", model_id.to_string())
        })
    }

    /// Persist a new offset. Offsets only move forward and a completed model
    /// is never advanced; returns whether the stored cursor moved.
    pub async fn advance(&self, model_id: &str, offset: i64) -> AppResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {PROGRESS_TABLE} SET \"offset\" = ?1
             WHERE fk_model_id = ?2 AND completed = 0 AND \"offset\" < ?1"
        ))
        .bind(offset)
        .bind(model_id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "progress_advance")
                .with_context("model_id", model_id.to_string())
                .with_context("offset", offset.to_string())
        })?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal. Creates the row when the model was never walked.
    pub async fn mark_completed(&self, model_id: &str) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {PROGRESS_TABLE} (fk_model_id, \"offset\", completed) VALUES (?1, 0, 1)
             ON CONFLICT(fk_model_id) DO UPDATE SET completed = 1"
        ))
        .bind(model_id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "progress_mark_completed")
                .with_context("model_id", model_id.to_string())
        })?;
        Ok(())
    }

    /// Operator escape hatch: forget the cursor so the model is walked again.
    pub async fn reset(&self, model_id: &str) -> AppResult<()> {
        sqlx::query(&format!(
            "UPDATE {PROGRESS_TABLE} SET \"offset\" = 0, completed = 0 WHERE fk_model_id = ?1"
        ))
        .bind(model_id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "progress_reset")
                .with_context("model_id", model_id.to_string())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_work_tables;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn ledger() -> ProgressLedger {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ensure_work_tables(&pool).await.unwrap();
        ProgressLedger::new(pool)
    }

    #[tokio::test]
    async fn load_or_init_is_idempotent() {
        let ledger = ledger().await;
        let first = ledger.load_or_init("md_1").await.unwrap();
        assert_eq!(first.offset, 0);
        assert!(!first.completed);

        ledger.advance("md_1", 10).await.unwrap();
        let again = ledger.load_or_init("md_1").await.unwrap();
        assert_eq!(again.offset, 10, "existing cursor must be kept");
    }

    #[tokio::test]
    async fn advance_never_moves_backwards() {
        let ledger = ledger().await;
        ledger.load_or_init("md_1").await.unwrap();
        assert!(ledger.advance("md_1", 20).await.unwrap());
        assert!(!ledger.advance("md_1", 10).await.unwrap());
        assert_eq!(ledger.get("md_1").await.unwrap().unwrap().offset, 20);
    }

    #[tokio::test]
    async fn completed_model_is_frozen_until_reset() {
        let ledger = ledger().await;
        ledger.load_or_init("md_1").await.unwrap();
        ledger.advance("md_1", 10).await.unwrap();
        ledger.mark_completed("md_1").await.unwrap();

        assert!(!ledger.advance("md_1", 30).await.unwrap());
        let frozen = ledger.get("md_1").await.unwrap().unwrap();
        assert_eq!(frozen.offset, 10);
        assert!(frozen.completed);

        ledger.reset("md_1").await.unwrap();
        let reset = ledger.get("md_1").await.unwrap().unwrap();
        assert_eq!(reset.offset, 0);
        assert!(!reset.completed);
    }

    #[tokio::test]
    async fn completing_an_unseen_model_records_it() {
        let ledger = ledger().await;
        ledger.mark_completed("md_new").await.unwrap();
        let stored = ledger.get("md_new").await.unwrap().unwrap();
        assert!(stored.completed);
        assert_eq!(stored.offset, 0);
    }
}
