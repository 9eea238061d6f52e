use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::catalog::sqlite::COLUMNS_TABLE;
use crate::catalog::{ScopeContext, ATTACHMENT_UIDT};
use crate::schema::PROGRESS_TABLE;
use crate::{AppError, AppResult};

/// A model that owns at least one attachment column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelRef {
    pub workspace_id: Option<String>,
    pub base_id: String,
    pub source_id: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn scope(&self) -> ScopeContext {
        ScopeContext {
            workspace_id: self.workspace_id.clone(),
            base_id: self.base_id.clone(),
        }
    }
}

/// Every attachment-bearing model not yet marked completed.
///
/// The query is paged only to bound each round trip; the full candidate set
/// is accumulated before returning. Callers re-run it after each pass since
/// other activity may add attachment columns meanwhile.
pub async fn list_incomplete_models(pool: &SqlitePool, page_size: u32) -> AppResult<Vec<ModelRef>> {
    let sql = format!(
        "SELECT fk_workspace_id, base_id, source_id, fk_model_id
         FROM {COLUMNS_TABLE}
         WHERE uidt = ?1
           AND fk_model_id NOT IN (
               SELECT fk_model_id FROM {PROGRESS_TABLE} WHERE completed = 1
           )
         GROUP BY fk_workspace_id, base_id, source_id, fk_model_id
         ORDER BY fk_model_id
         LIMIT ?2 OFFSET ?3"
    );

    let mut models = Vec::new();
    let mut offset: i64 = 0;
    loop {
        let rows = sqlx::query(&sql)
            .bind(ATTACHMENT_UIDT)
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "discover_attachment_models")
                    .with_context("offset", offset.to_string())
            })?;
        offset += i64::from(page_size);

        if rows.is_empty() {
            break;
        }
        for row in rows {
            models.push(ModelRef {
                workspace_id: row.try_get("fk_workspace_id")?,
                base_id: row.try_get("base_id")?,
                source_id: row.try_get("source_id")?,
                model_id: row.try_get("fk_model_id")?,
            });
        }
    }
    Ok(models)
}
