use sqlx::{Executor, SqlitePool};
use tracing::info;

use crate::db::table_exists;
use crate::{AppError, AppResult, LOG_TARGET};

pub const STAGING_TABLE: &str = "nc_temp_file_references";
pub const PROGRESS_TABLE: &str = "nc_temp_processed_models";

const STAGING_DDL: &str = "CREATE TABLE IF NOT EXISTS nc_temp_file_references (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    mimetype TEXT,
    referenced INTEGER NOT NULL DEFAULT 0,
    thumbnail_generated INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS nc_temp_file_references_file_path_idx
    ON nc_temp_file_references (file_path);";

const PROGRESS_DDL: &str = "CREATE TABLE IF NOT EXISTS nc_temp_processed_models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fk_model_id TEXT NOT NULL,
    \"offset\" INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS nc_temp_processed_models_fk_model_id_idx
    ON nc_temp_processed_models (fk_model_id);";

/// Create the staging and progress tables when they are missing.
///
/// Existing tables are left untouched so that a restarted job keeps every
/// staged path and checkpoint written by earlier runs.
pub async fn ensure_work_tables(pool: &SqlitePool) -> AppResult<()> {
    for (table, ddl) in [(STAGING_TABLE, STAGING_DDL), (PROGRESS_TABLE, PROGRESS_DDL)] {
        if table_exists(pool, table).await? {
            info!(target: LOG_TARGET, event = "work_table_present", table = table);
            continue;
        }
        pool.execute(ddl).await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "ensure_work_tables")
                .with_context("table", table.to_string())
        })?;
        info!(target: LOG_TARGET, event = "work_table_created", table = table);
    }
    Ok(())
}
