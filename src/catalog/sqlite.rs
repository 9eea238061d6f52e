use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePoolOptions};
use sqlx::{Executor, Row, SqlitePool};

use super::{Column, EntityResolver, Model, RowData, RowQuery, RowStore, ScopeContext, Source};
use crate::db::quote_ident;
use crate::{AppError, AppResult, LOG_TARGET};

pub const COLUMNS_TABLE: &str = "nc_columns";
pub const FILE_REFERENCES_TABLE: &str = "nc_file_references";

const META_DDL: &str = "CREATE TABLE IF NOT EXISTS nc_sources (
    id TEXT PRIMARY KEY,
    fk_workspace_id TEXT,
    base_id TEXT NOT NULL,
    is_meta INTEGER NOT NULL DEFAULT 1,
    connection TEXT
);
CREATE TABLE IF NOT EXISTS nc_models (
    id TEXT PRIMARY KEY,
    fk_workspace_id TEXT,
    base_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    title TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS nc_columns (
    id TEXT PRIMARY KEY,
    fk_workspace_id TEXT,
    base_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    fk_model_id TEXT NOT NULL,
    column_name TEXT NOT NULL,
    title TEXT NOT NULL,
    uidt TEXT NOT NULL,
    pk INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS nc_columns_uidt_idx ON nc_columns (uidt);
CREATE INDEX IF NOT EXISTS nc_columns_fk_model_id_idx ON nc_columns (fk_model_id);
CREATE TABLE IF NOT EXISTS nc_file_references (
    id TEXT PRIMARY KEY,
    fk_workspace_id TEXT,
    base_id TEXT,
    source_id TEXT,
    fk_model_id TEXT,
    fk_column_id TEXT,
    storage TEXT,
    file_url TEXT,
    file_size INTEGER,
    is_external INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS nc_file_references_url_storage_idx
    ON nc_file_references (file_url, storage);";

/// Create the metadata tables the SQLite collaborators read and write.
pub async fn ensure_meta_schema(pool: &SqlitePool) -> AppResult<()> {
    pool.execute(META_DDL)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "ensure_meta_schema"))?;
    Ok(())
}

/// Resolves sources, models and columns from the `nc_*` metadata tables.
pub struct SqliteCatalog {
    pool: SqlitePool,
    external: Mutex<HashMap<String, SqlitePool>>,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            external: Mutex::new(HashMap::new()),
        }
    }

    async fn external_pool(&self, source: &Source, connection: &str) -> Option<SqlitePool> {
        let cached = self
            .external
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&source.id)
            .cloned();
        if cached.is_some() {
            return cached;
        }

        match SqlitePoolOptions::new()
            .max_connections(2)
            .connect(connection)
            .await
        {
            Ok(pool) => {
                self.external
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(source.id.clone(), pool.clone());
                Some(pool)
            }
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    event = "source_connection_failed",
                    source_id = %source.id,
                    error = %err,
                );
                None
            }
        }
    }
}

#[async_trait]
impl EntityResolver for SqliteCatalog {
    async fn source(&self, scope: &ScopeContext, source_id: &str) -> AppResult<Option<Source>> {
        let row = sqlx::query(
            "SELECT id, base_id, is_meta, connection FROM nc_sources
             WHERE id = ?1 AND base_id = ?2 AND (?3 IS NULL OR fk_workspace_id = ?3)",
        )
        .bind(source_id)
        .bind(&scope.base_id)
        .bind(scope.workspace_id.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "catalog_source")
                .with_context("source_id", source_id.to_string())
        })?;

        row.map(|row| -> AppResult<Source> {
            Ok(Source {
                id: row.try_get("id")?,
                base_id: row.try_get("base_id")?,
                is_meta: row.try_get("is_meta")?,
                connection: row.try_get("connection")?,
            })
        })
        .transpose()
    }

    async fn model(&self, scope: &ScopeContext, model_id: &str) -> AppResult<Option<Model>> {
        let row = sqlx::query(
            "SELECT id, base_id, source_id, table_name, title FROM nc_models
             WHERE id = ?1 AND base_id = ?2 AND (?3 IS NULL OR fk_workspace_id = ?3)",
        )
        .bind(model_id)
        .bind(&scope.base_id)
        .bind(scope.workspace_id.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "catalog_model")
                .with_context("model_id", model_id.to_string())
        })?;
        let Some(row) = row else {
            return Ok(None);
        };

        let columns = sqlx::query(
            "SELECT id, column_name, title, uidt, pk FROM nc_columns
             WHERE fk_model_id = ?1 ORDER BY rowid",
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "catalog_columns")
                .with_context("model_id", model_id.to_string())
        })?
        .into_iter()
        .map(|col| -> AppResult<Column> {
            Ok(Column {
                id: col.try_get("id")?,
                column_name: col.try_get("column_name")?,
                title: col.try_get("title")?,
                uidt: col.try_get("uidt")?,
                pk: col.try_get("pk")?,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

        Ok(Some(Model {
            id: row.try_get("id")?,
            base_id: row.try_get("base_id")?,
            source_id: row.try_get("source_id")?,
            table_name: row.try_get("table_name")?,
            title: row.try_get("title")?,
            columns,
        }))
    }

    async fn row_store(
        &self,
        source: &Source,
        model: &Model,
    ) -> AppResult<Option<Arc<dyn RowStore>>> {
        let pool = match source.connection.as_deref() {
            Some(connection) if !source.is_meta => {
                match self.external_pool(source, connection).await {
                    Some(pool) => pool,
                    None => return Ok(None),
                }
            }
            _ => self.pool.clone(),
        };
        Ok(Some(Arc::new(SqliteRowStore::new(
            pool,
            model.table_name.clone(),
        ))))
    }
}

/// Rows of one physical table.
pub struct SqliteRowStore {
    pool: SqlitePool,
    table_name: String,
}

impl SqliteRowStore {
    pub fn new(pool: SqlitePool, table_name: String) -> Self {
        Self { pool, table_name }
    }
}

fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(n) => match n.as_i64() {
            Some(int) => query.bind(int),
            None => query.bind(n.as_f64()),
        },
        Value::String(text) => query.bind(text.clone()),
        other => query.bind(other.to_string()),
    }
}

#[async_trait]
impl RowStore for SqliteRowStore {
    async fn list(&self, query: &RowQuery) -> AppResult<Vec<RowData>> {
        // Plain tables have no view layer, so `ignore_view_filters` always holds.
        let projection = query
            .fields
            .iter()
            .map(|c| format!("{}, {}", sql_literal(&c.title), quote_ident(&c.column_name)))
            .collect::<Vec<_>>()
            .join(", ");
        let order = if query.sort.is_empty() {
            String::new()
        } else {
            let keys = query
                .sort
                .iter()
                .map(|c| quote_ident(&c.column_name))
                .collect::<Vec<_>>()
                .join(", ");
            format!("ORDER BY {keys}")
        };
        let sql = format!(
            "SELECT json_object({projection}) AS row_json FROM {} {order} LIMIT ?1 OFFSET ?2",
            quote_ident(&self.table_name)
        );

        let rows = sqlx::query(&sql)
            .bind(i64::from(query.limit))
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "row_store_list")
                    .with_context("table", self.table_name.clone())
                    .with_context("offset", query.offset.to_string())
            })?;

        rows.into_iter()
            .map(|row| -> AppResult<RowData> {
                let raw: String = row.try_get("row_json")?;
                Ok(serde_json::from_str::<RowData>(&raw)?)
            })
            .collect()
    }

    async fn update_by_pk(&self, pk: &[(String, Value)], data: &RowData) -> AppResult<u64> {
        if pk.is_empty() || data.is_empty() {
            return Err(AppError::new(
                "CATALOG/EMPTY_UPDATE",
                "Row update needs both a primary-key predicate and data.",
            )
            .with_context("table", self.table_name.clone()));
        }
        let assignments = data
            .keys()
            .enumerate()
            .map(|(idx, name)| format!("{} = ?{}", quote_ident(name), idx + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = pk
            .iter()
            .enumerate()
            .map(|(idx, (name, _))| format!("{} = ?{}", quote_ident(name), data.len() + idx + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {predicate}",
            quote_ident(&self.table_name)
        );

        let mut update = sqlx::query(&sql);
        for value in data.values() {
            update = bind_json(update, value);
        }
        for (_, value) in pk {
            update = bind_json(update, value);
        }
        let result = update.execute(&self.pool).await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "row_store_update")
                .with_context("table", self.table_name.clone())
        })?;
        Ok(result.rows_affected())
    }
}
