//! Entities of the metadata store that the reconciliation walks: sources,
//! models (tables) and their columns, plus row-level access to model data.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::AppResult;

pub mod sqlite;

/// Column type tag of attachment columns.
pub const ATTACHMENT_UIDT: &str = "Attachment";
/// Scope used for entries that belong to no workspace or base.
pub const ROOT_SCOPE: &str = "root";

/// Tenant scope for metadata lookups and registry writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeContext {
    pub workspace_id: Option<String>,
    pub base_id: String,
}

impl ScopeContext {
    pub fn root() -> Self {
        Self {
            workspace_id: Some(ROOT_SCOPE.to_string()),
            base_id: ROOT_SCOPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub base_id: String,
    /// Data lives in the metadata store itself rather than an external db.
    pub is_meta: bool,
    pub connection: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub id: String,
    pub column_name: String,
    pub title: String,
    pub uidt: String,
    pub pk: bool,
}

impl Column {
    pub fn is_attachment(&self) -> bool {
        self.uidt == ATTACHMENT_UIDT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub base_id: String,
    pub source_id: String,
    pub table_name: String,
    pub title: String,
    pub columns: Vec<Column>,
}

impl Model {
    pub fn primary_keys(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.pk).collect()
    }

    pub fn attachment_columns(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.is_attachment()).collect()
    }
}

/// A page request against one model's rows.
#[derive(Debug, Clone)]
pub struct RowQuery {
    /// Columns to project; rows come back keyed by column title.
    pub fields: Vec<Column>,
    /// Deterministic order, usually the primary key.
    pub sort: Vec<Column>,
    pub limit: u32,
    pub offset: i64,
    /// Read raw rows, bypassing any view-level filter or sort.
    pub ignore_view_filters: bool,
}

pub type RowData = Map<String, Value>;

/// Row-level access to the data of one model.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn list(&self, query: &RowQuery) -> AppResult<Vec<RowData>>;

    /// Update the single row matching every `(column_name, value)` predicate.
    /// `data` is keyed by column name.
    async fn update_by_pk(&self, pk: &[(String, Value)], data: &RowData) -> AppResult<u64>;
}

/// Resolves metadata entities. `Ok(None)` means "not found" and lets the
/// caller skip the model for this pass.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    async fn source(&self, scope: &ScopeContext, source_id: &str) -> AppResult<Option<Source>>;

    async fn model(&self, scope: &ScopeContext, model_id: &str) -> AppResult<Option<Model>>;

    /// Data access for `model`; `None` when no connection can be made.
    async fn row_store(
        &self,
        source: &Source,
        model: &Model,
    ) -> AppResult<Option<Arc<dyn RowStore>>>;
}
