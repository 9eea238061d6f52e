//! Per-model walk over attachment columns: flips staged files to referenced,
//! records orphan and scoped registry entries, assigns missing ids and
//! writes changed rows back, checkpointing after every page.

use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::attachment::{
    guess_mimetype, parse_attachment_column, serialize_attachment_column, AttachmentDescriptor,
};
use crate::catalog::{
    Column, EntityResolver, Model, RowData, RowQuery, RowStore, ScopeContext, Source,
};
use crate::config::MigrationOptions;
use crate::discovery::ModelRef;
use crate::progress::ProgressLedger;
use crate::registry::{FileReferenceRegistry, NewFileReference};
use crate::staging::StagingStore;
use crate::{AppResult, JOB_ID, LOG_TARGET};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub rows_scanned: u64,
    pub rows_updated: u64,
    pub ids_assigned: u64,
    pub files_referenced: u64,
    pub orphans_registered: u64,
    pub missing_files: u64,
    pub malformed_columns: u64,
    pub rows_without_predicate: u64,
}

impl AddAssign for ReconcileStats {
    fn add_assign(&mut self, other: Self) {
        self.rows_scanned += other.rows_scanned;
        self.rows_updated += other.rows_updated;
        self.ids_assigned += other.ids_assigned;
        self.files_referenced += other.files_referenced;
        self.orphans_registered += other.orphans_registered;
        self.missing_files += other.missing_files;
        self.malformed_columns += other.malformed_columns;
        self.rows_without_predicate += other.rows_without_predicate;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingSource,
    MissingModel,
    NoConnection,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::MissingSource => "missing_source",
            SkipReason::MissingModel => "missing_model",
            SkipReason::NoConnection => "no_connection",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelOutcome {
    Completed(ReconcileStats),
    /// Left incomplete; a later run retries it.
    Skipped(SkipReason),
}

/// A row whose attachment columns changed, keyed by column name.
struct RowUpdate {
    pk: Vec<(String, Value)>,
    data: RowData,
}

/// Everything resolved for one model before its rows are walked.
struct ModelContext<'a> {
    model_ref: &'a ModelRef,
    scope: ScopeContext,
    source: Source,
    model: Model,
}

pub struct Reconciler {
    staging: StagingStore,
    ledger: ProgressLedger,
    registry: Arc<dyn FileReferenceRegistry>,
    resolver: Arc<dyn EntityResolver>,
    storage_name: String,
    options: MigrationOptions,
}

impl Reconciler {
    pub fn new(
        staging: StagingStore,
        ledger: ProgressLedger,
        registry: Arc<dyn FileReferenceRegistry>,
        resolver: Arc<dyn EntityResolver>,
        storage_name: impl Into<String>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            staging,
            ledger,
            registry,
            resolver,
            storage_name: storage_name.into(),
            options,
        }
    }

    /// Walk one model from its stored offset to the end of its rows.
    ///
    /// Operational failures (staging or registry writes, row reads and
    /// updates) propagate and leave the last checkpoint in place.
    pub async fn process_model(&self, model_ref: &ModelRef) -> AppResult<ModelOutcome> {
        let scope = model_ref.scope();
        let Some(source) = self.resolver.source(&scope, &model_ref.source_id).await? else {
            return Ok(self.skip(model_ref, SkipReason::MissingSource));
        };
        let Some(model) = self.resolver.model(&scope, &model_ref.model_id).await? else {
            return Ok(self.skip(model_ref, SkipReason::MissingModel));
        };
        let Some(rows) = self.resolver.row_store(&source, &model).await? else {
            return Ok(self.skip(model_ref, SkipReason::NoConnection));
        };

        let ctx = ModelContext {
            model_ref,
            scope,
            source,
            model,
        };
        let stats = self.walk_rows(&ctx, rows.as_ref()).await.map_err(|err| {
            err.with_context("model_id", model_ref.model_id.clone())
                .with_context("base_id", model_ref.base_id.clone())
        })?;
        Ok(ModelOutcome::Completed(stats))
    }

    fn skip(&self, model_ref: &ModelRef, reason: SkipReason) -> ModelOutcome {
        warn!(
            target: LOG_TARGET,
            event = "model_skipped",
            job = JOB_ID,
            model_id = %model_ref.model_id,
            source_id = %model_ref.source_id,
            base_id = %model_ref.base_id,
            reason = %reason,
        );
        ModelOutcome::Skipped(reason)
    }

    async fn walk_rows(
        &self,
        ctx: &ModelContext<'_>,
        rows: &dyn RowStore,
    ) -> AppResult<ReconcileStats> {
        let model_id = ctx.model.id.as_str();
        let mut stats = ReconcileStats::default();

        let attachment_columns: Vec<Column> =
            ctx.model.attachment_columns().into_iter().cloned().collect();
        let primary_keys: Vec<Column> = ctx.model.primary_keys().into_iter().cloned().collect();
        if attachment_columns.is_empty() {
            info!(
                target: LOG_TARGET,
                event = "model_without_attachments",
                job = JOB_ID,
                model_id,
            );
            self.ledger.mark_completed(model_id).await?;
            return Ok(stats);
        }
        if primary_keys.is_empty() {
            warn!(
                target: LOG_TARGET,
                event = "model_without_primary_key",
                job = JOB_ID,
                model_id,
                table = %ctx.model.table_name,
            );
            self.ledger.mark_completed(model_id).await?;
            return Ok(stats);
        }

        let progress = self.ledger.load_or_init(model_id).await?;
        let mut offset = progress.offset;
        info!(
            target: LOG_TARGET,
            event = "model_started",
            job = JOB_ID,
            model_id,
            table = %ctx.model.table_name,
            offset,
        );

        let mut fields = primary_keys.clone();
        fields.extend(attachment_columns.iter().cloned());
        loop {
            let page = rows
                .list(&RowQuery {
                    fields: fields.clone(),
                    sort: primary_keys.clone(),
                    limit: self.options.row_page_size,
                    offset,
                    ignore_view_filters: true,
                })
                .await?;
            if page.is_empty() {
                break;
            }

            let mut updates = Vec::new();
            for row in &page {
                stats.rows_scanned += 1;
                let changed = self
                    .reconcile_row(ctx, &attachment_columns, row, &mut stats)
                    .await?;
                if let Some(data) = changed {
                    match row_predicate(&primary_keys, row) {
                        Some(pk) => updates.push(RowUpdate { pk, data }),
                        None => {
                            stats.rows_without_predicate += 1;
                            warn!(
                                target: LOG_TARGET,
                                event = "row_without_predicate",
                                job = JOB_ID,
                                model_id,
                                offset,
                            );
                        }
                    }
                }
            }

            for update in &updates {
                rows.update_by_pk(&update.pk, &update.data).await?;
                stats.rows_updated += 1;
            }

            offset += i64::from(self.options.row_page_size);
            self.ledger.advance(model_id, offset).await?;
            debug!(
                target: LOG_TARGET,
                event = "page_checkpoint",
                job = JOB_ID,
                model_id,
                offset,
                updated = updates.len(),
            );
        }

        self.ledger.mark_completed(model_id).await?;
        info!(
            target: LOG_TARGET,
            event = "model_completed",
            job = JOB_ID,
            model_id,
            rows_scanned = stats.rows_scanned,
            rows_updated = stats.rows_updated,
            ids_assigned = stats.ids_assigned,
            files_referenced = stats.files_referenced,
            orphans_registered = stats.orphans_registered,
            missing_files = stats.missing_files,
        );
        Ok(stats)
    }

    /// Reconcile every attachment column of `row`; returns the changed
    /// columns keyed by column name, if any.
    async fn reconcile_row(
        &self,
        ctx: &ModelContext<'_>,
        columns: &[Column],
        row: &RowData,
        stats: &mut ReconcileStats,
    ) -> AppResult<Option<RowData>> {
        let mut changed = RowData::new();
        for column in columns {
            let Some(raw) = row.get(&column.title) else {
                continue;
            };
            let mut attachments = match parse_attachment_column(raw) {
                Ok(Some(attachments)) => attachments,
                Ok(None) => continue,
                Err(err) => {
                    stats.malformed_columns += 1;
                    warn!(
                        target: LOG_TARGET,
                        event = "attachment_column_malformed",
                        job = JOB_ID,
                        model_id = %ctx.model.id,
                        column = %column.column_name,
                        code = %err.code(),
                        error = %err,
                    );
                    continue;
                }
            };

            let mut column_changed = false;
            for attachment in attachments.iter_mut() {
                column_changed |= self.reconcile_attachment(ctx, column, attachment, stats).await?;
            }
            if column_changed {
                changed.insert(
                    column.column_name.clone(),
                    Value::String(serialize_attachment_column(&attachments)?),
                );
            }
        }
        Ok((!changed.is_empty()).then_some(changed))
    }

    /// Returns whether the descriptor itself was modified.
    async fn reconcile_attachment(
        &self,
        ctx: &ModelContext<'_>,
        column: &Column,
        attachment: &mut AttachmentDescriptor,
        stats: &mut ReconcileStats,
    ) -> AppResult<bool> {
        let Some(key) = attachment.storage_key(
            &self.options.uploads_prefix,
            &self.options.legacy_path_prefix,
        ) else {
            return Ok(false);
        };
        let file_url = attachment.file_url().unwrap_or_default().to_string();

        match self.staging.find(&key).await? {
            None => {
                stats.missing_files += 1;
                warn!(
                    target: LOG_TARGET,
                    event = "staged_file_missing",
                    job = JOB_ID,
                    model_id = %ctx.model.id,
                    column = %column.column_name,
                    storage_key = %key,
                );
            }
            Some(staged) if !staged.referenced => {
                let mimetype = guess_mimetype(attachment, &key);
                if self.staging.mark_referenced(&key, mimetype.as_deref()).await? {
                    stats.files_referenced += 1;
                    if self.registry.find(&file_url, &self.storage_name).await?.is_none() {
                        self.registry
                            .insert(
                                &ScopeContext::root(),
                                &NewFileReference {
                                    storage: self.storage_name.clone(),
                                    file_url: file_url.clone(),
                                    file_size: attachment.size_bytes(),
                                    deleted: true,
                                    ..Default::default()
                                },
                            )
                            .await?;
                        stats.orphans_registered += 1;
                    }
                }
            }
            Some(_) => {}
        }

        if attachment.has_id() {
            return Ok(false);
        }
        let id = self
            .registry
            .insert(
                &ctx.scope,
                &NewFileReference {
                    storage: self.storage_name.clone(),
                    file_url,
                    file_size: attachment.size_bytes(),
                    source_id: Some(ctx.model_ref.source_id.clone()),
                    model_id: Some(ctx.model.id.clone()),
                    column_id: Some(column.id.clone()),
                    is_external: !ctx.source.is_meta,
                    deleted: false,
                },
            )
            .await?;
        attachment.set_id(id);
        stats.ids_assigned += 1;
        Ok(true)
    }
}

/// Primary-key values of `row` by column name, or `None` when any is absent.
fn row_predicate(primary_keys: &[Column], row: &RowData) -> Option<Vec<(String, Value)>> {
    primary_keys
        .iter()
        .map(|pk| match row.get(&pk.title) {
            Some(Value::Null) | None => None,
            Some(value) => Some((pk.column_name.clone(), value.clone())),
        })
        .collect()
}
