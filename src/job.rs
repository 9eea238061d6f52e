use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::catalog::EntityResolver;
use crate::config::MigrationOptions;
use crate::discovery::{list_incomplete_models, ModelRef};
use crate::inventory::InventoryBuilder;
use crate::progress::ProgressLedger;
use crate::reconcile::{ModelOutcome, ReconcileStats, Reconciler};
use crate::registry::FileReferenceRegistry;
use crate::schema::ensure_work_tables;
use crate::staging::StagingStore;
use crate::storage::StorageAdapter;
use crate::{AppError, AppResult, JOB_ID, LOG_TARGET};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub files_scanned: u64,
    pub files_staged: u64,
    pub passes: u32,
    pub models_completed: u64,
    pub models_skipped: u64,
    pub stats: ReconcileStats,
}

/// The attachment-reference reconciliation job.
///
/// Safe to re-run after any failure: staging skips known paths and each
/// model resumes from its last checkpoint.
pub struct AttachmentMigration {
    pool: SqlitePool,
    storage: Arc<dyn StorageAdapter>,
    resolver: Arc<dyn EntityResolver>,
    registry: Arc<dyn FileReferenceRegistry>,
    options: MigrationOptions,
}

impl AttachmentMigration {
    pub fn new(
        pool: SqlitePool,
        storage: Arc<dyn StorageAdapter>,
        resolver: Arc<dyn EntityResolver>,
        registry: Arc<dyn FileReferenceRegistry>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            pool,
            storage,
            resolver,
            registry,
            options,
        }
    }

    /// Run to completion, reporting only success or failure.
    pub async fn run(&self) -> bool {
        match self.execute().await {
            Ok(summary) => {
                info!(
                    target: LOG_TARGET,
                    event = "job_succeeded",
                    job = JOB_ID,
                    files_scanned = summary.files_scanned,
                    passes = summary.passes,
                    models_completed = summary.models_completed,
                    models_skipped = summary.models_skipped,
                );
                true
            }
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    event = "job_failed",
                    job = JOB_ID,
                    code = %err.code(),
                    error = %err,
                    context = ?err.context(),
                );
                false
            }
        }
    }

    pub async fn execute(&self) -> AppResult<MigrationSummary> {
        let options = self.options.clone().normalized()?;
        info!(
            target: LOG_TARGET,
            event = "job_started",
            job = JOB_ID,
            storage = %self.storage.name(),
            scan_pattern = %options.scan_pattern,
        );
        ensure_work_tables(&self.pool).await?;

        let staging = StagingStore::new(self.pool.clone());
        let inventory = InventoryBuilder::new(
            staging.clone(),
            options.scan_batch_size,
            options.max_in_flight_batches,
        )
        .build(self.storage.scan_files(&options.scan_pattern)?)
        .await?;

        let mut summary = MigrationSummary {
            files_scanned: inventory.scanned,
            files_staged: inventory.staged,
            ..Default::default()
        };

        let model_page_size = options.model_page_size;
        let max_passes = options.max_passes;
        let reconciler = Reconciler::new(
            staging,
            ProgressLedger::new(self.pool.clone()),
            Arc::clone(&self.registry),
            Arc::clone(&self.resolver),
            self.storage.name(),
            options,
        );

        let mut skipped: HashSet<ModelRef> = HashSet::new();
        let mut pass: u32 = 0;
        loop {
            let candidates: Vec<ModelRef> = list_incomplete_models(&self.pool, model_page_size)
                .await?
                .into_iter()
                .filter(|model| !skipped.contains(model))
                .collect();
            if candidates.is_empty() {
                info!(
                    target: LOG_TARGET,
                    event = "job_reconciled",
                    job = JOB_ID,
                    passes = summary.passes,
                );
                return Ok(summary);
            }
            if pass == max_passes {
                return Err(AppError::new(
                    "MIGRATION/PASS_LIMIT",
                    "Attachment models kept appearing after the maximum number of passes.",
                )
                .with_context("max_passes", max_passes.to_string())
                .with_context("remaining_models", candidates.len().to_string()));
            }

            pass += 1;
            summary.passes = pass;
            info!(
                target: LOG_TARGET,
                event = "pass_started",
                job = JOB_ID,
                pass,
                models = candidates.len(),
            );
            for model in candidates {
                match reconciler.process_model(&model).await? {
                    ModelOutcome::Completed(stats) => {
                        summary.models_completed += 1;
                        summary.stats += stats;
                    }
                    ModelOutcome::Skipped(_) => {
                        summary.models_skipped += 1;
                        skipped.insert(model);
                    }
                }
            }
        }
    }
}
