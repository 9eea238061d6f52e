use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

use crate::staging::StagingStore;
use crate::storage::PathStream;
use crate::{AppError, AppResult, LOG_TARGET};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InventorySummary {
    /// Paths emitted by the scanner, duplicates included.
    pub scanned: u64,
    /// Paths newly written to the staging store by this build.
    pub staged: u64,
}

/// Folds batch outcomes; the first failure wins, later ones are only logged.
#[derive(Default)]
struct BatchOutcomes {
    staged: u64,
    first_error: Option<AppError>,
}

impl BatchOutcomes {
    fn record(&mut self, outcome: AppResult<u64>) {
        match outcome {
            Ok(inserted) => self.staged += inserted,
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    event = "inventory_batch_failed",
                    code = %err.code(),
                    error = %err,
                );
                if self.first_error.is_none() {
                    self.first_error = Some(err);
                }
            }
        }
    }

    fn record_joined(&mut self, joined: Result<AppResult<u64>, JoinError>) {
        self.record(joined.unwrap_or_else(|err| Err(AppError::from(err))));
    }
}

/// Streams a storage scan into the staging store in bounded batches.
pub struct InventoryBuilder {
    staging: StagingStore,
    batch_size: usize,
    max_in_flight: usize,
}

impl InventoryBuilder {
    pub fn new(staging: StagingStore, batch_size: usize, max_in_flight: usize) -> Self {
        Self {
            staging,
            batch_size: batch_size.max(1),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Drain `paths`, staging every path not seen before.
    ///
    /// Batch inserts run in the background while scanning continues, at most
    /// `max_in_flight` at a time. A failed batch does not stop the scan; the
    /// build fails once everything has settled. Batches committed before a
    /// failure stay staged and are skipped by the next build.
    pub async fn build(&self, mut paths: PathStream) -> AppResult<InventorySummary> {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight: JoinSet<AppResult<u64>> = JoinSet::new();
        let mut outcomes = BatchOutcomes::default();
        let mut buffer: Vec<String> = Vec::with_capacity(self.batch_size);
        let mut scanned: u64 = 0;

        while let Some(item) = paths.next().await {
            let path = match item {
                Ok(path) => path,
                Err(err) => {
                    error!(
                        target: LOG_TARGET,
                        event = "inventory_scan_failed",
                        scanned,
                        error = %err,
                    );
                    while let Some(joined) = in_flight.join_next().await {
                        outcomes.record_joined(joined);
                    }
                    return Err(err.with_context("operation", "inventory_scan"));
                }
            };
            buffer.push(path);
            if buffer.len() < self.batch_size {
                continue;
            }

            let batch = std::mem::replace(&mut buffer, Vec::with_capacity(self.batch_size));
            scanned += batch.len() as u64;

            while let Some(joined) = in_flight.try_join_next() {
                outcomes.record_joined(joined);
            }
            if let Err(err) = self.queue_batch(batch, &permits, &mut in_flight).await {
                outcomes.record(Err(err));
            }
            info!(target: LOG_TARGET, event = "inventory_progress", scanned);
        }

        while let Some(joined) = in_flight.join_next().await {
            outcomes.record_joined(joined);
        }

        scanned += buffer.len() as u64;
        if !buffer.is_empty() {
            let fresh = self.fresh_paths(buffer).await?;
            outcomes.staged += self.staging.insert_new(&fresh).await?;
        }
        info!(
            target: LOG_TARGET,
            event = "inventory_complete",
            scanned,
            staged = outcomes.staged,
        );

        match outcomes.first_error {
            Some(err) => Err(err),
            None => Ok(InventorySummary {
                scanned,
                staged: outcomes.staged,
            }),
        }
    }

    /// Dedup `batch` now, then insert it in the background once a slot is free.
    async fn queue_batch(
        &self,
        batch: Vec<String>,
        permits: &Arc<Semaphore>,
        in_flight: &mut JoinSet<AppResult<u64>>,
    ) -> AppResult<()> {
        let fresh = self.fresh_paths(batch).await?;
        if fresh.is_empty() {
            return Ok(());
        }
        let permit = permits.clone().acquire_owned().await.map_err(|err| {
            AppError::new("INVENTORY/SEMAPHORE", err.to_string())
                .with_context("operation", "inventory_queue_batch")
        })?;
        let staging = self.staging.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            staging.insert_new(&fresh).await
        });
        Ok(())
    }

    async fn fresh_paths(&self, mut batch: Vec<String>) -> AppResult<Vec<String>> {
        let existing = self.staging.existing_paths(&batch).await?;
        batch.retain(|path| !existing.contains(path));
        Ok(batch)
    }
}
