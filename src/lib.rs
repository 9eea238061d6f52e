//! Reconciles attachment columns against the files present in storage.
//!
//! The job inventories every upload path into a staging table, then walks
//! each attachment-bearing model page by page, flagging staged files as
//! referenced, recording them in the file-reference registry and assigning
//! ids to attachments that lack one. Both phases are idempotent and resume
//! from persisted checkpoints.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub mod attachment;
pub mod catalog;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod inventory;
pub mod job;
pub mod progress;
pub mod reconcile;
pub mod registry;
pub mod schema;
pub mod staging;
pub mod storage;
pub mod time;

pub use error::{AppError, AppResult};
pub use job::{AttachmentMigration, MigrationSummary};

/// Target of every event this crate emits.
pub const LOG_TARGET: &str = "attachment_reconcile";
/// Job identity attached to job-level log events.
pub const JOB_ID: &str = "nc_job_001_attachment";
/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "ATTACHMENT_RECONCILE_LOG";

const DEFAULT_FILTER: &str = "attachment_reconcile=info,sqlx=warn";
const LOG_FILE_PREFIX: &str = "attachment-reconcile.log";

fn env_filter() -> EnvFilter {
    EnvFilter::new(std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into()))
}

/// Install the JSON subscriber on stderr, leaving stdout to callers. Safe
/// to call more than once.
pub fn init_logging() {
    let _ = tracing_log::LogTracer::init();
    let _ = fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .try_init();
}

/// Like [`init_logging`], with an additional daily-rotated file sink in
/// `log_dir`. Keep the returned guard alive until exit so buffered lines
/// are flushed.
pub fn init_logging_with_file(log_dir: &Path) -> AppResult<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .map_err(|err| AppError::from(err).with_context("log_dir", log_dir.display().to_string()))?;
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let _ = tracing_log::LogTracer::init();
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339());
    let file = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_ansi(false)
        .with_writer(writer);
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr)
        .with(file)
        .try_init();
    Ok(guard)
}
