use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use attachment_reconcile::catalog::sqlite::{ensure_meta_schema, SqliteCatalog};
use attachment_reconcile::config::MigrationOptions;
use attachment_reconcile::db::open_sqlite_pool;
use attachment_reconcile::registry::SqliteRegistry;
use attachment_reconcile::storage::LocalStorage;
use attachment_reconcile::{init_logging, init_logging_with_file, AttachmentMigration, JOB_ID};
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "migrate_attachments",
    about = "Reconcile attachment columns with the files in storage"
)]
struct Cli {
    /// Metadata store (SQLite). Defaults to the per-user data directory.
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Root of the local file store; keys are taken relative to it
    #[arg(long, value_name = "DIR")]
    uploads_root: PathBuf,

    /// JSON file with migration options
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    row_page_size: Option<u32>,

    #[arg(long, value_name = "N")]
    scan_batch_size: Option<usize>,

    /// Maximum concurrent staging inserts
    #[arg(long, value_name = "N")]
    max_in_flight: Option<usize>,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json_summary: bool,

    /// Create the metadata tables when missing
    #[arg(long)]
    init_schema: bool,
}

fn default_db_path() -> Result<PathBuf> {
    let base = match dirs::data_dir() {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    Ok(base.join("attachment-reconcile").join("meta.sqlite3"))
}

fn load_options(cli: &Cli) -> Result<MigrationOptions> {
    let mut options = match &cli.config {
        Some(path) => MigrationOptions::load(path)
            .with_context(|| format!("load options from {}", path.display()))?,
        None => MigrationOptions::default(),
    };
    if let Some(size) = cli.row_page_size {
        options.row_page_size = size;
    }
    if let Some(size) = cli.scan_batch_size {
        options.scan_batch_size = size;
    }
    if let Some(limit) = cli.max_in_flight {
        options.max_in_flight_batches = limit;
    }
    options.normalized().context("validate options")
}

async fn run(cli: Cli) -> Result<bool> {
    let options = load_options(&cli)?;
    let db_path = match cli.db.clone() {
        Some(path) => path,
        None => default_db_path()?,
    };
    let max_connections = u32::try_from(options.max_in_flight_batches + 1).unwrap_or(u32::MAX);
    let pool = open_sqlite_pool(&db_path, cli.init_schema, max_connections)
        .await
        .with_context(|| format!("open {}", db_path.display()))?;
    if cli.init_schema {
        ensure_meta_schema(&pool).await.context("create metadata schema")?;
    }

    let migration = AttachmentMigration::new(
        pool.clone(),
        Arc::new(LocalStorage::new(cli.uploads_root.clone())),
        Arc::new(SqliteCatalog::new(pool.clone())),
        Arc::new(SqliteRegistry::new(pool.clone())),
        options,
    );

    let succeeded = if cli.json_summary {
        match migration.execute().await {
            Ok(summary) => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                true
            }
            Err(err) => {
                tracing::error!(
                    target: attachment_reconcile::LOG_TARGET,
                    event = "job_failed",
                    job = JOB_ID,
                    code = %err.code(),
                    error = %err,
                );
                false
            }
        }
    } else {
        migration.run().await
    };
    pool.close().await;
    Ok(succeeded)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = match cli.log_dir.as_deref() {
        Some(dir) => match init_logging_with_file(dir) {
            Ok(guard) => Some(guard),
            Err(err) => {
                init_logging();
                tracing::warn!(
                    target: attachment_reconcile::LOG_TARGET,
                    event = "file_logging_unavailable",
                    error = %err,
                );
                None
            }
        },
        None => {
            init_logging();
            None
        }
    };

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(
                target: attachment_reconcile::LOG_TARGET,
                event = "startup_failed",
                job = JOB_ID,
                error = %format!("{err:#}"),
            );
            eprintln!("migrate_attachments: {err:#}");
            ExitCode::FAILURE
        }
    }
}
