//! Runs the composite music ETL once and exits non-zero on failure.
//!
//! This is the whole surface an external scheduler (cron, Airflow) needs:
//! invoke, inspect the exit code, decide whether to re-run. Re-runs are safe
//! because loading is idempotent.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use music_etl::pipeline::LogObserver;
use music_etl::source::HttpSourceReader;
use music_etl::{CompositeEtl, EtlConfig, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "music-etl", about = "Music listening-platform ETL runner")]
struct Args {
    /// Path of the TOML configuration file.
    #[arg(long, default_value = "etl.toml")]
    config: PathBuf,

    /// Override the configured upstream base URL.
    #[arg(long)]
    source_url: Option<String>,

    /// Override the configured destination database path.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Override the configured page size.
    #[arg(long)]
    page_size: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = EtlConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(url) = args.source_url {
        config.source_url = url;
    }
    if let Some(path) = args.database {
        config.database = path;
    }
    if let Some(size) = args.page_size {
        config.page_size = size;
    }

    info!(source = %config.source_url, database = %config.database.display(), "starting ETL run");

    let reader = Arc::new(HttpSourceReader::new(config.source_url));
    let store = Arc::new(SqliteStore::open(&config.database)?);
    let etl = CompositeEtl::standard(reader, store, config.page_size);

    let outcome = etl.run(Arc::new(LogObserver)).await;
    for (pipeline, error) in &outcome.failed {
        tracing::error!(%pipeline, %error, "pipeline failed");
    }
    for pipeline in &outcome.skipped {
        tracing::warn!(%pipeline, "pipeline skipped");
    }

    if outcome.succeeded() {
        Ok(())
    } else {
        anyhow::bail!("ETL run failed")
    }
}
