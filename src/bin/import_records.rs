use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use plania_sync::config;
use plania_sync::db;
use plania_sync::model::DiaryContentRecord;
use plania_sync::reconcile;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Load a JSON dump of scraped diary content into the local store"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Diary the records belong to
    #[arg(long)]
    diary: String,

    /// JSON array of content records
    #[arg(long)]
    file: PathBuf,

    /// Abort on the first malformed record instead of skipping it
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let raw = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let records: Vec<DiaryContentRecord> =
        serde_json::from_str(&raw).context("dump is not a JSON array of content records")?;

    let mut valid = Vec::with_capacity(records.len());
    for record in records {
        match record.validate() {
            Ok(()) => valid.push(record),
            Err(err) if args.strict => return Err(err.into()),
            Err(err) => warn!(%err, "skipping malformed record"),
        }
    }

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let stored = db::upsert_records(&pool, &args.diary, &valid).await?;

    let stats = reconcile::compute_stats(&valid);
    info!(
        stored,
        real_classes = stats.real_classes,
        anticipations = stats.anticipations,
        orphans = reconcile::find_orphan_anticipations(&valid).len(),
        "import finished"
    );
    Ok(())
}
