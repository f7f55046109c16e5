use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use plania_sync::aggregate::ProgressView;
use plania_sync::config;
use plania_sync::db;
use plania_sync::dispatch::{CancelFlag, DispatchEvent, Dispatcher, NoDelay, Pacing, RandomDelay};
use plania_sync::portal::PortalClient;
use plania_sync::model::summary_text;
use plania_sync::reconcile::{self, SlotEdit};
use plania_sync::sync;

#[derive(Debug, Parser)]
#[command(author, version, about = "Reconcile and send PlanIA diary content")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a diary from the PlanIA API into the local store
    Pull {
        #[arg(long)]
        diary: String,
    },
    /// Print a diary in display order
    Show {
        #[arg(long)]
        diary: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Count real classes and anticipations
    Stats {
        #[arg(long)]
        diary: String,
    },
    /// Replace the text of one class slot and push it upstream
    Edit {
        #[arg(long)]
        slot: String,
        #[arg(long)]
        content: String,
        #[arg(long)]
        observations: Option<String>,
    },
    /// Move a slot's text to another position; slot dates and times stay put
    Move {
        #[arg(long)]
        diary: String,
        /// Position as printed by `show`, starting at 1
        #[arg(long)]
        from: usize,
        #[arg(long)]
        to: usize,
    },
    /// Send diary content to the academic system, one class at a time
    Send {
        #[arg(long)]
        diary: String,
        /// Content ids to send, in this order (default: whole diary in display order)
        #[arg(long = "content")]
        contents: Vec<String>,
        /// Skip the pause between classes
        #[arg(long)]
        no_delay: bool,
    },
    /// List previous send runs of a diary
    Runs {
        #[arg(long)]
        diary: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Pull { diary } => {
            let portal = PortalClient::from_config(&cfg)?;
            let report = sync::pull_diary(&pool, &portal, &diary).await?;
            println!(
                "{} stored, {} rejected, {} anticipations without original",
                report.stored, report.rejected, report.orphan_anticipations
            );
        }
        Command::Show { diary, json } => {
            let ordered = sync::load_reconciled(&pool, &diary).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ordered)?);
            } else {
                for (pos, r) in ordered.iter().enumerate() {
                    println!(
                        "{:>3} {:<3}{:<26}{:<14}{}",
                        pos + 1,
                        r.kind.as_str(),
                        r.label(),
                        r.content_id,
                        r.content
                    );
                }
            }
        }
        Command::Stats { diary } => {
            let records = db::list_diary_content(&pool, &diary).await?;
            let stats = reconcile::compute_stats(&records);
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Edit {
            slot,
            content,
            observations,
        } => {
            let Some(stored) = db::get_content(&pool, &slot).await? else {
                bail!("no class slot with id {slot}");
            };
            let edit = SlotEdit {
                slot_id: slot,
                content,
                observations,
            };
            sync::edit_slots(&pool, &stored.diary_id, &[edit]).await?;
            let portal = PortalClient::from_config(&cfg)?;
            if let Err(err) = sync::push_pending_edits(&pool, &portal, &stored.diary_id).await {
                warn!(error = %format!("{err:#}"), "edit saved locally only; it is retried before the next send");
            }
        }
        Command::Move { diary, from, to } => {
            let (Some(from), Some(to)) = (from.checked_sub(1), to.checked_sub(1)) else {
                bail!("positions start at 1");
            };
            let changed = sync::move_slot_content(&pool, &diary, from, to).await?;
            println!("{} slots changed", changed.len());
            let portal = PortalClient::from_config(&cfg)?;
            if let Err(err) = sync::push_pending_edits(&pool, &portal, &diary).await {
                warn!(error = %format!("{err:#}"), "move saved locally only; it is retried before the next send");
            }
        }
        Command::Send {
            diary,
            contents,
            no_delay,
        } => {
            let portal = Arc::new(PortalClient::from_config(&cfg)?);
            sync::push_pending_edits(&pool, portal.as_ref(), &diary).await?;

            let ordered = sync::load_reconciled(&pool, &diary).await?;
            let items = sync::plan_items(&ordered, &contents)?;

            let pacing: Arc<dyn Pacing> = if no_delay {
                Arc::new(NoDelay)
            } else {
                Arc::new(RandomDelay::new(
                    cfg.dispatch.min_delay_ms,
                    cfg.dispatch.max_delay_ms,
                ))
            };
            let dispatcher = Dispatcher::new(portal).with_pacing(pacing);

            let cancel = CancelFlag::default();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current class");
                    ctrl_c.cancel();
                }
            });

            let (tx, mut rx) = mpsc::channel::<DispatchEvent>(32);
            let printer = tokio::spawn(async move {
                let mut view = ProgressView::new();
                while let Some(event) = rx.recv().await {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                    view.apply(&event);
                }
                view
            });

            let result = sync::send_diary(&pool, &dispatcher, &diary, items, &tx, &cancel).await;
            drop(tx);
            let view = printer.await?;
            if let Some((run_id, summary)) = result? {
                info!(%run_id, "run recorded");
                eprintln!("{}", summary.describe());
            } else {
                bail!("send failed: {}", view.message);
            }
        }
        Command::Runs { diary } => {
            for run in db::list_dispatch_runs(&pool, &diary).await? {
                println!(
                    "{}  {}  {} (de {})",
                    run.finished_at,
                    run.id,
                    summary_text(run.succeeded as usize, run.failed as usize),
                    run.total
                );
                for outcome in db::dispatch_results(&pool, &run.id).await? {
                    if !outcome.success {
                        println!(
                            "    {}: {}",
                            outcome.content_id,
                            outcome.message.unwrap_or_default()
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
