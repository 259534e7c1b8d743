use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

mod auth;
mod config;
mod db;
mod error;
mod local;
mod remote;
mod sync;
#[cfg(test)]
mod testing;
mod util;

use local::FsLocalStore;
use remote::HttpRemote;
use sync::SyncEngine;
use sync::events::EventRecorder;

#[derive(Parser)]
#[command(
    name = "treesyncd",
    version,
    long_version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_DATE"), ")"),
    about = "Bidirectional sync between a local folder tree and a cloud store"
)]
struct Cli {
    /// Path to config file [default: ~/.config/treesyncd/config.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync daemon in the foreground (watchers plus workers)
    Start,
    /// Run a single worker cycle and exit
    Worker {
        /// Worker id; 0 takes the global lease
        #[arg(long, default_value_t = 0)]
        id: i64,
    },
    /// Enumerate the remote tree and drain the resulting tasks
    FullSync,
    /// Pull pending remote changes, or reconcile a pushed change payload
    Notify {
        /// JSON change entries to reconcile instead of pulling the feed
        #[arg(long)]
        payload: Option<PathBuf>,
    },
    /// Show queue and mapping status
    Status,
    /// Put every failed task back in the queue
    RetryFailed,
    /// Remove finished tasks older than the given age
    Purge {
        /// Purge failed tasks instead of completed ones
        #[arg(long)]
        failed: bool,
        #[arg(long, default_value_t = 24)]
        older_than_hours: u64,
    },
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "treesyncd=info",
        1 => "treesyncd=debug",
        2 => "treesyncd=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Check inotify watch limits on Linux and warn if they look too low.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(limit) = content.trim().parse::<u64>()
    {
        if limit < 65536 {
            tracing::warn!(
                max_user_watches = limit,
                "inotify watch limit is low, large trees may not be fully watched. \
                 Increase with: echo 524288 | sudo tee {path}"
            );
        } else {
            tracing::debug!(max_user_watches = limit, "inotify watch limit OK");
        }
    }
}

struct Runtime {
    pool: SqlitePool,
    local: Arc<FsLocalStore>,
    remote: Arc<HttpRemote>,
    engine: Arc<SyncEngine>,
}

async fn open_runtime(cfg: &config::Config) -> Result<Runtime> {
    let pool = db::init_db(cfg.general.db_path.as_deref()).await?;

    tokio::fs::create_dir_all(&cfg.local.root)
        .await
        .with_context(|| format!("Failed to create sync root: {}", cfg.local.root.display()))?;
    let local = Arc::new(
        FsLocalStore::open(&cfg.local.root, &cfg.local.hidden_prefix)
            .await
            .with_context(|| format!("Failed to index {}", cfg.local.root.display()))?,
    );

    let token_mgr = Arc::new(auth::TokenManager::new(cfg)?);
    let remote = Arc::new(HttpRemote::new(token_mgr)?);
    let engine = Arc::new(SyncEngine::new(
        pool.clone(),
        cfg,
        local.clone(),
        remote.clone(),
    ));

    Ok(Runtime {
        pool,
        local,
        remote,
        engine,
    })
}

/// Run worker cycles back to back until one asks to wait.
async fn drain_queue(engine: &SyncEngine) -> Result<()> {
    loop {
        let outcome = engine.run_worker(0).await?;
        if !outcome.leased {
            anyhow::bail!("another worker holds the global lease");
        }
        if !outcome.next_run.is_zero() {
            return Ok(());
        }
    }
}

async fn worker_loop(
    engine: Arc<SyncEngine>,
    worker_id: i64,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let delay = match engine.run_worker(worker_id).await {
            Ok(outcome) => outcome.next_run,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "worker cycle failed");
                Duration::from_secs(60)
            }
        };
        if delay.is_zero() {
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {}
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Start => run_daemon(&cfg).await?,
        Command::Worker { id } => {
            let rt = open_runtime(&cfg).await?;
            let outcome = rt.engine.run_worker(id).await?;
            if outcome.leased {
                println!(
                    "completed {}, failed {}, retried {}",
                    outcome.completed, outcome.failed, outcome.retried
                );
            } else {
                println!("lease held by another worker, nothing done");
            }
            rt.pool.close().await;
        }
        Command::FullSync => {
            let rt = open_runtime(&cfg).await?;
            rt.engine.queue().recover_stale().await?;
            rt.engine.start_full_sync().await?;

            tracing::info!("running full sync");
            drain_queue(&rt.engine).await?;

            rt.pool.close().await;
            println!("sync complete");
        }
        Command::Notify { payload } => {
            let rt = open_runtime(&cfg).await?;
            let report = match payload {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    let entries = sync::parse_changes(&content)
                        .with_context(|| format!("Invalid change payload: {}", path.display()))?;
                    rt.engine.reconcile_changes(&entries).await?
                }
                None => rt.engine.notify_change().await?,
            };
            println!(
                "queued {} folder, {} file, {} delete task(s); {} conflict(s), {} ignored",
                report.folders, report.files, report.deletions, report.conflicts, report.ignored
            );
            rt.pool.close().await;
        }
        Command::Status => match db::open_db_readonly(cfg.general.db_path.as_deref()).await? {
            Some(pool) => {
                print_status(&pool, &cfg).await?;
                pool.close().await;
            }
            None => println!("treesyncd has not run yet (no database)"),
        },
        Command::RetryFailed => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let queue = sync::queue::TaskQueue::new(pool.clone(), cfg.queue());
            let n = queue.reset_failed().await?;
            println!("{n} failed task(s) queued again");
            pool.close().await;
        }
        Command::Purge {
            failed,
            older_than_hours,
        } => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let queue = sync::queue::TaskQueue::new(pool.clone(), cfg.queue());
            let age = Duration::from_secs(older_than_hours * 3600);
            let n = if failed {
                queue.purge_failed(age).await?
            } else {
                queue.purge_completed(age).await?
            };
            println!("{n} task(s) removed");
            pool.close().await;
        }
    }

    Ok(())
}

async fn run_daemon(cfg: &config::Config) -> Result<()> {
    check_inotify_limits();

    let rt = open_runtime(cfg).await?;
    let recovered = rt.engine.queue().recover_stale().await?;
    if recovered > 0 {
        tracing::warn!(
            count = recovered,
            "requeued tasks left in progress by a previous run"
        );
    }

    let wake = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    // First run: import what is already on both sides.
    if rt.engine.cursor().await?.is_none() {
        rt.engine.start_full_sync().await?;
    }

    let recorder = Arc::new(
        EventRecorder::new(
            rt.pool.clone(),
            rt.engine.queue().clone(),
            rt.local.clone(),
            cfg.local.hidden_prefix.as_str(),
        )
        .with_wake(wake.clone()),
    );
    let _watcher_handle =
        local::watcher::start_local_watcher(rt.local.clone(), recorder, cfg.local.debounce_ms)?;

    let poller = sync::remote_watcher::start_remote_watcher(
        rt.engine.clone(),
        rt.remote.clone(),
        Duration::from_secs(cfg.remote.longpoll_timeout_secs),
        wake.clone(),
        cancel.clone(),
    );

    let workers: Vec<_> = (0..cfg.general.workers as i64)
        .map(|id| {
            tokio::spawn(worker_loop(
                rt.engine.clone(),
                id,
                wake.clone(),
                cancel.clone(),
            ))
        })
        .collect();
    tracing::info!(workers = workers.len(), "treesyncd daemon ready");

    // SIGTERM handling (for systemd graceful stop)
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
    }
    cancel.cancel();

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "worker task panicked");
        }
    }
    let _ = poller.await;

    tracing::info!("closing database");
    rt.pool.close().await;
    tracing::info!("treesyncd stopped");
    Ok(())
}

/// Print a sync status summary.
async fn print_status(pool: &SqlitePool, cfg: &config::Config) -> Result<()> {
    let queue = sync::queue::TaskQueue::new(pool.clone(), cfg.queue());
    let stats = queue.stats().await?;
    let (folders, files) = sync::state::mapping_counts(pool).await?;

    println!("treesyncd status");
    println!("================");
    println!(
        "Root: {} <-> {}",
        cfg.local.root.display(),
        cfg.remote.root
    );
    println!("Tracked: {folders} folders, {files} files");
    println!(
        "Tasks: {} pending, {} processing, {} completed, {} failed",
        stats.pending, stats.processing, stats.completed, stats.failed
    );

    match sync::state::get_cursor(pool, &cfg.remote.root).await? {
        Some(c) if c.has_more => println!("Cursor: {} (more pages pending)", c.cursor),
        Some(c) => println!("Cursor: {}", c.cursor),
        None => println!("Cursor: not initialized"),
    }

    if stats.failed > 0 {
        println!();
        println!("Recent failures:");
        for task in queue.recent_failures(10).await? {
            println!(
                "  {} (attempts: {}): {}",
                task,
                task.attempts,
                task.error.as_deref().unwrap_or("unknown")
            );
        }
    }

    Ok(())
}
