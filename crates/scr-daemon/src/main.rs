//! scr-daemon entry point.
//!
//! Thin on purpose: load config, connect the store, load the snapshot,
//! spawn the worker pool and (if feed URLs are configured) the refresh
//! scheduler, then wait for a shutdown signal. No HTTP surface — the six
//! operations are a library boundary (`scr-dispatcher`/`scr-db`/
//! `scr-refresh`), not a server route table, for anyone to wrap.

use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let config = scr_config::EffectiveConfig::from_env().context("load EffectiveConfig")?;
    let (_, config_hash) = config.canonical_hash().context("hash EffectiveConfig")?;
    info!(config_hash, "scr-daemon starting");

    let pool = scr_db::connect_from_env().await.context("connect to database")?;
    scr_db::migrate(&pool).await.context("run migrations")?;

    let initial_snapshot =
        scr_snapshot::read_snapshot_from_disk(std::path::Path::new(&config.snapshot_path)).context("load snapshot from disk")?;
    let snapshot = scr_snapshot::SnapshotHandle::new(initial_snapshot);

    let audit = match &config.audit_log_path {
        Some(path) => {
            info!(audit_log_path = %path, "audit trail enabled");
            Some(scr_audit::open_shared(path, true).context("open audit log")?)
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_count = worker_count_from_env();
    let mut worker_handles = Vec::with_capacity(worker_count);
    for worker_index in 0..worker_count {
        let pool = pool.clone();
        let snapshot = snapshot.clone();
        let config = config.clone();
        let shutdown_rx = shutdown_rx.clone();
        let audit = audit.clone();
        worker_handles.push(tokio::spawn(async move {
            info!(worker_index, "worker task starting");
            match audit {
                Some(audit) => scr_worker::run_worker_loop_audited(pool, snapshot, config, shutdown_rx, audit).await,
                None => scr_worker::run_worker_loop(pool, snapshot, config, shutdown_rx).await,
            }
        }));
    }

    let refresh_handle = spawn_refresh_scheduler(pool.clone(), snapshot.clone(), config.clone(), shutdown_rx.clone(), audit.clone());
    if refresh_handle.is_none() {
        info!("SCR_WATCHLIST_SANCTIONS_URL/SCR_WATCHLIST_PEPS_URL not set; no refresh scheduler started (use `scr-cli refresh` on a cron instead)");
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl_c")?;
    info!("shutdown signal received, stopping workers");
    shutdown_tx.send(true).ok();

    for handle in worker_handles {
        handle.await.ok();
    }
    if let Some(handle) = refresh_handle {
        handle.abort();
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).init();
}

fn worker_count_from_env() -> usize {
    std::env::var("SCR_WORKER_COUNT").ok().and_then(|v| v.parse().ok()).filter(|n: &usize| *n >= 1).unwrap_or(2)
}

/// Spawns the periodic refresh scheduler iff both feed URLs are configured;
/// otherwise refreshes are left to an operator's `scr-cli refresh` cron job.
/// Not a spec.md operation itself — ordinary daemon-lifecycle wiring around
/// the `Refresh` operation `scr-refresh` already implements.
fn spawn_refresh_scheduler(
    pool: sqlx::PgPool,
    snapshot: scr_snapshot::SnapshotHandle,
    config: scr_config::EffectiveConfig,
    mut shutdown: watch::Receiver<bool>,
    audit: Option<scr_audit::SharedAuditWriter>,
) -> Option<tokio::task::JoinHandle<()>> {
    let sanctions_url = std::env::var("SCR_WATCHLIST_SANCTIONS_URL").ok()?;
    let peps_url = std::env::var("SCR_WATCHLIST_PEPS_URL").ok()?;
    let interval_secs: u64 = std::env::var("SCR_REFRESH_INTERVAL_SECONDS").ok().and_then(|v| v.parse().ok()).unwrap_or(3600);

    Some(tokio::spawn(async move {
        let feed = scr_refresh::FeedSource::Http { sanctions_url, peps_url };
        loop {
            if *shutdown.borrow() {
                break;
            }
            let result = match &audit {
                Some(audit) => scr_refresh::run_refresh_audited(&pool, &snapshot, &config, &feed, audit).await,
                None => scr_refresh::run_refresh(&pool, &snapshot, &config, &feed).await,
            };
            match result {
                Ok(summary) => {
                    info!(refresh_run_id = %summary.refresh_run_id, uk_changed = summary.uk_changed, queued = summary.queued, "scheduled refresh completed")
                }
                Err(e) => warn!(error = %e, "scheduled refresh failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                _ = shutdown.changed() => {}
            }
        }
    }))
}
