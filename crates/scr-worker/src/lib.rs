//! The Worker Pool: drains `screening_jobs` with bounded concurrency. Each
//! worker is one `tokio` task running the seven-step loop of spec.md §4.6;
//! safety against double-claiming comes entirely from `scr-db`'s
//! `FOR UPDATE SKIP LOCKED` claim, not from anything in this crate.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use scr_audit::SharedAuditWriter;
use scr_config::{EffectiveConfig, CACHE_VALIDITY_DAYS};
use scr_db::UpsertScreening;
use scr_matcher::MatchQuery;
use scr_normalizer::normalize_text;
use scr_schemas::{ScreeningJob, Transition};
use scr_snapshot::SnapshotHandle;
use sqlx::PgPool;

const MAX_ERROR_MESSAGE_LEN: usize = 1000;

/// What happened to one claimed job. Purely for caller logging/testing;
/// never affects the stored verdict.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// A valid, non-stale cache row already existed and `force_rescreen`
    /// was false: the job was satisfied by reuse.
    Reused { transition: Transition },
    /// The Matcher ran against the current snapshot.
    Matched { transition: Transition },
    /// The job was marked `failed` with a truncated error message.
    Failed { error_message: String },
}

#[derive(Debug, Clone)]
pub struct ProcessedJob {
    pub job_id: Uuid,
    pub entity_key: String,
    pub outcome: JobOutcome,
}

fn truncate_error(err: &anyhow::Error) -> String {
    let s = format!("{err:#}");
    if s.len() > MAX_ERROR_MESSAGE_LEN {
        s.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
    } else {
        s
    }
}

/// Claim one pending job (if any) and drive it to `completed` or `failed`.
/// Returns `Ok(None)` when the queue was empty.
pub async fn claim_and_process_one(pool: &PgPool, snapshot: &SnapshotHandle) -> Result<Option<ProcessedJob>> {
    let job = match scr_db::claim_next_pending_job(pool).await.context("claim_next_pending_job")? {
        Some(j) => j,
        None => return Ok(None),
    };

    let job_id = job.job_id;
    let entity_key = job.entity_key.clone();

    match process_claimed_job(pool, snapshot, &job).await {
        Ok(outcome) => Ok(Some(ProcessedJob { job_id, entity_key, outcome })),
        Err(e) => {
            let message = truncate_error(&e);
            scr_db::fail_job(pool, job_id, &message).await.context("fail_job")?;
            warn!(%job_id, %entity_key, error = %message, "job failed");
            Ok(Some(ProcessedJob { job_id, entity_key, outcome: JobOutcome::Failed { error_message: message } }))
        }
    }
}

/// Steps 3-5 of spec.md §4.6: record `previous_status`, reuse a valid cache
/// row when `force_rescreen` is false, otherwise run the Matcher and upsert.
async fn process_claimed_job(pool: &PgPool, snapshot: &SnapshotHandle, job: &ScreeningJob) -> Result<JobOutcome> {
    let previous = scr_db::get_screened_entity_any(pool, &job.entity_key).await.context("get_screened_entity_any")?;
    let previous_status = previous.as_ref().map(|e| e.result_json.status);

    if !job.force_rescreen {
        if let Some(existing) = scr_db::get_valid_screening(pool, &job.entity_key).await.context("get_valid_screening")? {
            let transition = Transition::derive(previous_status, existing.result_json.status);
            scr_db::complete_job(pool, job.job_id, previous_status, existing.result_json.status, transition)
                .await
                .context("complete_job (reuse)")?;
            return Ok(JobOutcome::Reused { transition });
        }
    } else if let Some(prev) = &previous {
        crate::warn_if_overriding_false_positive(prev);
    }

    let snap = snapshot.current();
    let query = MatchQuery { name: &job.name, dob: job.date_of_birth, entity_type: job.entity_type };
    let result = scr_matcher::screen(&query, &snap);

    let now = Utc::now();
    let valid_until = now + chrono::Duration::days(CACHE_VALIDITY_DAYS);
    let uk_hash = if snap.uk_hash.is_empty() { None } else { Some(snap.uk_hash.as_str()) };

    scr_db::upsert_screening(
        pool,
        &UpsertScreening {
            entity_key: &job.entity_key,
            display_name: &job.name,
            normalized_name: &normalize_text(&job.name),
            date_of_birth: job.date_of_birth,
            entity_type: job.entity_type,
            last_screened_at: now,
            screening_valid_until: valid_until,
            result: &result,
            requestor: &job.requestor,
            business_reference: job.business_reference.as_deref(),
            reason_for_check: job.reason_for_check,
            refresh_run_id: job.refresh_run_id,
            uk_hash,
        },
    )
    .await
    .context("upsert_screening")?;

    let transition = Transition::derive(previous_status, result.status);
    scr_db::complete_job(pool, job.job_id, previous_status, result.status, transition).await.context("complete_job (matched)")?;
    Ok(JobOutcome::Matched { transition })
}

/// Same as [`claim_and_process_one`], but also records a job-lifecycle
/// event in `audit` for whatever outcome was reached. Kept as a separate
/// entry point so callers with no audit trail configured (most tests, and
/// any daemon run with `SCR_AUDIT_LOG_PATH` unset) pay zero cost and don't
/// need a dummy writer.
pub async fn claim_and_process_one_audited(pool: &PgPool, snapshot: &SnapshotHandle, audit: &SharedAuditWriter) -> Result<Option<ProcessedJob>> {
    let processed = claim_and_process_one(pool, snapshot).await?;
    if let Some(p) = &processed {
        record_job_audit_event(audit, p).await;
    }
    Ok(processed)
}

async fn record_job_audit_event(audit: &SharedAuditWriter, processed: &ProcessedJob) {
    let (event_type, payload) = match &processed.outcome {
        JobOutcome::Reused { transition } => {
            ("reused", serde_json::json!({"entity_key": processed.entity_key, "transition": transition.as_str()}))
        }
        JobOutcome::Matched { transition } => {
            ("matched", serde_json::json!({"entity_key": processed.entity_key, "transition": transition.as_str()}))
        }
        JobOutcome::Failed { error_message } => {
            ("failed", serde_json::json!({"entity_key": processed.entity_key, "error_message": error_message}))
        }
    };

    let mut writer = audit.lock().await;
    if let Err(e) = writer.append_job_event(processed.job_id, event_type, payload) {
        error!(job_id = %processed.job_id, error = %e, "failed to append job audit event");
    }
}

fn warn_if_overriding_false_positive(entity: &scr_schemas::ScreenedEntity) {
    if entity.result_json.status == scr_schemas::ScreeningStatus::ClearedFalsePositive {
        warn!(entity_key = %entity.entity_key, "force_rescreen is overriding a manual Cleared - False Positive verdict");
    }
}

/// Every `cleanup_every_n` loops: purge terminal jobs past retention, and
/// screened-entity rows past retention if that sweep is enabled.
async fn run_cleanup(pool: &PgPool, config: &EffectiveConfig) {
    match scr_db::purge_terminal_jobs_older_than(pool, config.jobs_retention_days).await {
        Ok(n) if n > 0 => info!(deleted = n, "purged terminal jobs past retention"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "purge_terminal_jobs_older_than failed"),
    }

    if let Some(months) = config.screened_entities_retention_months {
        match scr_db::purge_screened_entities_older_than(pool, months).await {
            Ok(n) if n > 0 => info!(deleted = n, "purged screened_entities past retention"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "purge_screened_entities_older_than failed"),
        }
    }
}

/// Sleep for `duration` unless `shutdown` flips to `true` first.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

/// The worker loop of spec.md §4.6, as a long-running `tokio` task. Drains
/// the queue as fast as claims succeed; sleeps `poll_interval` only when the
/// queue is empty. Exits cleanly when `shutdown` carries `true`, so
/// `scr-daemon` can stop workers without leaving a job half-claimed.
pub async fn run_worker_loop(pool: PgPool, snapshot: SnapshotHandle, config: EffectiveConfig, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = Duration::from_secs(config.worker_poll_interval_seconds);
    let mut loop_count: u64 = 0;

    info!(poll_interval_secs = config.worker_poll_interval_seconds, "worker loop started");

    while !*shutdown.borrow() {
        match claim_and_process_one(&pool, &snapshot).await {
            Ok(Some(processed)) => {
                info!(job_id = %processed.job_id, entity_key = %processed.entity_key, outcome = ?processed.outcome, "job processed");
            }
            Ok(None) => {
                sleep_or_shutdown(poll_interval, &mut shutdown).await;
            }
            Err(e) => {
                error!(error = %e, "worker loop iteration failed");
                sleep_or_shutdown(poll_interval, &mut shutdown).await;
            }
        }

        loop_count += 1;
        if loop_count >= config.worker_cleanup_every_n_loops {
            loop_count = 0;
            run_cleanup(&pool, &config).await;
        }
    }

    info!("worker loop shut down");
}

/// Same loop as [`run_worker_loop`], claiming jobs via
/// [`claim_and_process_one_audited`] so every outcome is also recorded to
/// `audit`.
pub async fn run_worker_loop_audited(
    pool: PgPool,
    snapshot: SnapshotHandle,
    config: EffectiveConfig,
    mut shutdown: watch::Receiver<bool>,
    audit: SharedAuditWriter,
) {
    let poll_interval = Duration::from_secs(config.worker_poll_interval_seconds);
    let mut loop_count: u64 = 0;

    info!(poll_interval_secs = config.worker_poll_interval_seconds, "worker loop started (audited)");

    while !*shutdown.borrow() {
        match claim_and_process_one_audited(&pool, &snapshot, &audit).await {
            Ok(Some(processed)) => {
                info!(job_id = %processed.job_id, entity_key = %processed.entity_key, outcome = ?processed.outcome, "job processed");
            }
            Ok(None) => {
                sleep_or_shutdown(poll_interval, &mut shutdown).await;
            }
            Err(e) => {
                error!(error = %e, "worker loop iteration failed");
                sleep_or_shutdown(poll_interval, &mut shutdown).await;
            }
        }

        loop_count += 1;
        if loop_count >= config.worker_cleanup_every_n_loops {
            loop_count = 0;
            run_cleanup(&pool, &config).await;
        }
    }

    info!("worker loop shut down");
}
