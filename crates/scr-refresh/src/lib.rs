//! The Watchlist Refresh pipeline and its UK-subset delta sweep: the
//! eight-step procedure of spec.md §4.7 that downloads a new snapshot,
//! publishes it, and decides which cached verdicts need re-screening.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use scr_audit::SharedAuditWriter;
use scr_config::EffectiveConfig;
use scr_db::{NewJob, NewRefreshRun, RefreshRunTotals, UkSnapshotEntryInsert};
use scr_schemas::JobReason;
use scr_snapshot::{build_snapshot, fetch_watchlist_http, write_snapshot_atomic, CsvFileSource, SnapshotHandle, WatchlistSource};

/// Where this refresh obtains the raw sanctions/PEP rows from: a
/// pre-downloaded extract (operator-driven, `scr-cli refresh --from-csv`) or
/// a live network fetch (mirrors the original's `refresh_opensanctions_data`
/// two-URL download).
pub enum FeedSource {
    Csv { sanctions_path: PathBuf, peps_path: PathBuf },
    Http { sanctions_url: String, peps_url: String },
}

async fn fetch(source: &FeedSource) -> Result<(Vec<scr_snapshot::RawRow>, Vec<scr_snapshot::RawRow>)> {
    match source {
        FeedSource::Csv { sanctions_path, peps_path } => {
            let src = CsvFileSource { sanctions_path: sanctions_path.clone(), peps_path: peps_path.clone() };
            src.fetch()
        }
        FeedSource::Http { sanctions_url, peps_url } => fetch_watchlist_http(sanctions_url, peps_url).await,
    }
}

/// What a refresh run decided, returned to the caller for logging/CLI
/// output. Mirrors the `RefreshRun` counters persisted to `scr-db`.
#[derive(Debug, Clone)]
pub struct RefreshSummary {
    pub refresh_run_id: Uuid,
    pub uk_changed: bool,
    pub added: i64,
    pub removed: i64,
    pub changed: i64,
    pub candidate: i64,
    pub queued: i64,
    pub already_pending: i64,
    pub reused: i64,
}

/// The eight-step pipeline of spec.md §4.7, run end to end.
pub async fn run_refresh(pool: &PgPool, snapshot_handle: &SnapshotHandle, config: &EffectiveConfig, feed: &FeedSource) -> Result<RefreshSummary> {
    let refresh_run_id = Uuid::new_v4();

    let prev_uk_hash = scr_db::latest_finalized_uk_hash(pool).await.context("run_refresh: latest_finalized_uk_hash")?;
    let prev_entries = scr_db::latest_uk_snapshot_entries(pool).await.context("run_refresh: latest_uk_snapshot_entries")?;

    let (sanctions_rows, peps_rows) = fetch(feed).await.context("run_refresh: fetch feeds")?;
    let sanctions_rows_count = sanctions_rows.len() as i64;
    let peps_rows_count = peps_rows.len() as i64;

    let new_snapshot = build_snapshot(sanctions_rows, peps_rows, &config.watchlist_sanctions_allowlist);
    write_snapshot_atomic(Path::new(&config.snapshot_path), &new_snapshot).context("run_refresh: write_snapshot_atomic")?;

    let uk_hash = new_snapshot.uk_hash.clone();
    let uk_changed = prev_uk_hash.as_deref() != Some(uk_hash.as_str());

    // Delta against the previous UK entry set, keyed by name_norm (the only
    // stable identity the projected rows carry): a name_norm absent from the
    // previous run is `added`, one absent from this run is `removed`, one
    // present in both with a different fingerprint is `changed`.
    let prev_map: HashMap<String, String> = prev_entries.into_iter().map(|(fingerprint, name_norm)| (name_norm, fingerprint)).collect();
    let fingerprints: Vec<String> = new_snapshot.uk_entries.iter().map(|e| e.fingerprint()).collect();
    let new_map: HashMap<&str, &str> = new_snapshot.uk_entries.iter().zip(fingerprints.iter()).map(|(e, fp)| (e.name_norm.as_str(), fp.as_str())).collect();

    let mut added = 0i64;
    let mut removed = 0i64;
    let mut changed = 0i64;
    let mut changed_or_added_names: Vec<&str> = Vec::new();

    for (name_norm, fingerprint) in &new_map {
        match prev_map.get(*name_norm) {
            None => {
                added += 1;
                changed_or_added_names.push(name_norm);
            }
            Some(prev_fingerprint) if prev_fingerprint != fingerprint => {
                changed += 1;
                changed_or_added_names.push(name_norm);
            }
            _ => {}
        }
    }
    for name_norm in prev_map.keys() {
        if !new_map.contains_key(name_norm.as_str()) {
            removed += 1;
        }
    }

    scr_db::insert_refresh_run(
        pool,
        &NewRefreshRun {
            refresh_run_id,
            sanctions_rows: sanctions_rows_count,
            peps_rows: peps_rows_count,
            uk_row_count: new_snapshot.uk_entries.len() as i64,
            uk_hash: uk_hash.clone(),
            prev_uk_hash: prev_uk_hash.clone(),
            uk_changed,
        },
    )
    .await
    .context("run_refresh: insert_refresh_run")?;

    let entry_inserts: Vec<UkSnapshotEntryInsert> = new_snapshot
        .uk_entries
        .iter()
        .zip(fingerprints.iter())
        .map(|(e, fp)| UkSnapshotEntryInsert {
            fingerprint: fp,
            entity_id: e.entity_id.as_deref(),
            name_norm: &e.name_norm,
            birth_date: e.birth_date.as_deref(),
            dataset: &e.dataset,
            regime: &e.regime,
        })
        .collect();
    scr_db::replace_uk_snapshot_entries(pool, refresh_run_id, &entry_inserts).await.context("run_refresh: replace_uk_snapshot_entries")?;

    scr_db::mark_manual_overrides_stale(pool, &uk_hash).await.context("run_refresh: mark_manual_overrides_stale")?;

    let mut already_pending = 0i64;
    let mut reused = 0i64;
    let mut queued = 0i64;
    let mut candidate_keys: BTreeSet<String> = BTreeSet::new();

    if uk_changed {
        let stale = scr_db::screened_entities_with_stale_uk_hash(pool, &uk_hash).await.context("run_refresh: screened_entities_with_stale_uk_hash")?;
        candidate_keys.extend(stale);

        let mut terms: BTreeSet<String> = BTreeSet::new();
        for name_norm in &changed_or_added_names {
            let (_, tokens) = scr_normalizer::tokenize_for_match(name_norm);
            terms.extend(tokens.into_iter().filter(|t| t.len() >= 4));
        }
        let terms: Vec<String> = terms.into_iter().collect();
        let by_term = scr_db::shortlist_screened_entities_by_terms(pool, &terms).await.context("run_refresh: shortlist_screened_entities_by_terms")?;
        candidate_keys.extend(by_term);

        for entity_key in &candidate_keys {
            if scr_db::has_pending_or_running_job(pool, entity_key).await.context("run_refresh: has_pending_or_running_job")? {
                already_pending += 1;
                continue;
            }
            if scr_db::get_valid_screening(pool, entity_key).await.context("run_refresh: get_valid_screening")?.is_some() {
                reused += 1;
                continue;
            }
            let Some(existing) = scr_db::get_screened_entity_any(pool, entity_key).await.context("run_refresh: get_screened_entity_any")? else {
                continue;
            };
            scr_db::enqueue_job(
                pool,
                &NewJob {
                    entity_key,
                    name: &existing.display_name,
                    date_of_birth: existing.date_of_birth,
                    entity_type: existing.entity_type,
                    requestor: &existing.last_requestor,
                    business_reference: existing.business_reference.as_deref(),
                    reason_for_check: existing.reason_for_check,
                    reason: JobReason::UkDeltaRescreen,
                    refresh_run_id: Some(refresh_run_id),
                    force_rescreen: true,
                },
            )
            .await
            .context("run_refresh: enqueue_job (uk_delta_rescreen)")?;
            queued += 1;
        }
    }

    let candidate = candidate_keys.len() as i64;

    scr_db::finalize_refresh_run(
        pool,
        refresh_run_id,
        &RefreshRunTotals { added, removed, changed, candidate, queued, already_pending, reused, failed: 0 },
    )
    .await
    .context("run_refresh: finalize_refresh_run")?;

    info!(%refresh_run_id, uk_changed, added, removed, changed, candidate, queued, already_pending, reused, "refresh run finalized");

    snapshot_handle.publish(new_snapshot);

    Ok(RefreshSummary { refresh_run_id, uk_changed, added, removed, changed, candidate, queued, already_pending, reused })
}

/// Same as [`run_refresh`], but also records a `refresh_run` summary event
/// in `audit` once the run finalizes.
pub async fn run_refresh_audited(
    pool: &PgPool,
    snapshot_handle: &SnapshotHandle,
    config: &EffectiveConfig,
    feed: &FeedSource,
    audit: &SharedAuditWriter,
) -> Result<RefreshSummary> {
    let summary = run_refresh(pool, snapshot_handle, config, feed).await?;

    let payload = serde_json::json!({
        "uk_changed": summary.uk_changed,
        "added": summary.added,
        "removed": summary.removed,
        "changed": summary.changed,
        "candidate": summary.candidate,
        "queued": summary.queued,
        "already_pending": summary.already_pending,
        "reused": summary.reused,
    });
    let mut writer = audit.lock().await;
    if let Err(e) = writer.append_refresh_run_event(summary.refresh_run_id, payload) {
        error!(refresh_run_id = %summary.refresh_run_id, error = %e, "failed to append refresh_run audit event");
    }
    drop(writer);

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_source_csv_variant_holds_paths() {
        let feed = FeedSource::Csv { sanctions_path: PathBuf::from("a.csv"), peps_path: PathBuf::from("b.csv") };
        match feed {
            FeedSource::Csv { sanctions_path, peps_path } => {
                assert_eq!(sanctions_path, PathBuf::from("a.csv"));
                assert_eq!(peps_path, PathBuf::from("b.csv"));
            }
            FeedSource::Http { .. } => panic!("expected Csv variant"),
        }
    }
}
