//! spec.md §8 end-to-end scenario 6: a refresh whose UK subset changes
//! re-screens a previously cleared-false-positive entity, undoing the
//! override when the entity is still genuinely sanctioned.
//!
//! Run:
//!   SCR_DATABASE_URL=... cargo test -p scr-testkit --test scenario_uk_delta_sweep_rescreens_override -- --ignored

use scr_config::EffectiveConfig;
use scr_dispatcher::{ScreenOutcome, ScreeningDispatcher};
use scr_refresh::FeedSource;
use scr_schemas::{EntityType, ReasonForCheck, ScreeningRequest, ScreeningStatus, Transition};
use scr_snapshot::SnapshotHandle;
use tempfile::tempdir;

fn test_config(snapshot_path: &std::path::Path) -> EffectiveConfig {
    EffectiveConfig {
        queue_threshold: 100,
        worker_poll_interval_seconds: 2,
        worker_cleanup_every_n_loops: 50,
        jobs_retention_days: 7,
        screened_entities_retention_months: None,
        snapshot_path: snapshot_path.to_string_lossy().to_string(),
        watchlist_sanctions_allowlist: vec!["OFAC".to_string(), "HMT".to_string()],
        audit_log_path: None,
    }
}

#[tokio::test]
#[ignore]
async fn uk_delta_sweep_flags_stale_override_and_requeues_it() {
    let pool = scr_testkit::connect_and_migrate().await.expect("connect_and_migrate");
    scr_testkit::clear_all_tables(&pool).await.expect("clear_all_tables");

    let dir = tempdir().expect("tempdir");
    let config = test_config(&dir.path().join("snapshot.ndjson"));
    let snapshot = SnapshotHandle::empty();

    // Baseline refresh: establishes the initial UK-subset hash.
    let (sanctions_path, peps_path) =
        scr_testkit::write_fixture_csvs(dir.path(), &scr_testkit::sample_sanctions_csv(), &scr_testkit::sample_peps_csv()).expect("write baseline fixtures");
    let baseline_feed = FeedSource::Csv { sanctions_path, peps_path };
    let baseline_summary = scr_refresh::run_refresh(&pool, &snapshot, &config, &baseline_feed).await.expect("baseline refresh");
    assert!(baseline_summary.uk_changed, "the first refresh always reports uk_changed (no prior hash to compare against)");

    // Screen and then manually clear Vladimir Putin, who is sanctioned under
    // the baseline UK subset.
    let dispatcher = ScreeningDispatcher::new(pool.clone(), snapshot.clone(), config.clone());
    let req = ScreeningRequest {
        name: "Vladimir Putin".to_string(),
        dob: None,
        entity_type: EntityType::Person,
        requestor: "alice".to_string(),
        business_reference: Some("BR-1".to_string()),
        reason_for_check: Some(ReasonForCheck::ClientOnboarding),
    };
    let outcome = dispatcher.screen(&req).await.expect("screen");
    let entity_key = match outcome {
        ScreenOutcome::Completed { entity_key, .. } => entity_key,
        other => panic!("expected Completed, got {other:?}"),
    };
    dispatcher.mark_false_positive(&entity_key, "alice", Some("homonym")).await.expect("mark_false_positive");

    // A new refresh whose UK subset gains another entry changes uk_hash,
    // which flags every manual override against the old hash as stale and
    // shortlists Vladimir Putin for a forced re-screen.
    let (sanctions_path_2, peps_path_2) = scr_testkit::write_fixture_csvs(
        dir.path(),
        &scr_testkit::sample_sanctions_csv_with_new_uk_entry(),
        &scr_testkit::sample_peps_csv(),
    )
    .expect("write delta fixtures");
    let delta_feed = FeedSource::Csv { sanctions_path: sanctions_path_2, peps_path: peps_path_2 };
    let delta_summary = scr_refresh::run_refresh(&pool, &snapshot, &config, &delta_feed).await.expect("delta refresh");

    assert!(delta_summary.uk_changed);
    assert!(delta_summary.queued >= 1, "the stale override should be requeued for a forced re-screen");

    let before_reload = scr_db::get_screened_entity_any(&pool, &entity_key).await.expect("get_screened_entity_any").expect("row exists");
    assert!(before_reload.manual_override_stale, "the override should be flagged stale once uk_hash changes");

    let processed = scr_worker::claim_and_process_one(&pool, &snapshot).await.expect("claim_and_process_one").expect("a uk_delta_rescreen job was queued");
    assert_eq!(processed.entity_key, entity_key);

    let reloaded = scr_db::get_screened_entity_any(&pool, &entity_key).await.expect("get_screened_entity_any").expect("row exists");
    assert_ne!(reloaded.status, ScreeningStatus::ClearedFalsePositive, "Putin is still sanctioned, so the override should not survive the re-screen");

    let job = scr_db::get_job_status(&pool, processed.job_id).await.expect("get_job_status").expect("job exists");
    assert_eq!(job.transition, Some(Transition::ClearedToFail));
}
