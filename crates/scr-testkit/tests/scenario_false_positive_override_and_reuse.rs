//! spec.md §8 end-to-end scenario 5: overriding a verdict with
//! `MarkFalsePositive` persists a `Cleared - False Positive` status with an
//! audit block, and a subsequent screen reuses the override.
//!
//! Run:
//!   SCR_DATABASE_URL=... cargo test -p scr-testkit --test scenario_false_positive_override_and_reuse -- --ignored

use scr_config::EffectiveConfig;
use scr_dispatcher::{ScreenOutcome, ScreeningDispatcher};
use scr_schemas::{EntityType, ReasonForCheck, ScreeningRequest, ScreeningStatus};
use scr_snapshot::{build_snapshot, CsvFileSource, SnapshotHandle, WatchlistSource};
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
async fn mark_false_positive_overrides_verdict_and_is_then_reused() {
    let pool = scr_testkit::connect_and_migrate().await.expect("connect_and_migrate");
    scr_testkit::clear_all_tables(&pool).await.expect("clear_all_tables");

    let dir = tempdir().expect("tempdir");
    let (sanctions_path, peps_path) =
        scr_testkit::write_fixture_csvs(dir.path(), &scr_testkit::sample_sanctions_csv(), &scr_testkit::sample_peps_csv()).expect("write fixtures");
    let allowlist = vec!["OFAC".to_string(), "HMT".to_string()];
    let (sanctions_rows, peps_rows) = CsvFileSource { sanctions_path, peps_path }.fetch().expect("fetch csv fixtures");
    let snapshot = SnapshotHandle::new(build_snapshot(sanctions_rows, peps_rows, &allowlist));

    let config = test_config(&dir.path().join("snapshot.ndjson"));
    let dispatcher = ScreeningDispatcher::new(pool.clone(), snapshot, config);

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

    let overridden = dispatcher.mark_false_positive(&entity_key, "alice", Some("homonym")).await.expect("mark_false_positive");
    assert_eq!(overridden.status, ScreeningStatus::ClearedFalsePositive);
    let audit = overridden.result_json.manual_override.as_ref().expect("manual_override audit block present");
    assert_eq!(audit.actor, "alice");
    assert_eq!(audit.reason.as_deref(), Some("homonym"));
    assert_eq!(overridden.manual_override_uk_hash, overridden.screened_against_uk_hash, "manual_override_uk_hash should record the uk_hash this screen ran against");

    let second_outcome = dispatcher.screen(&req).await.expect("second screen reuses the override");
    let ScreenOutcome::Reused { entity, .. } = second_outcome else {
        panic!("expected the false-positive override to be reused on a later screen");
    };
    assert_eq!(entity.status, ScreeningStatus::ClearedFalsePositive);
}
