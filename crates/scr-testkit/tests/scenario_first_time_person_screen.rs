//! spec.md §8 end-to-end scenario 1: a first-time screen against a snapshot
//! that contains a matching sanctions row.
//!
//! Run:
//!   SCR_DATABASE_URL=... cargo test -p scr-testkit --test scenario_first_time_person_screen -- --ignored

use chrono::Duration;
use scr_config::EffectiveConfig;
use scr_dispatcher::{ScreenOutcome, ScreeningDispatcher};
use scr_schemas::{Confidence, EntityType, ReasonForCheck, RiskLevel, ScreeningRequest, ScreeningStatus};
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
async fn first_time_screen_matches_sanctions_row_and_creates_cache_row() {
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

    let before = chrono::Utc::now();
    let outcome = dispatcher.screen(&req).await.expect("screen");

    let ScreenOutcome::Completed { entity_key, entity } = outcome else {
        panic!("expected a sync Completed outcome, not a reuse or queue");
    };

    assert_eq!(entity.status, ScreeningStatus::FailSanction);
    assert!(entity.result_json.is_sanctioned);
    assert_eq!(entity.risk_level, RiskLevel::HighRisk);
    assert!(matches!(entity.confidence, Confidence::High | Confidence::Medium));

    let expected_valid_until = before + Duration::days(365);
    let drift = (entity.screening_valid_until - expected_valid_until).num_seconds().abs();
    assert!(drift < 60, "screening_valid_until should land ~365 days out, drift was {drift}s");

    let reloaded = scr_db::get_valid_screening(&pool, &entity_key).await.expect("get_valid_screening").expect("cache row exists");
    assert_eq!(reloaded.status, ScreeningStatus::FailSanction);
}
