//! spec.md §8 end-to-end scenario 3: with `queue_threshold=0`, every screen
//! of a novel entity is shed onto the job queue; the job then progresses
//! pending -> running -> completed once a worker claims it.
//!
//! Run:
//!   SCR_DATABASE_URL=... cargo test -p scr-testkit --test scenario_load_shed_enqueue_and_job_lifecycle -- --ignored

use scr_config::EffectiveConfig;
use scr_dispatcher::{ScreenOutcome, ScreeningDispatcher};
use scr_schemas::{EntityType, JobStatus, ScreeningRequest};
use scr_snapshot::SnapshotHandle;
use tempfile::tempdir;

fn test_config(snapshot_path: &std::path::Path) -> EffectiveConfig {
    EffectiveConfig {
        queue_threshold: 0,
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
async fn zero_queue_threshold_sheds_every_screen_onto_the_queue() {
    let pool = scr_testkit::connect_and_migrate().await.expect("connect_and_migrate");
    scr_testkit::clear_all_tables(&pool).await.expect("clear_all_tables");

    let dir = tempdir().expect("tempdir");
    let snapshot = SnapshotHandle::empty();
    let config = test_config(&dir.path().join("snapshot.ndjson"));
    let dispatcher = ScreeningDispatcher::new(pool.clone(), snapshot.clone(), config);

    let req = ScreeningRequest {
        name: "Jane Doe".to_string(),
        dob: None,
        entity_type: EntityType::Person,
        requestor: "carol".to_string(),
        business_reference: Some("BR-2".to_string()),
        reason_for_check: None,
    };

    let outcome = dispatcher.screen(&req).await.expect("screen");
    let ScreenOutcome::Queued { job_id, .. } = outcome else {
        panic!("expected Queued with queue_threshold=0");
    };

    let pending = dispatcher.get_job(job_id).await.expect("get_job").expect("job exists");
    assert_eq!(pending.status, JobStatus::Pending);

    let processed = scr_worker::claim_and_process_one(&pool, &snapshot).await.expect("claim_and_process_one").expect("a job was pending");
    assert_eq!(processed.job_id, job_id);

    let completed = dispatcher.get_job(job_id).await.expect("get_job").expect("job exists");
    assert_eq!(completed.status, JobStatus::Completed);
    assert!(completed.result_status.is_some(), "a completed job carries a result_status");
}
