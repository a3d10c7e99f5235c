//! Fixture builders for the scenario tests under `tests/` in this crate and
//! in `scr-db`/`scr-worker`/`scr-refresh`: sample watchlist CSV content and
//! a helper to clear every table between scenarios. No assertions live
//! here — that's what the scenario test functions are for.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::PgPool;

const CSV_HEADER: &str = "schema,name,aliases,birth_date,program_ids,dataset,sanctions";

/// A small sanctions extract: one UK-subset row for "Vladimir Putin" (used
/// across the first-time-screen / reuse / false-positive / UK-delta
/// scenarios) plus a non-UK OFAC row.
pub fn sample_sanctions_csv() -> String {
    format!(
        "{CSV_HEADER}\n\
         person,Vladimir Putin,,,OFAC-SDN,HMT OFAC Consolidated List,Designated under the Russia (Sanctions) (EU Exit) Regulations\n\
         person,John Smith Sanctioned,,1975-03-02,OFAC-SDN,us_ofac_sdn,Designated under 50 USC 1701\n"
    )
}

/// A small PEP extract: a single politically-exposed person, no overlap
/// with the sanctions fixture.
pub fn sample_peps_csv() -> String {
    format!("{CSV_HEADER}\nperson,Some Official,,,,peps_consolidated,\n")
}

/// A sanctions extract that additionally sanctions "Jane Doe" under the UK
/// subset, for the UK-delta-sweep scenario: run once with
/// [`sample_sanctions_csv`], then again with this one, and a fresh
/// `uk_delta_rescreen` candidate for "Jane Doe" should appear.
pub fn sample_sanctions_csv_with_new_uk_entry() -> String {
    format!(
        "{}{}",
        sample_sanctions_csv(),
        "person,Jane Doe,,,OFAC-SDN,HMT OFAC Consolidated List,Designated under the Russia (Sanctions) (EU Exit) Regulations\n"
    )
}

/// Writes the sanctions/PEP fixtures into `dir` and returns their paths, for
/// feeding a `scr_snapshot::CsvFileSource` or `scr_refresh::FeedSource::Csv`.
pub fn write_fixture_csvs(dir: &Path, sanctions_csv: &str, peps_csv: &str) -> Result<(PathBuf, PathBuf)> {
    let sanctions_path = dir.join("sanctions.csv");
    let peps_path = dir.join("peps.csv");
    std::fs::write(&sanctions_path, sanctions_csv).with_context(|| format!("write {}", sanctions_path.display()))?;
    std::fs::write(&peps_path, peps_csv).with_context(|| format!("write {}", peps_path.display()))?;
    Ok((sanctions_path, peps_path))
}

/// Truncates every screening table. Scenario tests share one Postgres
/// instance (`SCR_DATABASE_URL`), so each test starts from a clean slate
/// rather than assuming isolation the database doesn't provide.
pub async fn clear_all_tables(pool: &PgPool) -> Result<()> {
    sqlx::query("delete from screening_jobs").execute(pool).await.context("clear screening_jobs")?;
    sqlx::query("delete from screened_entities").execute(pool).await.context("clear screened_entities")?;
    sqlx::query("delete from watchlist_uk_snapshot_entries").execute(pool).await.context("clear watchlist_uk_snapshot_entries")?;
    sqlx::query("delete from watchlist_refresh_runs").execute(pool).await.context("clear watchlist_refresh_runs")?;
    Ok(())
}

/// Connects to the scenario-test database and runs migrations, the shared
/// entry point every scenario test starts from.
pub async fn connect_and_migrate() -> Result<PgPool> {
    let pool = scr_db::testkit_db_pool().await.context("connect to SCR_DATABASE_URL")?;
    scr_db::migrate(&pool).await.context("run migrations")?;
    Ok(pool)
}
