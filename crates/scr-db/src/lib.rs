//! Transactional store layer: result cache + job queue + refresh
//! bookkeeping. Every operation is its own statement or transaction; the
//! one exception is `claim_next_pending_job`, a single `WITH ... FOR UPDATE
//! SKIP LOCKED` statement so N workers can claim N distinct jobs without
//! blocking each other and without double-claiming.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use scr_schemas::{
    Confidence, EntityType, JobReason, JobStatus, ManualOverride, ReasonForCheck, RiskLevel, ScreenedEntity,
    ScreeningJob, ScreeningResult, ScreeningStatus, Transition,
};

pub const ENV_DB_URL: &str = "SCR_DATABASE_URL";

/// Connect to Postgres using `SCR_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new().max_connections(10).connect(&url).await.context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await.context("db migrate failed")?;
    Ok(())
}

/// Test helper: connect using `SCR_DATABASE_URL` and ensure migrations are
/// applied. Used by the `#[ignore]`-gated scenario tests under `tests/`.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Connectivity + schema-presence check for `scr-cli db status`.
pub struct DbStatus {
    pub ok: bool,
    pub has_screened_entities_table: bool,
}

pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1").fetch_one(pool).await.context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from information_schema.tables
            where table_schema = 'public' and table_name = 'screened_entities'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-presence query failed")?;

    Ok(DbStatus { ok, has_screened_entities_table: exists })
}

fn enum_to_db<T: Serialize>(v: &T) -> Result<String> {
    match serde_json::to_value(v).context("serialize enum")? {
        Value::String(s) => Ok(s),
        other => anyhow::bail!("expected a string-serializable enum, got {other}"),
    }
}

fn enum_from_db<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(Value::String(s.to_string())).with_context(|| format!("parse db enum value: {s}"))
}

fn opt_enum_to_db<T: Serialize>(v: &Option<T>) -> Result<Option<String>> {
    v.as_ref().map(enum_to_db).transpose()
}

fn opt_enum_from_db<T: DeserializeOwned>(s: &Option<String>) -> Result<Option<T>> {
    s.as_deref().map(enum_from_db).transpose()
}

fn row_to_screened_entity(row: &sqlx::postgres::PgRow) -> Result<ScreenedEntity> {
    let result_json: Value = row.try_get("result_json")?;
    Ok(ScreenedEntity {
        entity_key: row.try_get("entity_key")?,
        display_name: row.try_get("display_name")?,
        normalized_name: row.try_get("normalized_name")?,
        date_of_birth: row.try_get("date_of_birth")?,
        entity_type: enum_from_db(&row.try_get::<String, _>("entity_type")?)?,
        last_screened_at: row.try_get("last_screened_at")?,
        screening_valid_until: row.try_get("screening_valid_until")?,
        status: enum_from_db(&row.try_get::<String, _>("status")?)?,
        risk_level: enum_from_db(&row.try_get::<String, _>("risk_level")?)?,
        confidence: enum_from_db(&row.try_get::<String, _>("confidence")?)?,
        score: row.try_get("score")?,
        uk_sanctions_flag: row.try_get("uk_sanctions_flag")?,
        pep_flag: row.try_get("pep_flag")?,
        result_json: serde_json::from_value(result_json).context("parse result_json")?,
        last_requestor: row.try_get("last_requestor")?,
        business_reference: row.try_get("business_reference")?,
        reason_for_check: opt_enum_from_db(&row.try_get::<Option<String>, _>("reason_for_check")?)?,
        screened_against_uk_hash: row.try_get("screened_against_uk_hash")?,
        screened_against_refresh_run_id: row.try_get("screened_against_refresh_run_id")?,
        manual_override_uk_hash: row.try_get("manual_override_uk_hash")?,
        manual_override_stale: row.try_get("manual_override_stale")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_screening_job(row: &sqlx::postgres::PgRow) -> Result<ScreeningJob> {
    Ok(ScreeningJob {
        job_id: row.try_get("job_id")?,
        entity_key: row.try_get("entity_key")?,
        name: row.try_get("name")?,
        date_of_birth: row.try_get("date_of_birth")?,
        entity_type: enum_from_db(&row.try_get::<String, _>("entity_type")?)?,
        requestor: row.try_get("requestor")?,
        business_reference: row.try_get("business_reference")?,
        reason_for_check: opt_enum_from_db(&row.try_get::<Option<String>, _>("reason_for_check")?)?,
        reason: enum_from_db(&row.try_get::<String, _>("reason")?)?,
        refresh_run_id: row.try_get("refresh_run_id")?,
        force_rescreen: row.try_get("force_rescreen")?,
        status: enum_from_db(&row.try_get::<String, _>("status")?)?,
        previous_status: opt_enum_from_db(&row.try_get::<Option<String>, _>("previous_status")?)?,
        result_status: opt_enum_from_db(&row.try_get::<Option<String>, _>("result_status")?)?,
        transition: opt_enum_from_db(&row.try_get::<Option<String>, _>("transition")?)?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error_message: row.try_get("error_message")?,
    })
}

const SCREENED_ENTITY_COLUMNS: &str = r#"
    entity_key, display_name, normalized_name, date_of_birth, entity_type,
    last_screened_at, screening_valid_until, status, risk_level, confidence,
    score, uk_sanctions_flag, pep_flag, result_json, last_requestor,
    business_reference, reason_for_check, screened_against_uk_hash,
    screened_against_refresh_run_id, manual_override_uk_hash,
    manual_override_stale, updated_at
"#;

const SCREENING_JOB_COLUMNS: &str = r#"
    job_id, entity_key, name, date_of_birth, entity_type, requestor,
    business_reference, reason_for_check, reason, refresh_run_id,
    force_rescreen, status, previous_status, result_status, transition,
    created_at, started_at, finished_at, error_message
"#;

/// `get_valid_screening(entity_key)`: the cache row iff the validity window
/// holds and no manual override has gone stale.
pub async fn get_valid_screening(pool: &PgPool, entity_key: &str) -> Result<Option<ScreenedEntity>> {
    let row = sqlx::query(&format!(
        "select {SCREENED_ENTITY_COLUMNS} from screened_entities
         where entity_key = $1 and screening_valid_until > now() and manual_override_stale = false"
    ))
    .bind(entity_key)
    .fetch_optional(pool)
    .await
    .context("get_valid_screening failed")?;

    row.as_ref().map(row_to_screened_entity).transpose()
}

/// The cache row regardless of validity window or override staleness, for
/// callers that need `previous_status` (spec.md §4.6 transition derivation)
/// rather than a usable verdict.
pub async fn get_screened_entity_any(pool: &PgPool, entity_key: &str) -> Result<Option<ScreenedEntity>> {
    let row = sqlx::query(&format!("select {SCREENED_ENTITY_COLUMNS} from screened_entities where entity_key = $1"))
        .bind(entity_key)
        .fetch_optional(pool)
        .await
        .context("get_screened_entity_any failed")?;

    row.as_ref().map(row_to_screened_entity).transpose()
}

/// Fields needed to write or overwrite a cache row. Does not include
/// `updated_at` (server-assigned) or the manual-override columns, which
/// `upsert_screening` always clears.
pub struct UpsertScreening<'a> {
    pub entity_key: &'a str,
    pub display_name: &'a str,
    pub normalized_name: &'a str,
    pub date_of_birth: Option<NaiveDate>,
    pub entity_type: EntityType,
    pub last_screened_at: DateTime<Utc>,
    pub screening_valid_until: DateTime<Utc>,
    pub result: &'a ScreeningResult,
    pub requestor: &'a str,
    pub business_reference: Option<&'a str>,
    pub reason_for_check: Option<ReasonForCheck>,
    pub refresh_run_id: Option<Uuid>,
    pub uk_hash: Option<&'a str>,
}

/// `upsert_screening`: writes/overwrites the cache row, resets the validity
/// window, and clears any manual-override staleness from a prior verdict.
pub async fn upsert_screening(pool: &PgPool, args: &UpsertScreening<'_>) -> Result<()> {
    let status = enum_to_db(&args.result.status)?;
    let risk_level = enum_to_db(&args.result.risk_level)?;
    let confidence = enum_to_db(&args.result.confidence)?;
    let entity_type = enum_to_db(&args.entity_type)?;
    let reason_for_check = opt_enum_to_db(&args.reason_for_check)?;
    let result_json = serde_json::to_value(args.result).context("serialize ScreeningResult")?;

    sqlx::query(
        r#"
        insert into screened_entities (
            entity_key, display_name, normalized_name, date_of_birth, entity_type,
            last_screened_at, screening_valid_until, status, risk_level, confidence,
            score, uk_sanctions_flag, pep_flag, result_json, last_requestor,
            business_reference, reason_for_check, screened_against_uk_hash,
            screened_against_refresh_run_id, manual_override_uk_hash,
            manual_override_stale, updated_at
        ) values (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
            $16, $17, $18, $19, null, false, now()
        )
        on conflict (entity_key) do update set
            display_name = excluded.display_name,
            normalized_name = excluded.normalized_name,
            date_of_birth = excluded.date_of_birth,
            entity_type = excluded.entity_type,
            last_screened_at = excluded.last_screened_at,
            screening_valid_until = excluded.screening_valid_until,
            status = excluded.status,
            risk_level = excluded.risk_level,
            confidence = excluded.confidence,
            score = excluded.score,
            uk_sanctions_flag = excluded.uk_sanctions_flag,
            pep_flag = excluded.pep_flag,
            result_json = excluded.result_json,
            last_requestor = excluded.last_requestor,
            business_reference = excluded.business_reference,
            reason_for_check = excluded.reason_for_check,
            screened_against_uk_hash = excluded.screened_against_uk_hash,
            screened_against_refresh_run_id = excluded.screened_against_refresh_run_id,
            manual_override_uk_hash = null,
            manual_override_stale = false,
            updated_at = now()
        "#,
    )
    .bind(args.entity_key)
    .bind(args.display_name)
    .bind(args.normalized_name)
    .bind(args.date_of_birth)
    .bind(&entity_type)
    .bind(args.last_screened_at)
    .bind(args.screening_valid_until)
    .bind(&status)
    .bind(&risk_level)
    .bind(&confidence)
    .bind(args.result.score)
    .bind(args.result.is_sanctioned)
    .bind(args.result.is_pep)
    .bind(&result_json)
    .bind(args.requestor)
    .bind(args.business_reference)
    .bind(&reason_for_check)
    .bind(args.uk_hash)
    .bind(args.refresh_run_id)
    .execute(pool)
    .await
    .context("upsert_screening failed")?;

    Ok(())
}

/// `update_cached_screening_metadata`: refreshes request metadata on a
/// reused row without touching the verdict or validity window.
pub async fn update_cached_screening_metadata(
    pool: &PgPool,
    entity_key: &str,
    requestor: &str,
    business_reference: Option<&str>,
    reason_for_check: Option<ReasonForCheck>,
) -> Result<()> {
    let reason_for_check = opt_enum_to_db(&reason_for_check)?;
    sqlx::query(
        r#"
        update screened_entities
        set last_requestor = $2, business_reference = $3, reason_for_check = $4, updated_at = now()
        where entity_key = $1
        "#,
    )
    .bind(entity_key)
    .bind(requestor)
    .bind(business_reference)
    .bind(&reason_for_check)
    .execute(pool)
    .await
    .context("update_cached_screening_metadata failed")?;
    Ok(())
}

/// `get_pending_running_count`: cheap count used for load shedding.
pub async fn get_pending_running_count(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("select count(*)::bigint from screening_jobs where status in ('pending', 'running')")
        .fetch_one(pool)
        .await
        .context("get_pending_running_count failed")?;
    Ok(n)
}

/// `has_pending_or_running_job`: boolean predicate.
pub async fn has_pending_or_running_job(pool: &PgPool, entity_key: &str) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        "select exists(select 1 from screening_jobs where entity_key = $1 and status in ('pending', 'running'))",
    )
    .bind(entity_key)
    .fetch_one(pool)
    .await
    .context("has_pending_or_running_job failed")?;
    Ok(exists)
}

/// Fields needed to enqueue a new job.
pub struct NewJob<'a> {
    pub entity_key: &'a str,
    pub name: &'a str,
    pub date_of_birth: Option<NaiveDate>,
    pub entity_type: EntityType,
    pub requestor: &'a str,
    pub business_reference: Option<&'a str>,
    pub reason_for_check: Option<ReasonForCheck>,
    pub reason: JobReason,
    pub refresh_run_id: Option<Uuid>,
    pub force_rescreen: bool,
}

/// `enqueue_job`: inserts a `pending` row, returns `job_id`. If a
/// concurrent dispatcher already enqueued for the same entity (the
/// `uq_screening_jobs_entity_active` race spec.md §5 tolerates), returns the
/// existing pending/running job's id instead of erroring.
pub async fn enqueue_job(pool: &PgPool, args: &NewJob<'_>) -> Result<Uuid> {
    let job_id = Uuid::new_v4();
    let entity_type = enum_to_db(&args.entity_type)?;
    let reason_for_check = opt_enum_to_db(&args.reason_for_check)?;
    let reason = enum_to_db(&args.reason)?;

    let result = sqlx::query(&format!(
        r#"
        insert into screening_jobs ({SCREENING_JOB_COLUMNS})
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'pending', null, null, null, now(), null, null, null)
        "#
    ))
    .bind(job_id)
    .bind(args.entity_key)
    .bind(args.name)
    .bind(args.date_of_birth)
    .bind(&entity_type)
    .bind(args.requestor)
    .bind(args.business_reference)
    .bind(&reason_for_check)
    .bind(&reason)
    .bind(args.refresh_run_id)
    .bind(args.force_rescreen)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(job_id),
        Err(sqlx::Error::Database(db_err)) if db_err.constraint() == Some("uq_screening_jobs_entity_active") => {
            let (existing,): (Uuid,) = sqlx::query_as(
                "select job_id from screening_jobs where entity_key = $1 and status in ('pending', 'running')
                 order by created_at asc limit 1",
            )
            .bind(args.entity_key)
            .fetch_one(pool)
            .await
            .context("enqueue_job race: lookup existing job failed")?;
            Ok(existing)
        }
        Err(e) => Err(anyhow::Error::new(e).context("enqueue_job failed")),
    }
}

/// `claim_next_pending_job`: atomically selects the oldest pending row,
/// moves it to `running`, sets `started_at`, using `FOR UPDATE SKIP LOCKED`
/// so N workers claim N distinct jobs without blocking each other.
pub async fn claim_next_pending_job(pool: &PgPool) -> Result<Option<ScreeningJob>> {
    let row = sqlx::query(&format!(
        r#"
        with to_claim as (
            select job_id
            from screening_jobs
            where status = 'pending'
            order by created_at asc
            limit 1
            for update skip locked
        )
        update screening_jobs
        set status = 'running', started_at = now()
        where job_id in (select job_id from to_claim)
        returning {SCREENING_JOB_COLUMNS}
        "#
    ))
    .fetch_optional(pool)
    .await
    .context("claim_next_pending_job failed")?;

    row.as_ref().map(row_to_screening_job).transpose()
}

/// `complete_job`: marks a running job completed and stamps the verdict
/// transition computed by the caller.
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    previous_status: Option<ScreeningStatus>,
    result_status: ScreeningStatus,
    transition: Transition,
) -> Result<()> {
    let previous_status = opt_enum_to_db(&previous_status)?;
    let result_status = enum_to_db(&result_status)?;
    let transition = enum_to_db(&transition)?;

    sqlx::query(
        r#"
        update screening_jobs
        set status = 'completed', previous_status = $2, result_status = $3, transition = $4, finished_at = now()
        where job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(&previous_status)
    .bind(&result_status)
    .bind(&transition)
    .execute(pool)
    .await
    .context("complete_job failed")?;
    Ok(())
}

/// `fail_job`: marks a running job failed with an operator-facing message.
pub async fn fail_job(pool: &PgPool, job_id: Uuid, error_message: &str) -> Result<()> {
    sqlx::query("update screening_jobs set status = 'failed', finished_at = now(), error_message = $2 where job_id = $1")
        .bind(job_id)
        .bind(error_message)
        .execute(pool)
        .await
        .context("fail_job failed")?;
    Ok(())
}

/// `mark_false_positive`: overwrites the cache verdict with a
/// Cleared-False-Positive block, recording an audit sub-object inside
/// `result_json` and stamping `manual_override_uk_hash` with the caller's
/// view of the current UK-subset hash.
pub async fn mark_false_positive(
    pool: &PgPool,
    entity_key: &str,
    actor: &str,
    reason: Option<&str>,
    current_uk_hash: Option<&str>,
) -> Result<()> {
    let row = sqlx::query(&format!("select {SCREENED_ENTITY_COLUMNS} from screened_entities where entity_key = $1"))
        .bind(entity_key)
        .fetch_optional(pool)
        .await
        .context("mark_false_positive: lookup failed")?
        .ok_or_else(|| anyhow::anyhow!("mark_false_positive: no cache row for entity_key {entity_key}"))?;

    let mut entity = row_to_screened_entity(&row)?;

    let override_block = ManualOverride {
        actor: actor.to_string(),
        reason: reason.map(str::to_string),
        overridden_at: Utc::now(),
        previous_status: entity.result_json.status,
        previous_risk_level: entity.result_json.risk_level,
        previous_score: entity.result_json.score,
        previous_sanctions_name: entity.result_json.sanctions_name.clone(),
    };

    entity.result_json.status = ScreeningStatus::ClearedFalsePositive;
    entity.result_json.risk_level = RiskLevel::Cleared;
    entity.result_json.confidence = Confidence::ManualReview;
    entity.result_json.manual_override = Some(override_block);

    let status = enum_to_db(&entity.result_json.status)?;
    let risk_level = enum_to_db(&entity.result_json.risk_level)?;
    let confidence = enum_to_db(&entity.result_json.confidence)?;
    let result_json = serde_json::to_value(&entity.result_json).context("serialize overridden result")?;

    sqlx::query(
        r#"
        update screened_entities
        set status = $2, risk_level = $3, confidence = $4, result_json = $5,
            manual_override_uk_hash = $6, manual_override_stale = false, updated_at = now()
        where entity_key = $1
        "#,
    )
    .bind(entity_key)
    .bind(&status)
    .bind(&risk_level)
    .bind(&confidence)
    .bind(&result_json)
    .bind(current_uk_hash)
    .execute(pool)
    .await
    .context("mark_false_positive: update failed")?;

    Ok(())
}

/// `mark_manual_overrides_stale`: flags every row whose
/// `manual_override_uk_hash` is non-null and differs from `latest_uk_hash`.
/// Returns the number of rows flagged.
pub async fn mark_manual_overrides_stale(pool: &PgPool, latest_uk_hash: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        update screened_entities
        set manual_override_stale = true, updated_at = now()
        where manual_override_uk_hash is not null and manual_override_uk_hash <> $1
        "#,
    )
    .bind(latest_uk_hash)
    .execute(pool)
    .await
    .context("mark_manual_overrides_stale failed")?;
    Ok(result.rows_affected())
}

/// One fingerprinted UK-subset entry to persist against a refresh run.
pub struct UkSnapshotEntryInsert<'a> {
    pub fingerprint: &'a str,
    pub entity_id: Option<&'a str>,
    pub name_norm: &'a str,
    pub birth_date: Option<&'a str>,
    pub dataset: &'a str,
    pub regime: &'a str,
}

/// `replace_uk_snapshot_entries`: persists this refresh run's UK-subset
/// fingerprint entries, used by the next refresh's delta computation.
pub async fn replace_uk_snapshot_entries(pool: &PgPool, refresh_run_id: Uuid, entries: &[UkSnapshotEntryInsert<'_>]) -> Result<()> {
    let mut tx = pool.begin().await.context("replace_uk_snapshot_entries: begin tx")?;

    for e in entries {
        sqlx::query(
            r#"
            insert into watchlist_uk_snapshot_entries (refresh_run_id, fingerprint, entity_id, name_norm, birth_date, dataset, regime)
            values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (refresh_run_id, fingerprint) do nothing
            "#,
        )
        .bind(refresh_run_id)
        .bind(e.fingerprint)
        .bind(e.entity_id)
        .bind(e.name_norm)
        .bind(e.birth_date)
        .bind(e.dataset)
        .bind(e.regime)
        .execute(&mut *tx)
        .await
        .context("replace_uk_snapshot_entries: insert failed")?;
    }

    tx.commit().await.context("replace_uk_snapshot_entries: commit tx")?;
    Ok(())
}

/// Cache rows whose `screened_against_uk_hash` is not the given hash: part
/// (a) of the refresh sweep's candidate shortlist (spec.md §4.7 step 7).
pub async fn screened_entities_with_stale_uk_hash(pool: &PgPool, new_uk_hash: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("select entity_key from screened_entities where screened_against_uk_hash is distinct from $1")
        .bind(new_uk_hash)
        .fetch_all(pool)
        .await
        .context("screened_entities_with_stale_uk_hash failed")?;
    Ok(rows.into_iter().map(|(k,)| k).collect())
}

/// `shortlist_screened_entities_by_terms`: entity keys of cached rows whose
/// normalized name contains any of `terms`. Used by the refresh sweep to
/// find candidates worth rescreening for a UK-subset delta.
pub async fn shortlist_screened_entities_by_terms(pool: &PgPool, terms: &[String]) -> Result<Vec<String>> {
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let mut keys = std::collections::BTreeSet::new();
    for term in terms {
        if term.trim().is_empty() {
            continue;
        }
        let pattern = format!("%{term}%");
        let rows: Vec<(String,)> =
            sqlx::query_as("select entity_key from screened_entities where normalized_name like $1")
                .bind(&pattern)
                .fetch_all(pool)
                .await
                .context("shortlist_screened_entities_by_terms failed")?;
        keys.extend(rows.into_iter().map(|(k,)| k));
    }
    Ok(keys.into_iter().collect())
}

/// `purge_screened_entities_older_than`: retention sweep over cache rows.
/// Returns the number of rows deleted.
pub async fn purge_screened_entities_older_than(pool: &PgPool, months: i64) -> Result<u64> {
    let result = sqlx::query("delete from screened_entities where updated_at < now() - make_interval(months => $1::int)")
        .bind(months as i32)
        .execute(pool)
        .await
        .context("purge_screened_entities_older_than failed")?;
    Ok(result.rows_affected())
}

/// `purge_terminal_jobs_older_than`: retention sweep over completed/failed
/// jobs. Returns the number of rows deleted.
pub async fn purge_terminal_jobs_older_than(pool: &PgPool, days: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        delete from screening_jobs
        where status in ('completed', 'failed') and finished_at < now() - make_interval(days => $1::int)
        "#,
    )
    .bind(days as i32)
    .execute(pool)
    .await
    .context("purge_terminal_jobs_older_than failed")?;
    Ok(result.rows_affected())
}

/// `get_job_status`: fetch a single job row by id.
pub async fn get_job_status(pool: &PgPool, job_id: Uuid) -> Result<Option<ScreeningJob>> {
    let row = sqlx::query(&format!("select {SCREENING_JOB_COLUMNS} from screening_jobs where job_id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("get_job_status failed")?;
    row.as_ref().map(row_to_screening_job).transpose()
}

/// `list_screening_jobs`: operator-facing job listing, optionally filtered
/// by status, newest first.
pub async fn list_screening_jobs(pool: &PgPool, status_filter: Option<JobStatus>, limit: i64) -> Result<Vec<ScreeningJob>> {
    let rows = match status_filter {
        Some(status) => {
            let status = enum_to_db(&status)?;
            sqlx::query(&format!(
                "select {SCREENING_JOB_COLUMNS} from screening_jobs where status = $1 order by created_at desc limit $2"
            ))
            .bind(&status)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query(&format!("select {SCREENING_JOB_COLUMNS} from screening_jobs order by created_at desc limit $1"))
                .bind(limit)
                .fetch_all(pool)
                .await
        }
    }
    .context("list_screening_jobs failed")?;

    rows.iter().map(row_to_screening_job).collect()
}

/// Jobs stuck in `running` with no terminal transition, surfaced for
/// `scr-cli db stuck-jobs` manual operator intervention (SPEC_FULL.md §10:
/// no automatic visibility timeout is implemented).
pub async fn list_stuck_running_jobs(pool: &PgPool, older_than_minutes: i64) -> Result<Vec<ScreeningJob>> {
    let rows = sqlx::query(&format!(
        "select {SCREENING_JOB_COLUMNS} from screening_jobs
         where status = 'running' and started_at < now() - make_interval(mins => $1::int)
         order by started_at asc"
    ))
    .bind(older_than_minutes as i32)
    .fetch_all(pool)
    .await
    .context("list_stuck_running_jobs failed")?;
    rows.iter().map(row_to_screening_job).collect()
}

/// `search_screened_entities`: operator-facing cache search by
/// name substring.
pub async fn search_screened_entities(pool: &PgPool, term: &str, limit: i64) -> Result<Vec<ScreenedEntity>> {
    let pattern = format!("%{term}%");
    let rows = sqlx::query(&format!(
        "select {SCREENED_ENTITY_COLUMNS} from screened_entities where normalized_name like $1 order by updated_at desc limit $2"
    ))
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("search_screened_entities failed")?;

    rows.iter().map(row_to_screened_entity).collect()
}

/// Fields needed to record a new refresh run.
pub struct NewRefreshRun {
    pub refresh_run_id: Uuid,
    pub sanctions_rows: i64,
    pub peps_rows: i64,
    pub uk_row_count: i64,
    pub uk_hash: String,
    pub prev_uk_hash: Option<String>,
    pub uk_changed: bool,
}

/// Insert the initial row for a refresh run, before the delta sweep counters
/// (`added`/`removed`/... ) are known.
pub async fn insert_refresh_run(pool: &PgPool, run: &NewRefreshRun) -> Result<()> {
    sqlx::query(
        r#"
        insert into watchlist_refresh_runs (
            refresh_run_id, ran_at, sanctions_rows, peps_rows, uk_row_count, uk_hash, prev_uk_hash, uk_changed
        ) values ($1, now(), $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(run.refresh_run_id)
    .bind(run.sanctions_rows)
    .bind(run.peps_rows)
    .bind(run.uk_row_count)
    .bind(&run.uk_hash)
    .bind(&run.prev_uk_hash)
    .bind(run.uk_changed)
    .execute(pool)
    .await
    .context("insert_refresh_run failed")?;
    Ok(())
}

/// Delta sweep counters, written once the sweep against the prior UK-subset
/// fingerprint has finished.
#[derive(Debug, Clone, Default)]
pub struct RefreshRunTotals {
    pub added: i64,
    pub removed: i64,
    pub changed: i64,
    pub candidate: i64,
    pub queued: i64,
    pub already_pending: i64,
    pub reused: i64,
    pub failed: i64,
}

/// `finalize_refresh_run`: stamps the delta sweep totals and `finalized_at`.
pub async fn finalize_refresh_run(pool: &PgPool, refresh_run_id: Uuid, totals: &RefreshRunTotals) -> Result<()> {
    sqlx::query(
        r#"
        update watchlist_refresh_runs
        set added = $2, removed = $3, changed = $4, candidate = $5, queued = $6,
            already_pending = $7, reused = $8, failed = $9, finalized_at = now()
        where refresh_run_id = $1
        "#,
    )
    .bind(refresh_run_id)
    .bind(totals.added)
    .bind(totals.removed)
    .bind(totals.changed)
    .bind(totals.candidate)
    .bind(totals.queued)
    .bind(totals.already_pending)
    .bind(totals.reused)
    .bind(totals.failed)
    .execute(pool)
    .await
    .context("finalize_refresh_run failed")?;
    Ok(())
}

/// `uk_hash` of the most recently finalized refresh run, the baseline a new
/// refresh compares itself against to decide `uk_changed`.
pub async fn latest_finalized_uk_hash(pool: &PgPool) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        "select uk_hash from watchlist_refresh_runs where finalized_at is not null order by ran_at desc limit 1",
    )
    .fetch_optional(pool)
    .await
    .context("latest_finalized_uk_hash failed")?;
    Ok(row.map(|(h,)| h))
}

/// Fingerprints recorded against the most recent finalized refresh run,
/// used by the next refresh to compute its delta.
pub async fn latest_uk_snapshot_entries(pool: &PgPool) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        select fingerprint, name_norm
        from watchlist_uk_snapshot_entries
        where refresh_run_id = (
            select refresh_run_id from watchlist_refresh_runs
            where finalized_at is not null
            order by ran_at desc limit 1
        )
        "#,
    )
    .fetch_all(pool)
    .await
    .context("latest_uk_snapshot_entries failed")?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trip_preserves_spec_labels() {
        let db_value = enum_to_db(&ScreeningStatus::FailSanctionAndPep).unwrap();
        assert_eq!(db_value, "Fail Sanction & PEP");
        let parsed: ScreeningStatus = enum_from_db(&db_value).unwrap();
        assert_eq!(parsed, ScreeningStatus::FailSanctionAndPep);
    }

    #[test]
    fn opt_enum_round_trip_handles_none() {
        let none: Option<ReasonForCheck> = None;
        assert_eq!(opt_enum_to_db(&none).unwrap(), None);
    }
}
