//! The single choke-point through which every `Screen` request flows:
//! reuse a valid cache row, run the Matcher inline, or shed load onto the
//! job queue. `ScreeningDispatcher` owns the pool/snapshot/config triple so
//! every call site (`scr-cli`, `scr-daemon`, `scr-testkit`) shares the same
//! decision procedure rather than re-deriving it.

use std::fmt;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use scr_audit::SharedAuditWriter;
use scr_config::{EffectiveConfig, CACHE_VALIDITY_DAYS};
use scr_db::{NewJob, UpsertScreening};
use scr_matcher::{parse_query_dob, screen as run_match, MatchQuery};
use scr_normalizer::{derive_entity_key, normalize_text};
use scr_schemas::{JobReason, ScreenedEntity, ScreeningRequest, ScreeningResult};
use scr_snapshot::SnapshotHandle;

/// Validation failures surfaced with a stable machine code (spec.md §7,
/// "Validation"). Never constructed for anything the store layer enforces
/// (`business_reference`, `reason_for_check`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    MissingName,
    MissingRequestor,
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::MissingName => "missing_name",
            DispatchError::MissingRequestor => "missing_requestor",
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::MissingName => write!(f, "VALIDATION({}): name is required", self.code()),
            DispatchError::MissingRequestor => write!(f, "VALIDATION({}): requestor is required", self.code()),
        }
    }
}

impl std::error::Error for DispatchError {}

fn validate(req: &ScreeningRequest) -> Result<(), DispatchError> {
    if req.name.trim().is_empty() {
        return Err(DispatchError::MissingName);
    }
    if req.requestor.trim().is_empty() {
        return Err(DispatchError::MissingRequestor);
    }
    Ok(())
}

/// The three outcomes of spec.md §4.5: reuse always wins over load-shed,
/// load-shed always wins over an inline match. A request is sync or async,
/// never both.
#[derive(Debug, Clone)]
pub enum ScreenOutcome {
    Reused { entity_key: String, entity: ScreenedEntity },
    Completed { entity_key: String, entity: ScreenedEntity },
    Queued { entity_key: String, job_id: Uuid },
}

impl ScreenOutcome {
    pub fn entity_key(&self) -> &str {
        match self {
            ScreenOutcome::Reused { entity_key, .. } => entity_key,
            ScreenOutcome::Completed { entity_key, .. } => entity_key,
            ScreenOutcome::Queued { entity_key, .. } => entity_key,
        }
    }
}

/// Outcome of one item in a bulk/internal enqueue call. Never carries a
/// verdict: the bulk path never runs the Matcher inline (spec.md §4.5).
#[derive(Debug, Clone)]
pub enum BulkOutcome {
    Reused { entity_key: String },
    AlreadyPending { entity_key: String },
    Queued { entity_key: String, job_id: Uuid },
}

/// Owns the pool/snapshot/config triple every Dispatcher call needs. Cheap
/// to clone: `PgPool` and `SnapshotHandle` are themselves `Arc`-backed.
#[derive(Clone)]
pub struct ScreeningDispatcher {
    pool: PgPool,
    snapshot: SnapshotHandle,
    config: EffectiveConfig,
    audit: Option<SharedAuditWriter>,
}

impl ScreeningDispatcher {
    pub fn new(pool: PgPool, snapshot: SnapshotHandle, config: EffectiveConfig) -> Self {
        Self { pool, snapshot, config, audit: None }
    }

    /// Attach an audit trail. Optional: a dispatcher with none configured
    /// behaves exactly as before, just without a `manual_override` event on
    /// `mark_false_positive`.
    pub fn with_audit(mut self, audit: SharedAuditWriter) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn snapshot(&self) -> &SnapshotHandle {
        &self.snapshot
    }

    /// The five-step decision procedure of spec.md §4.5.
    pub async fn screen(&self, req: &ScreeningRequest) -> Result<ScreenOutcome> {
        validate(req).map_err(anyhow::Error::new)?;

        let dob_norm = scr_normalizer::normalize_dob(req.dob.as_deref());
        let entity_key = derive_entity_key(&req.name, req.entity_type.as_lowercase(), req.dob.as_deref());

        if let Some(existing) = scr_db::get_valid_screening(&self.pool, &entity_key).await.context("screen: get_valid_screening")? {
            scr_db::update_cached_screening_metadata(
                &self.pool,
                &entity_key,
                &req.requestor,
                req.business_reference.as_deref(),
                req.reason_for_check,
            )
            .await
            .context("screen: update_cached_screening_metadata")?;

            let mut entity = existing;
            entity.last_requestor = req.requestor.clone();
            entity.business_reference = req.business_reference.clone();
            entity.reason_for_check = req.reason_for_check;
            return Ok(ScreenOutcome::Reused { entity_key, entity });
        }

        let pending_running = scr_db::get_pending_running_count(&self.pool).await.context("screen: get_pending_running_count")?;
        if pending_running >= self.config.queue_threshold {
            let job_id = scr_db::enqueue_job(
                &self.pool,
                &NewJob {
                    entity_key: &entity_key,
                    name: &req.name,
                    date_of_birth: dob_norm,
                    entity_type: req.entity_type,
                    requestor: &req.requestor,
                    business_reference: req.business_reference.as_deref(),
                    reason_for_check: req.reason_for_check,
                    reason: JobReason::Manual,
                    refresh_run_id: None,
                    force_rescreen: false,
                },
            )
            .await
            .context("screen: enqueue_job")?;
            return Ok(ScreenOutcome::Queued { entity_key, job_id });
        }

        let entity = self.run_inline(&entity_key, req, dob_norm).await?;
        Ok(ScreenOutcome::Completed { entity_key, entity })
    }

    async fn run_inline(&self, entity_key: &str, req: &ScreeningRequest, dob_norm: Option<chrono::NaiveDate>) -> Result<ScreenedEntity> {
        let snapshot = self.snapshot.current();
        let query = MatchQuery { name: &req.name, dob: dob_norm.or_else(|| parse_query_dob(req.dob.as_deref())), entity_type: req.entity_type };
        let result: ScreeningResult = run_match(&query, &snapshot);

        let now = Utc::now();
        let valid_until = now + chrono::Duration::days(CACHE_VALIDITY_DAYS);
        let uk_hash = if snapshot.uk_hash.is_empty() { None } else { Some(snapshot.uk_hash.as_str()) };

        scr_db::upsert_screening(
            &self.pool,
            &UpsertScreening {
                entity_key,
                display_name: &req.name,
                normalized_name: &normalize_text(&req.name),
                date_of_birth: dob_norm,
                entity_type: req.entity_type,
                last_screened_at: now,
                screening_valid_until: valid_until,
                result: &result,
                requestor: &req.requestor,
                business_reference: req.business_reference.as_deref(),
                reason_for_check: req.reason_for_check,
                refresh_run_id: None,
                uk_hash,
            },
        )
        .await
        .context("run_inline: upsert_screening")?;

        scr_db::get_valid_screening(&self.pool, entity_key)
            .await
            .context("run_inline: reload after upsert")?
            .ok_or_else(|| anyhow::anyhow!("run_inline: cache row missing immediately after upsert for {entity_key}"))
    }

    /// The bulk/internal ingestion variant (spec.md §4.5): up to 500 items,
    /// never a verdict, only `{reused, already_pending, queued}`.
    pub async fn enqueue_bulk(&self, items: &[ScreeningRequest]) -> Result<Vec<BulkOutcome>> {
        anyhow::ensure!(items.len() <= 500, "enqueue_bulk: at most 500 items per call, got {}", items.len());

        let mut out = Vec::with_capacity(items.len());
        for req in items {
            validate(req).map_err(anyhow::Error::new)?;
            let entity_key = derive_entity_key(&req.name, req.entity_type.as_lowercase(), req.dob.as_deref());

            if scr_db::get_valid_screening(&self.pool, &entity_key).await.context("enqueue_bulk: get_valid_screening")?.is_some() {
                out.push(BulkOutcome::Reused { entity_key });
                continue;
            }
            if scr_db::has_pending_or_running_job(&self.pool, &entity_key).await.context("enqueue_bulk: has_pending_or_running_job")? {
                out.push(BulkOutcome::AlreadyPending { entity_key });
                continue;
            }

            let dob_norm = scr_normalizer::normalize_dob(req.dob.as_deref());
            let job_id = scr_db::enqueue_job(
                &self.pool,
                &NewJob {
                    entity_key: &entity_key,
                    name: &req.name,
                    date_of_birth: dob_norm,
                    entity_type: req.entity_type,
                    requestor: &req.requestor,
                    business_reference: req.business_reference.as_deref(),
                    reason_for_check: req.reason_for_check,
                    reason: JobReason::Manual,
                    refresh_run_id: None,
                    force_rescreen: false,
                },
            )
            .await
            .context("enqueue_bulk: enqueue_job")?;
            out.push(BulkOutcome::Queued { entity_key, job_id });
        }
        Ok(out)
    }

    /// `MarkFalsePositive`: overwrites the cache verdict, stamping the
    /// current snapshot's UK hash so a later refresh can tell whether this
    /// override has gone stale.
    pub async fn mark_false_positive(&self, entity_key: &str, actor: &str, reason: Option<&str>) -> Result<ScreenedEntity> {
        let uk_hash = self.snapshot.current().uk_hash.clone();
        let uk_hash = if uk_hash.is_empty() { None } else { Some(uk_hash.as_str()) };

        scr_db::mark_false_positive(&self.pool, entity_key, actor, reason, uk_hash).await.context("mark_false_positive")?;

        let entity = scr_db::get_valid_screening(&self.pool, entity_key)
            .await
            .context("mark_false_positive: reload")?
            .ok_or_else(|| anyhow::anyhow!("mark_false_positive: no cache row for entity_key {entity_key}"))?;

        if let Some(audit) = &self.audit {
            let payload = serde_json::json!({
                "entity_key": entity_key,
                "actor": actor,
                "reason": reason,
                "uk_hash": uk_hash,
            });
            let mut writer = audit.lock().await;
            if let Err(e) = writer.append_manual_override_event(scr_audit::entity_uuid(entity_key), payload) {
                error!(entity_key, error = %e, "failed to append manual_override audit event");
            }
        }

        Ok(entity)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<scr_schemas::ScreeningJob>> {
        scr_db::get_job_status(&self.pool, job_id).await.context("get_job")
    }

    pub async fn search_screened(&self, term: &str, limit: i64) -> Result<Vec<ScreenedEntity>> {
        let limit = limit.clamp(1, 100);
        scr_db::search_screened_entities(&self.pool, term, limit).await.context("search_screened")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scr_schemas::EntityType;

    fn req(name: &str, requestor: &str) -> ScreeningRequest {
        ScreeningRequest {
            name: name.to_string(),
            dob: None,
            entity_type: EntityType::Person,
            requestor: requestor.to_string(),
            business_reference: None,
            reason_for_check: None,
        }
    }

    #[test]
    fn validate_rejects_empty_name() {
        let r = req("", "alice");
        assert_eq!(validate(&r), Err(DispatchError::MissingName));
    }

    #[test]
    fn validate_rejects_empty_requestor() {
        let r = req("Jane Doe", "");
        assert_eq!(validate(&r), Err(DispatchError::MissingRequestor));
    }

    #[test]
    fn validate_accepts_minimal_valid_request() {
        let r = req("Jane Doe", "alice");
        assert!(validate(&r).is_ok());
    }

    #[test]
    fn dispatch_error_codes_are_stable() {
        assert_eq!(DispatchError::MissingName.code(), "missing_name");
        assert_eq!(DispatchError::MissingRequestor.code(), "missing_requestor");
    }
}
