//! Discriminated record types for every entity named in the screening
//! coordination engine. Plain data: no I/O, no validation beyond what the
//! type system gives for free. Validation lives at the boundary that
//! produces these values (`scr-dispatcher`, `scr-db`).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum EntityType {
    Person,
    Organization,
}

impl EntityType {
    /// Lowercase form used in `entity_key` derivation and cache rows.
    pub fn as_lowercase(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
        }
    }
}

impl Default for EntityType {
    fn default() -> Self {
        EntityType::Person
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonForCheck {
    #[serde(rename = "Client Onboarding")]
    ClientOnboarding,
    #[serde(rename = "Claim Payment")]
    ClaimPayment,
    #[serde(rename = "Business Partner Payment")]
    BusinessPartnerPayment,
    #[serde(rename = "Business Partner Due Diligence")]
    BusinessPartnerDueDiligence,
    #[serde(rename = "Periodic Re-Screen")]
    PeriodicReScreen,
    #[serde(rename = "Ad-Hoc Compliance Review")]
    AdHocComplianceReview,
}

impl ReasonForCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonForCheck::ClientOnboarding => "Client Onboarding",
            ReasonForCheck::ClaimPayment => "Claim Payment",
            ReasonForCheck::BusinessPartnerPayment => "Business Partner Payment",
            ReasonForCheck::BusinessPartnerDueDiligence => "Business Partner Due Diligence",
            ReasonForCheck::PeriodicReScreen => "Periodic Re-Screen",
            ReasonForCheck::AdHocComplianceReview => "Ad-Hoc Compliance Review",
        }
    }
}

/// Transient input to the Dispatcher. Not persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningRequest {
    pub name: String,
    pub dob: Option<String>,
    #[serde(default)]
    pub entity_type: EntityType,
    pub requestor: String,
    pub business_reference: Option<String>,
    pub reason_for_check: Option<ReasonForCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreeningStatus {
    Cleared,
    #[serde(rename = "Fail Sanction")]
    FailSanction,
    #[serde(rename = "Fail PEP")]
    FailPep,
    #[serde(rename = "Fail Sanction & PEP")]
    FailSanctionAndPep,
    #[serde(rename = "Cleared - False Positive")]
    ClearedFalsePositive,
}

impl ScreeningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreeningStatus::Cleared => "Cleared",
            ScreeningStatus::FailSanction => "Fail Sanction",
            ScreeningStatus::FailPep => "Fail PEP",
            ScreeningStatus::FailSanctionAndPep => "Fail Sanction & PEP",
            ScreeningStatus::ClearedFalsePositive => "Cleared - False Positive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Cleared,
    Low,
    Medium,
    #[serde(rename = "Medium Risk")]
    MediumRisk,
    #[serde(rename = "High Risk")]
    HighRisk,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Cleared => "Cleared",
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::MediumRisk => "Medium Risk",
            RiskLevel::HighRisk => "High Risk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    #[serde(rename = "Very High")]
    VeryHigh,
    High,
    Medium,
    Low,
    #[serde(rename = "Manual Review")]
    ManualReview,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::VeryHigh => "Very High",
            Confidence::High => "High",
            Confidence::Medium => "Medium",
            Confidence::Low => "Low",
            Confidence::ManualReview => "Manual Review",
        }
    }
}

/// An advisory (never authoritative) name-only suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopMatch {
    pub name: String,
    pub score: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSummary {
    pub status: String,
    pub source: String,
    pub date: DateTime<Utc>,
}

/// Audit sub-object embedded in `result_json` when an operator overrides a
/// verdict via `MarkFalsePositive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualOverride {
    pub actor: String,
    pub reason: Option<String>,
    pub overridden_at: DateTime<Utc>,
    pub previous_status: ScreeningStatus,
    pub previous_risk_level: RiskLevel,
    pub previous_score: i32,
    pub previous_sanctions_name: Option<String>,
}

/// The verdict bundle produced by the Matcher, stored as JSON on the cache
/// row's `result_json` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub status: ScreeningStatus,
    pub risk_level: RiskLevel,
    pub confidence: Confidence,
    pub score: i32,
    pub is_sanctioned: bool,
    pub is_pep: bool,
    pub sanctions_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub regime: Option<String>,
    pub top_matches: Vec<TopMatch>,
    pub check_summary: CheckSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_override: Option<ManualOverride>,
}

/// The `screened_entities` cache row, flattened for indexing plus the full
/// `result_json` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenedEntity {
    pub entity_key: String,
    pub display_name: String,
    pub normalized_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub entity_type: EntityType,
    pub last_screened_at: DateTime<Utc>,
    pub screening_valid_until: DateTime<Utc>,
    pub status: ScreeningStatus,
    pub risk_level: RiskLevel,
    pub confidence: Confidence,
    pub score: i32,
    pub uk_sanctions_flag: bool,
    pub pep_flag: bool,
    pub result_json: ScreeningResult,
    pub last_requestor: String,
    pub business_reference: Option<String>,
    pub reason_for_check: Option<ReasonForCheck>,
    pub screened_against_uk_hash: Option<String>,
    pub screened_against_refresh_run_id: Option<Uuid>,
    pub manual_override_uk_hash: Option<String>,
    pub manual_override_stale: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobReason {
    Manual,
    UkDeltaRescreen,
}

impl JobReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobReason::Manual => "manual",
            JobReason::UkDeltaRescreen => "uk_delta_rescreen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Unchanged,
    NewResult,
    Changed,
    ClearedToFail,
    FailToCleared,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Unchanged => "unchanged",
            Transition::NewResult => "new_result",
            Transition::Changed => "changed",
            Transition::ClearedToFail => "cleared_to_fail",
            Transition::FailToCleared => "fail_to_cleared",
        }
    }

    /// Derive the transition label by comparing a prior cache status (if
    /// any) to the freshly produced status. Never affects verdict payloads
    /// (spec invariant: transition is advisory/operational only).
    pub fn derive(previous_status: Option<ScreeningStatus>, result_status: ScreeningStatus) -> Self {
        let previous = match previous_status {
            None => return Transition::NewResult,
            Some(p) => p,
        };

        let was_failing = matches!(
            previous,
            ScreeningStatus::FailSanction | ScreeningStatus::FailPep | ScreeningStatus::FailSanctionAndPep
        );
        let now_failing = matches!(
            result_status,
            ScreeningStatus::FailSanction | ScreeningStatus::FailPep | ScreeningStatus::FailSanctionAndPep
        );

        if previous.as_str() == result_status.as_str() {
            Transition::Unchanged
        } else if !was_failing && now_failing {
            Transition::ClearedToFail
        } else if was_failing && !now_failing {
            Transition::FailToCleared
        } else {
            Transition::Changed
        }
    }
}

/// The `screening_jobs` queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningJob {
    pub job_id: Uuid,
    pub entity_key: String,
    pub name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub entity_type: EntityType,
    pub requestor: String,
    pub business_reference: Option<String>,
    pub reason_for_check: Option<ReasonForCheck>,
    pub reason: JobReason,
    pub refresh_run_id: Option<Uuid>,
    pub force_rescreen: bool,
    pub status: JobStatus,
    pub previous_status: Option<ScreeningStatus>,
    pub result_status: Option<ScreeningStatus>,
    pub transition: Option<Transition>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Metadata row for a completed or in-progress watchlist refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRun {
    pub refresh_run_id: Uuid,
    pub ran_at: DateTime<Utc>,
    pub sanctions_rows: i64,
    pub peps_rows: i64,
    pub uk_row_count: i64,
    pub uk_hash: String,
    pub prev_uk_hash: Option<String>,
    pub uk_changed: bool,
    pub added: i64,
    pub removed: i64,
    pub changed: i64,
    pub candidate: i64,
    pub queued: i64,
    pub already_pending: i64,
    pub reused: i64,
    pub failed: i64,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Sanctions,
    Peps,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Sanctions => "sanctions",
            SourceType::Peps => "peps",
        }
    }
}

/// A single row of the in-memory Watchlist Snapshot: exactly the columns
/// named in spec §4.2, plus the normalizer-derived projections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub schema: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub birth_date: Option<String>,
    pub program_ids: String,
    pub dataset: String,
    pub sanctions: String,
    pub source_type: SourceType,
    pub name_norm: String,
    pub birth_norm: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_new_result_when_no_prior_status() {
        assert_eq!(
            Transition::derive(None, ScreeningStatus::Cleared),
            Transition::NewResult
        );
    }

    #[test]
    fn transition_unchanged_when_same_status() {
        assert_eq!(
            Transition::derive(Some(ScreeningStatus::Cleared), ScreeningStatus::Cleared),
            Transition::Unchanged
        );
    }

    #[test]
    fn transition_cleared_to_fail() {
        assert_eq!(
            Transition::derive(Some(ScreeningStatus::Cleared), ScreeningStatus::FailSanction),
            Transition::ClearedToFail
        );
    }

    #[test]
    fn transition_fail_to_cleared() {
        assert_eq!(
            Transition::derive(Some(ScreeningStatus::FailPep), ScreeningStatus::Cleared),
            Transition::FailToCleared
        );
    }

    #[test]
    fn transition_changed_between_distinct_fail_kinds() {
        assert_eq!(
            Transition::derive(Some(ScreeningStatus::FailSanction), ScreeningStatus::FailPep),
            Transition::Changed
        );
    }

    #[test]
    fn status_as_str_matches_spec_labels() {
        assert_eq!(ScreeningStatus::FailSanctionAndPep.as_str(), "Fail Sanction & PEP");
        assert_eq!(ScreeningStatus::ClearedFalsePositive.as_str(), "Cleared - False Positive");
    }
}
