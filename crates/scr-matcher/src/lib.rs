//! Transform a normalized query plus the Watchlist Snapshot into a
//! `ScreeningResult`. The Matcher never raises: an empty snapshot or a
//! request with no candidates above threshold always resolves to
//! `Cleared`, per spec.

use std::collections::BTreeSet;

use chrono::{NaiveDate, Utc};

use scr_normalizer::{normalize_dob, tokenize_for_match};
use scr_schemas::{CheckSummary, Confidence, EntityType, RiskLevel, ScreeningResult, ScreeningStatus, TopMatch};
use scr_snapshot::{derive_regime_label, WatchlistSnapshot};

const AUTHORITATIVE_THRESHOLD: i32 = 80;
const SUGGESTION_THRESHOLD: i32 = 60;
const MAX_TOP_MATCHES: usize = 5;

const PEP_SOURCE_LABEL: &str = "Consolidated PEP list";
const EMPTY_SNAPSHOT_SOURCE_LABEL: &str = "Consolidated Sanctions & PEP Watchlist (no candidates)";
const CLEARED_SOURCE_LABEL: &str = "Consolidated Sanctions & PEP Watchlist";

/// A query, already resolved to the fields the Matcher needs. Built by the
/// Dispatcher/Worker from a `ScreeningRequest`; kept separate from
/// `ScreeningRequest` because the Matcher never needs `requestor` or
/// `business_reference`.
#[derive(Debug, Clone)]
pub struct MatchQuery<'a> {
    pub name: &'a str,
    pub dob: Option<NaiveDate>,
    pub entity_type: EntityType,
}

struct Candidate<'a> {
    entry: &'a scr_schemas::WatchlistEntry,
    score: i32,
}

/// Token-set-ratio similarity (0-100) between two already-tokenized,
/// stop-word-filtered token sets, via the classic token-set-ratio
/// construction: score the best of (intersection vs each side's full
/// token set, and the two full sets against each other).
fn token_set_ratio(a: &BTreeSet<String>, b: &BTreeSet<String>) -> i32 {
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let intersection: BTreeSet<&String> = a.intersection(b).collect();

    let sorted_sect = join_tokens(intersection.iter().map(|s| s.as_str()));
    let sorted_a = join_tokens(a.iter().map(|s| s.as_str()));
    let sorted_b = join_tokens(b.iter().map(|s| s.as_str()));

    let ratio = |x: &str, y: &str| -> i32 { (strsim::normalized_levenshtein(x, y) * 100.0).round() as i32 };

    ratio(&sorted_sect, &sorted_a).max(ratio(&sorted_sect, &sorted_b)).max(ratio(&sorted_a, &sorted_b))
}

fn join_tokens<'a>(tokens: impl Iterator<Item = &'a str>) -> String {
    let mut v: Vec<&str> = tokens.collect();
    v.sort_unstable();
    v.join(" ")
}

/// Score every entry in `pool` against the query tokens, applying the
/// overlap/Jaccard rejection and the two score penalties of spec.md §4.3
/// step 3, then filtering to `threshold`. An exact normalized match with
/// `<=2` query tokens always survives, bypassing both the rejection rules
/// and the threshold.
fn score_pool<'a>(
    query_joined: &str,
    query_tokens: &BTreeSet<String>,
    pool: &[&'a scr_schemas::WatchlistEntry],
    threshold: i32,
) -> Vec<Candidate<'a>> {
    let mut out = Vec::new();

    for entry in pool {
        let (cand_joined, cand_tokens) = tokenize_for_match(&entry.name_norm);

        let exact_match_exempt = query_joined == cand_joined && query_tokens.len() <= 2;

        if exact_match_exempt {
            out.push(Candidate { entry, score: 100 });
            continue;
        }

        let overlap = query_tokens.intersection(&cand_tokens).count();
        let union = query_tokens.union(&cand_tokens).count();
        let jaccard = if union == 0 { 0.0 } else { overlap as f64 / union as f64 };

        if overlap < 2 || jaccard < 0.4 {
            continue;
        }

        let mut score = token_set_ratio(query_tokens, &cand_tokens);

        let len_diff = (query_tokens.len() as i64 - cand_tokens.len() as i64).unsigned_abs();
        if len_diff > 2 {
            score -= 15;
        }
        if cand_tokens.len() <= 2 && query_tokens.len() > 3 {
            score -= 20;
        }

        if score >= threshold {
            out.push(Candidate { entry, score });
        }
    }

    out
}

/// Discard candidates whose `birth_norm` is null or differs from the
/// query's DOB, when the query supplies one (spec.md §4.3 step 4). A no-op
/// when the query has no DOB.
fn apply_dob_gate<'a>(candidates: Vec<Candidate<'a>>, query_dob: Option<NaiveDate>) -> Vec<Candidate<'a>> {
    match query_dob {
        None => candidates,
        Some(dob) => candidates.into_iter().filter(|c| c.entry.birth_norm == Some(dob)).collect(),
    }
}

fn best<'a>(candidates: &'a [Candidate<'a>]) -> Option<&'a Candidate<'a>> {
    candidates.iter().max_by_key(|c| c.score)
}

fn confidence_for_score(score: i32) -> Confidence {
    if score >= 90 {
        Confidence::High
    } else if score >= 80 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Transform a query plus the current snapshot into a screening verdict.
/// Total: never panics, never returns an error.
pub fn screen(query: &MatchQuery<'_>, snapshot: &WatchlistSnapshot) -> ScreeningResult {
    if snapshot.is_empty() {
        return cleared_result(EMPTY_SNAPSHOT_SOURCE_LABEL.to_string(), Vec::new());
    }

    let (query_joined, query_tokens) = tokenize_for_match(query.name);
    let (sanctions_pool, peps_pool) = snapshot.pools_for_entity_type(query.entity_type.as_lowercase());

    let sanctions_candidates = apply_dob_gate(score_pool(&query_joined, &query_tokens, &sanctions_pool, AUTHORITATIVE_THRESHOLD), query.dob);
    let peps_candidates = apply_dob_gate(score_pool(&query_joined, &query_tokens, &peps_pool, AUTHORITATIVE_THRESHOLD), query.dob);

    let best_sanction = best(&sanctions_candidates);
    let best_pep = best(&peps_candidates);

    let top_matches = build_top_matches(&query_joined, &query_tokens, &sanctions_pool, &peps_pool);

    match (best_sanction, best_pep) {
        (Some(s), Some(_p)) => {
            let regime = derive_regime_label(&s.entry.program_ids, &s.entry.sanctions, &s.entry.dataset);
            let source = format!("{}; {}", s.entry.dataset, PEP_SOURCE_LABEL);
            ScreeningResult {
                status: ScreeningStatus::FailSanctionAndPep,
                risk_level: RiskLevel::HighRisk,
                confidence: confidence_for_score(s.score),
                score: s.score,
                is_sanctioned: true,
                is_pep: true,
                sanctions_name: Some(s.entry.name.clone()),
                birth_date: s.entry.birth_norm,
                regime: Some(regime),
                top_matches,
                check_summary: check_summary(ScreeningStatus::FailSanctionAndPep, &source),
                manual_override: None,
            }
        }
        (Some(s), None) => {
            let regime = derive_regime_label(&s.entry.program_ids, &s.entry.sanctions, &s.entry.dataset);
            ScreeningResult {
                status: ScreeningStatus::FailSanction,
                risk_level: RiskLevel::HighRisk,
                confidence: confidence_for_score(s.score),
                score: s.score,
                is_sanctioned: true,
                is_pep: false,
                sanctions_name: Some(s.entry.name.clone()),
                birth_date: s.entry.birth_norm,
                regime: Some(regime),
                top_matches,
                check_summary: check_summary(ScreeningStatus::FailSanction, &s.entry.dataset),
                manual_override: None,
            }
        }
        (None, Some(p)) => {
            let regime = derive_regime_label(&p.entry.program_ids, &p.entry.sanctions, &p.entry.dataset);
            ScreeningResult {
                status: ScreeningStatus::FailPep,
                risk_level: RiskLevel::MediumRisk,
                confidence: confidence_for_score(p.score),
                score: p.score,
                is_sanctioned: false,
                is_pep: true,
                sanctions_name: Some(p.entry.name.clone()),
                birth_date: p.entry.birth_norm,
                regime: Some(regime),
                top_matches,
                check_summary: check_summary(ScreeningStatus::FailPep, PEP_SOURCE_LABEL),
                manual_override: None,
            }
        }
        (None, None) => cleared_result(CLEARED_SOURCE_LABEL.to_string(), top_matches),
    }
}

fn cleared_result(source: String, top_matches: Vec<TopMatch>) -> ScreeningResult {
    let confidence = if top_matches.is_empty() { Confidence::VeryHigh } else { Confidence::Low };
    ScreeningResult {
        status: ScreeningStatus::Cleared,
        risk_level: RiskLevel::Cleared,
        confidence,
        score: 0,
        is_sanctioned: false,
        is_pep: false,
        sanctions_name: None,
        birth_date: None,
        regime: None,
        top_matches,
        check_summary: check_summary(ScreeningStatus::Cleared, &source),
        manual_override: None,
    }
}

fn check_summary(status: ScreeningStatus, source: &str) -> CheckSummary {
    CheckSummary { status: status.as_str().to_string(), source: source.to_string(), date: Utc::now() }
}

/// Up to 5 highest-scoring name-only candidates from the combined pool,
/// ignoring DOB strictness, threshold 60, deduplicated by display name
/// keeping the highest score (spec.md §4.3 step 9). Advisory only.
fn build_top_matches(
    query_joined: &str,
    query_tokens: &BTreeSet<String>,
    sanctions_pool: &[&scr_schemas::WatchlistEntry],
    peps_pool: &[&scr_schemas::WatchlistEntry],
) -> Vec<TopMatch> {
    let mut candidates = score_pool(query_joined, query_tokens, sanctions_pool, SUGGESTION_THRESHOLD);
    candidates.extend(score_pool(query_joined, query_tokens, peps_pool, SUGGESTION_THRESHOLD));

    let mut best_by_name: std::collections::HashMap<&str, i32> = std::collections::HashMap::new();
    for c in &candidates {
        let slot = best_by_name.entry(c.entry.name.as_str()).or_insert(c.score);
        if c.score > *slot {
            *slot = c.score;
        }
    }

    let mut deduped: Vec<TopMatch> = best_by_name.into_iter().map(|(name, score)| TopMatch { name: name.to_string(), score }).collect();
    deduped.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    deduped.truncate(MAX_TOP_MATCHES);
    deduped
}

/// Parse a DOB string (already in any format `scr_normalizer::normalize_dob`
/// accepts) for constructing a [`MatchQuery`] from raw request input.
pub fn parse_query_dob(dob: Option<&str>) -> Option<NaiveDate> {
    normalize_dob(dob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scr_schemas::{SourceType, WatchlistEntry};

    fn entry(schema: &str, name: &str, dataset: &str, source_type: SourceType, birth: Option<&str>) -> WatchlistEntry {
        WatchlistEntry {
            schema: schema.to_string(),
            name: name.to_string(),
            aliases: vec![],
            birth_date: birth.map(str::to_string),
            program_ids: String::new(),
            dataset: dataset.to_string(),
            sanctions: String::new(),
            source_type,
            name_norm: scr_normalizer::normalize_text(name),
            birth_norm: birth.and_then(|b| normalize_dob(Some(b))),
        }
    }

    fn snapshot_with(entries: Vec<WatchlistEntry>) -> WatchlistSnapshot {
        WatchlistSnapshot { entries, uk_hash: String::new(), uk_entries: vec![] }
    }

    #[test]
    fn empty_snapshot_is_cleared_with_zero_score() {
        let snapshot = WatchlistSnapshot::default();
        let q = MatchQuery { name: "Vladimir Putin", dob: None, entity_type: EntityType::Person };
        let result = screen(&q, &snapshot);
        assert_eq!(result.status, ScreeningStatus::Cleared);
        assert_eq!(result.score, 0);
        assert!(result.top_matches.is_empty());
    }

    #[test]
    fn exact_sanctions_match_yields_fail_sanction() {
        let snapshot = snapshot_with(vec![entry("person", "Vladimir Putin", "un_consolidated", SourceType::Sanctions, None)]);
        let q = MatchQuery { name: "Vladimir Putin", dob: None, entity_type: EntityType::Person };
        let result = screen(&q, &snapshot);
        assert_eq!(result.status, ScreeningStatus::FailSanction);
        assert!(result.is_sanctioned);
        assert_eq!(result.risk_level, RiskLevel::HighRisk);
    }

    #[test]
    fn pep_only_match_yields_fail_pep() {
        let snapshot = snapshot_with(vec![entry("person", "Some Official", "peps", SourceType::Peps, None)]);
        let q = MatchQuery { name: "Some Official", dob: None, entity_type: EntityType::Person };
        let result = screen(&q, &snapshot);
        assert_eq!(result.status, ScreeningStatus::FailPep);
        assert_eq!(result.risk_level, RiskLevel::MediumRisk);
        assert_eq!(result.check_summary.source, PEP_SOURCE_LABEL);
    }

    #[test]
    fn sanction_and_pep_match_upgrades_status() {
        let snapshot = snapshot_with(vec![
            entry("person", "Jane Doe", "un_consolidated", SourceType::Sanctions, None),
            entry("person", "Jane Doe", "peps", SourceType::Peps, None),
        ]);
        let q = MatchQuery { name: "Jane Doe", dob: None, entity_type: EntityType::Person };
        let result = screen(&q, &snapshot);
        assert_eq!(result.status, ScreeningStatus::FailSanctionAndPep);
        assert!(result.is_sanctioned && result.is_pep);
    }

    #[test]
    fn dob_mismatch_clears_even_with_name_match() {
        let snapshot = snapshot_with(vec![entry("person", "Jane Doe", "un_consolidated", SourceType::Sanctions, Some("1980-01-01"))]);
        let q = MatchQuery { name: "Jane Doe", dob: normalize_dob(Some("1990-01-01")), entity_type: EntityType::Person };
        let result = screen(&q, &snapshot);
        assert_eq!(result.status, ScreeningStatus::Cleared);
        // Suggestions ignore DOB strictness.
        assert!(!result.top_matches.is_empty());
    }

    #[test]
    fn short_noisy_overlap_is_rejected() {
        let snapshot = snapshot_with(vec![entry("person", "Smith", "un_consolidated", SourceType::Sanctions, None)]);
        let q = MatchQuery { name: "John Smith Anderson Wallace", dob: None, entity_type: EntityType::Person };
        let result = screen(&q, &snapshot);
        assert_eq!(result.status, ScreeningStatus::Cleared);
    }

    #[test]
    fn organization_schema_filter_excludes_person_rows() {
        let snapshot = snapshot_with(vec![entry("person", "Acme Person", "un_consolidated", SourceType::Sanctions, None)]);
        let q = MatchQuery { name: "Acme Person", dob: None, entity_type: EntityType::Organization };
        let result = screen(&q, &snapshot);
        assert_eq!(result.status, ScreeningStatus::Cleared);
    }
}
