//! Environment-driven configuration for the screening engine. Reads the
//! option set of spec.md §6 from environment variables with defaults,
//! clamps the values that have a documented minimum, and produces a single
//! canonicalized, hashed `EffectiveConfig` so a daemon run and its audit
//! trail can both refer to "the config this run used" as one short value —
//! the same canonicalize-then-hash idiom used for layered YAML config
//! elsewhere in this lineage, applied here to an env-var-derived value.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// `screening_valid_until - last_screened_at`, fixed by invariant (spec.md
/// §3.2 item 5). Not an environment option; exposed as a constant so
/// callers never hardcode `365` themselves.
pub const CACHE_VALIDITY_DAYS: i64 = 365;

const DEFAULT_ALLOWLIST: &[&str] = &["UN", "EU", "OFAC", "HMT", "HM Treasury", "UK Financial"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub queue_threshold: i64,
    pub worker_poll_interval_seconds: u64,
    pub worker_cleanup_every_n_loops: u64,
    pub jobs_retention_days: i64,
    pub screened_entities_retention_months: Option<i64>,
    pub snapshot_path: String,
    pub watchlist_sanctions_allowlist: Vec<String>,
    /// Path to the append-only audit log. `None` disables the audit trail
    /// entirely (ambient, but not required for correctness — §7 propagation
    /// policy never depends on it).
    pub audit_log_path: Option<String>,
}

impl EffectiveConfig {
    /// Read every option from its environment variable, falling back to the
    /// documented default, and apply the documented clamps.
    pub fn from_env() -> Result<Self> {
        let queue_threshold = env_i64("SCR_QUEUE_THRESHOLD", 5)?;
        let worker_poll_interval_seconds = env_u64("SCR_WORKER_POLL_INTERVAL_SECONDS", 5)?.max(2);
        let worker_cleanup_every_n_loops = env_u64("SCR_WORKER_CLEANUP_EVERY_N_LOOPS", 50)?;
        let jobs_retention_days = env_i64("SCR_JOBS_RETENTION_DAYS", 7)?;

        let screened_entities_retention_months = match std::env::var("SCR_SCREENED_ENTITIES_RETENTION_MONTHS") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => {
                let months: i64 = v.trim().parse().context("SCR_SCREENED_ENTITIES_RETENTION_MONTHS must be an integer")?;
                if months >= 1 {
                    Some(months)
                } else {
                    None
                }
            }
            Err(_) => None,
        };

        let snapshot_path =
            std::env::var("SCR_SNAPSHOT_PATH").unwrap_or_else(|_| "./data/watchlist_snapshot.ndjson".to_string());

        let watchlist_sanctions_allowlist = match std::env::var("SCR_WATCHLIST_SANCTIONS_ALLOWLIST") {
            Ok(v) if !v.trim().is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
            _ => DEFAULT_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
        };

        let audit_log_path = std::env::var("SCR_AUDIT_LOG_PATH").ok().filter(|v| !v.trim().is_empty());

        Ok(Self {
            queue_threshold,
            worker_poll_interval_seconds,
            worker_cleanup_every_n_loops,
            jobs_retention_days,
            screened_entities_retention_months,
            snapshot_path,
            watchlist_sanctions_allowlist,
            audit_log_path,
        })
    }

    /// Canonical JSON (keys sorted recursively) + its SHA-256 hex hash, the
    /// value surfaced by `scr-cli config-hash` and stamped into the audit
    /// trail at daemon startup.
    pub fn canonical_hash(&self) -> Result<(String, String)> {
        let value = serde_json::to_value(self).context("serialize EffectiveConfig")?;
        let sorted = sort_keys(&value);
        let canonical = serde_json::to_string(&sorted).context("canonicalize EffectiveConfig")?;

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash = hex::encode(hasher.finalize());

        Ok((canonical, hash))
    }
}

fn env_i64(key: &str, default: i64) -> Result<i64> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().with_context(|| format!("{key} must be an integer")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().with_context(|| format!("{key} must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_clamps_to_minimum_of_two() {
        std::env::set_var("SCR_WORKER_POLL_INTERVAL_SECONDS", "0");
        let cfg = EffectiveConfig::from_env().unwrap();
        assert_eq!(cfg.worker_poll_interval_seconds, 2);
        std::env::remove_var("SCR_WORKER_POLL_INTERVAL_SECONDS");
    }

    #[test]
    fn defaults_when_unset() {
        std::env::remove_var("SCR_QUEUE_THRESHOLD");
        std::env::remove_var("SCR_SCREENED_ENTITIES_RETENTION_MONTHS");
        let cfg = EffectiveConfig::from_env().unwrap();
        assert_eq!(cfg.queue_threshold, 5);
        assert_eq!(cfg.screened_entities_retention_months, None);
    }

    #[test]
    fn hash_is_deterministic_for_identical_config() {
        let cfg = EffectiveConfig {
            queue_threshold: 5,
            worker_poll_interval_seconds: 5,
            worker_cleanup_every_n_loops: 50,
            jobs_retention_days: 7,
            screened_entities_retention_months: None,
            snapshot_path: "./x.ndjson".to_string(),
            watchlist_sanctions_allowlist: vec!["UN".to_string()],
            audit_log_path: None,
        };
        let (_, hash_a) = cfg.canonical_hash().unwrap();
        let (_, hash_b) = cfg.canonical_hash().unwrap();
        assert_eq!(hash_a, hash_b);
    }
}
