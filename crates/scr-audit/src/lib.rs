//! Append-only audit trail for job lifecycle, manual overrides, and refresh
//! run summaries: one JSON Lines event per line, with an optional hash
//! chain so tampering with a past line is detectable. Carried as ambient
//! observability per SPEC_FULL.md §3 regardless of the log-shipping
//! non-goal: nothing here ships events anywhere, it only writes them
//! durably and lets an operator verify the chain.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

/// The writer, shared by every task that needs to append an event:
/// `tokio::sync::Mutex` rather than `std::sync::Mutex` because appends
/// happen from inside async worker/dispatcher code and the lock is held
/// across nothing but a quick file write, matching the daemon's own
/// async-aware shared-state idiom (`Arc<tokio::sync::RwLock<...>>`).
pub type SharedAuditWriter = Arc<Mutex<AuditWriter>>;

/// Open (or create) an audit log at `path` and wrap it for sharing across
/// tasks. Callers that have no configured audit path simply never call
/// this and pass `None` through instead.
pub fn open_shared(path: impl AsRef<Path>, hash_chain: bool) -> Result<SharedAuditWriter> {
    Ok(Arc::new(Mutex::new(AuditWriter::new(path, hash_chain)?)))
}

/// Deterministic v5 UUID derived from an `entity_key` (a hex string, not
/// itself a `Uuid`) so manual-override audit events are addressable by a
/// stable id without minting a random one per process.
pub fn entity_uuid(entity_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, entity_key.as_bytes())
}

/// Append-only audit writer. Writes JSON Lines (one event per line).
/// Optional hash chain: each event can include `hash_prev` + `hash_self`.
pub struct AuditWriter {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    /// Monotonically increasing sequence counter used in `event_id`
    /// derivation. Starts at 0, increments on every `append` call. When
    /// resuming an existing log after a daemon restart, restore with
    /// `set_seq(events_already_written)` alongside `set_last_hash`.
    seq: u64,
}

impl AuditWriter {
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        Ok(Self { path, hash_chain, last_hash: None, seq: 0 })
    }

    pub fn set_last_hash(&mut self, last_hash: Option<String>) {
        self.last_hash = last_hash;
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    pub fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Append one event with an explicit topic/event_type/payload. The
    /// screening-specific `append_*` helpers below build on top of this.
    pub fn append(&mut self, subject_id: Uuid, topic: &str, event_type: &str, payload: Value) -> Result<AuditEvent> {
        let ts_utc = Utc::now();
        let event_id = derive_event_id(self.last_hash.as_deref(), &payload, self.seq)?;
        self.seq += 1;

        let mut ev = AuditEvent {
            event_id,
            subject_id,
            ts_utc,
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            ev.hash_prev = self.last_hash.clone();
            let self_hash = compute_event_hash(&ev)?;
            ev.hash_self = Some(self_hash.clone());
            self.last_hash = Some(self_hash);
        }

        let line = canonical_json_line(&ev)?;
        append_line(&self.path, &line)?;
        Ok(ev)
    }

    /// A job moved to `running` (or was enqueued, or completed/failed):
    /// `topic = "job"`, keyed by `job_id`.
    pub fn append_job_event(&mut self, job_id: Uuid, event_type: &str, payload: Value) -> Result<AuditEvent> {
        self.append(job_id, "job", event_type, payload)
    }

    /// An operator overrode a cache verdict via `mark_false_positive`:
    /// `topic = "manual_override"`, keyed by a synthetic id derived from the
    /// entity (entity_key is not a `Uuid`; callers pass `entity_uuid`, a
    /// deterministic v5 derivation of the entity_key via [`entity_uuid`],
    /// so the event is still addressable by a stable id).
    pub fn append_manual_override_event(&mut self, entity_uuid: Uuid, payload: Value) -> Result<AuditEvent> {
        self.append(entity_uuid, "manual_override", "overridden", payload)
    }

    /// A watchlist refresh run finished: `topic = "refresh_run"`, keyed by
    /// `refresh_run_id`.
    pub fn append_refresh_run_event(&mut self, refresh_run_id: Uuid, payload: Value) -> Result<AuditEvent> {
        self.append(refresh_run_id, "refresh_run", "finalized", payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub subject_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    pub topic: String,
    pub event_type: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path).with_context(|| format!("open audit log {path:?}"))?;
    f.write_all(line.as_bytes()).context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit event failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
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

/// Hash chain is computed from the canonical JSON of the event WITHOUT
/// `hash_self` (to avoid self-reference).
pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut clone = ev.clone();
    clone.hash_self = None;
    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Deterministic `event_id`: no RNG, so a replayed append (same chain state,
/// same payload, same seq) always derives the same id.
fn derive_event_id(last_hash: Option<&str>, payload: &Value, seq: u64) -> Result<Uuid> {
    let payload_json = serde_json::to_string(payload).context("serialize payload for event_id")?;
    let basis = format!("{}|{}|{}", last_hash.unwrap_or(""), seq, payload_json);
    Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, basis.as_bytes()))
}

/// Verify the hash chain integrity of an audit log file.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref()).with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

/// Verify the hash chain integrity of an audit log string (JSONL content).
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let ev: AuditEvent = serde_json::from_str(trimmed).with_context(|| format!("parse audit event at line {}", i + 1))?;
        line_count += 1;

        if ev.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!("hash_prev mismatch: expected {:?}, got {:?}", prev_hash, ev.hash_prev),
            });
        }

        if let Some(ref claimed_hash) = ev.hash_self {
            let recomputed = compute_event_hash(&ev)?;
            if *claimed_hash != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("hash_self mismatch: claimed {claimed_hash}, recomputed {recomputed}"),
                });
            }
        }

        prev_hash = ev.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_chain_round_trips_through_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let mut writer = AuditWriter::new(&path, true).unwrap();
        writer.append_job_event(Uuid::new_v4(), "enqueued", json!({"entity_key": "abc"})).unwrap();
        writer.append_job_event(Uuid::new_v4(), "completed", json!({"status": "Cleared"})).unwrap();

        let result = verify_hash_chain(&path).unwrap();
        assert_eq!(result, VerifyResult::Valid { lines: 2 });
    }

    #[test]
    fn tampered_line_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let mut writer = AuditWriter::new(&path, true).unwrap();
        writer.append_job_event(Uuid::new_v4(), "enqueued", json!({"entity_key": "abc"})).unwrap();
        writer.append_job_event(Uuid::new_v4(), "completed", json!({"status": "Cleared"})).unwrap();

        let mut content = fs::read_to_string(&path).unwrap();
        content = content.replace("Cleared", "Fail Sanction");
        fs::write(&path, content).unwrap();

        let result = verify_hash_chain(&path).unwrap();
        assert!(matches!(result, VerifyResult::Broken { .. }));
    }

    #[test]
    fn event_id_is_deterministic_for_identical_chain_state() {
        let a = derive_event_id(None, &json!({"x": 1}), 0).unwrap();
        let b = derive_event_id(None, &json!({"x": 1}), 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn event_id_differs_on_seq() {
        let a = derive_event_id(None, &json!({"x": 1}), 0).unwrap();
        let b = derive_event_id(None, &json!({"x": 1}), 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn entity_uuid_is_deterministic_for_same_key() {
        let a = entity_uuid("abc123");
        let b = entity_uuid("abc123");
        assert_eq!(a, b);
        assert_ne!(a, entity_uuid("def456"));
    }

    #[tokio::test]
    async fn shared_writer_appends_are_visible_to_every_clone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let writer = open_shared(&path, true).unwrap();
        let writer_clone = writer.clone();

        writer.lock().await.append_job_event(Uuid::new_v4(), "enqueued", json!({"entity_key": "abc"})).unwrap();
        writer_clone.lock().await.append_job_event(Uuid::new_v4(), "completed", json!({"status": "Cleared"})).unwrap();

        let result = verify_hash_chain(&path).unwrap();
        assert_eq!(result, VerifyResult::Valid { lines: 2 });
    }
}
