//! The Watchlist Snapshot: an in-memory, column-projected, indexed view
//! over the latest consolidated sanctions + PEP data, plus the loader that
//! produces it. Readers only ever clone an `Arc`; refreshes publish a new
//! snapshot by swapping the pointer, never by mutating in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

use scr_normalizer::{normalize_dob, normalize_text};
use scr_schemas::{SourceType, WatchlistEntry};

/// A single UK-subset fingerprint entry, persisted for delta computation
/// across refreshes (spec.md §4.2 "UK-subset fingerprint").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UkFingerprintEntry {
    pub entity_id: Option<String>,
    pub name_norm: String,
    pub birth_date: Option<String>,
    pub dataset: String,
    pub regime: String,
}

impl UkFingerprintEntry {
    fn canonical_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.entity_id.as_deref().unwrap_or(""),
            self.name_norm,
            self.birth_date.as_deref().unwrap_or(""),
            self.dataset,
            self.regime,
        )
    }

    /// Stable per-entry identifier, used as half of `scr-db`'s
    /// `watchlist_uk_snapshot_entries` composite primary key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_line().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Stable hash over the sorted UK-subset fingerprint entries.
pub fn compute_uk_hash(entries: &[UkFingerprintEntry]) -> String {
    let mut lines: Vec<String> = entries.iter().map(|e| e.canonical_line()).collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// The in-memory view over the latest watchlist feeds. Immutable once
/// constructed; a refresh builds a new one and swaps it in via
/// [`SnapshotHandle::publish`].
#[derive(Debug, Clone, Default)]
pub struct WatchlistSnapshot {
    pub entries: Vec<WatchlistEntry>,
    pub uk_hash: String,
    pub uk_entries: Vec<UkFingerprintEntry>,
}

impl WatchlistSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows whose `schema` matches the requested entity type (spec.md
    /// §4.3 step 1), partitioned by `source_type`.
    pub fn pools_for_entity_type(&self, entity_type_lc: &str) -> (Vec<&WatchlistEntry>, Vec<&WatchlistEntry>) {
        let schema_match = |schema: &str| -> bool {
            match entity_type_lc {
                "person" => schema.eq_ignore_ascii_case("person"),
                "organization" => matches!(schema.to_ascii_lowercase().as_str(), "organization" | "legalentity" | "company"),
                _ => false,
            }
        };

        let mut sanctions = Vec::new();
        let mut peps = Vec::new();
        for e in &self.entries {
            if !schema_match(&e.schema) {
                continue;
            }
            match e.source_type {
                SourceType::Sanctions => sanctions.push(e),
                SourceType::Peps => peps.push(e),
            }
        }
        (sanctions, peps)
    }
}

/// Shared, swappable handle to the current snapshot. Readers take a read
/// lock only long enough to clone the `Arc`; they never hold the lock while
/// scoring candidates, so a refresh's write lock never blocks an in-flight
/// match (spec.md §5, §9 "readers never lock").
#[derive(Clone)]
pub struct SnapshotHandle(Arc<RwLock<Arc<WatchlistSnapshot>>>);

impl SnapshotHandle {
    pub fn new(initial: WatchlistSnapshot) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(initial))))
    }

    pub fn empty() -> Self {
        Self::new(WatchlistSnapshot::default())
    }

    /// Current snapshot. Cheap: one `Arc` clone under a read lock.
    pub fn current(&self) -> Arc<WatchlistSnapshot> {
        self.0.read().expect("snapshot lock poisoned").clone()
    }

    /// Atomically replace the snapshot. Matches in flight keep their
    /// already-cloned `Arc` to the old snapshot until they finish.
    pub fn publish(&self, new_snapshot: WatchlistSnapshot) {
        let mut guard = self.0.write().expect("snapshot lock poisoned");
        *guard = Arc::new(new_snapshot);
    }
}

/// A raw, untyped feed row as read from a sanctions or PEP source, before
/// normalization and `source_type` tagging.
#[derive(Debug, Clone, Default)]
pub struct RawRow {
    pub schema: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub birth_date: Option<String>,
    pub program_ids: String,
    pub dataset: String,
    pub sanctions: String,
}

/// Abstract watchlist loader: the external collaborator named in spec.md
/// §1. Implementations decide how the raw sanctions/PEP feeds are obtained;
/// this crate only projects, filters, and normalizes what they return.
pub trait WatchlistSource {
    /// Returns `(sanctions_rows, peps_rows)`.
    fn fetch(&self) -> Result<(Vec<RawRow>, Vec<RawRow>)>;
}

/// Reads the two feeds from local CSV files. Used for operator-driven
/// refreshes from a pre-downloaded extract, and by `scr-testkit` fixtures.
pub struct CsvFileSource {
    pub sanctions_path: PathBuf,
    pub peps_path: PathBuf,
}

impl WatchlistSource for CsvFileSource {
    fn fetch(&self) -> Result<(Vec<RawRow>, Vec<RawRow>)> {
        let sanctions = read_raw_rows_csv(&self.sanctions_path)?;
        let peps = read_raw_rows_csv(&self.peps_path)?;
        Ok((sanctions, peps))
    }
}

struct HeaderMap {
    idx: HashMap<String, usize>,
}

impl HeaderMap {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self> {
        let mut idx = HashMap::new();
        for (i, h) in headers.iter().enumerate() {
            idx.insert(h.trim().to_ascii_lowercase(), i);
        }
        for required in ["schema", "name", "aliases", "birth_date", "program_ids", "dataset", "sanctions"] {
            if !idx.contains_key(required) {
                return Err(anyhow!("watchlist csv missing required header: {required}"));
            }
        }
        Ok(Self { idx })
    }

    fn get<'a>(&self, rec: &'a csv::StringRecord, name: &str) -> Result<&'a str> {
        let i = *self.idx.get(name).ok_or_else(|| anyhow!("missing header mapping: {name}"))?;
        Ok(rec.get(i).unwrap_or(""))
    }
}

fn read_raw_rows_csv(path: &Path) -> Result<Vec<RawRow>> {
    let file = std::fs::File::open(path).with_context(|| format!("open watchlist csv: {}", path.display()))?;
    read_raw_rows_csv_from_reader(file)
}

fn read_raw_rows_csv_from_reader<R: std::io::Read>(reader: R) -> Result<Vec<RawRow>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).trim(csv::Trim::All).from_reader(reader);

    let headers = rdr.headers().context("watchlist csv must have a header row")?.clone();
    let col = HeaderMap::from_headers(&headers)?;

    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec.context("watchlist csv read record failed")?;
        let aliases_raw = col.get(&rec, "aliases")?;
        let birth_date_raw = col.get(&rec, "birth_date")?;

        rows.push(RawRow {
            schema: col.get(&rec, "schema")?.to_string(),
            name: col.get(&rec, "name")?.to_string(),
            aliases: aliases_raw.split(';').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect(),
            birth_date: if birth_date_raw.trim().is_empty() { None } else { Some(birth_date_raw.to_string()) },
            program_ids: col.get(&rec, "program_ids")?.to_string(),
            dataset: col.get(&rec, "dataset")?.to_string(),
            sanctions: col.get(&rec, "sanctions")?.to_string(),
        });
    }
    Ok(rows)
}

/// Downloads the two OpenSanctions feeds over HTTP and projects them into
/// raw rows, the network-backed counterpart to [`CsvFileSource`] (spec.md
/// §1's external watchlist collaborator; mirrors
/// `refresh_opensanctions_data`'s two-URL download in the original).
pub async fn fetch_watchlist_http(sanctions_url: &str, peps_url: &str) -> Result<(Vec<RawRow>, Vec<RawRow>)> {
    let sanctions_text = reqwest::get(sanctions_url)
        .await
        .context("fetch sanctions feed")?
        .error_for_status()
        .context("sanctions feed returned an error status")?
        .text()
        .await
        .context("read sanctions feed body")?;
    let peps_text = reqwest::get(peps_url)
        .await
        .context("fetch peps feed")?
        .error_for_status()
        .context("peps feed returned an error status")?
        .text()
        .await
        .context("read peps feed body")?;

    let sanctions = read_raw_rows_csv_from_reader(sanctions_text.as_bytes()).context("parse sanctions feed csv")?;
    let peps = read_raw_rows_csv_from_reader(peps_text.as_bytes()).context("parse peps feed csv")?;
    Ok((sanctions, peps))
}

/// Does `dataset` contain any allow-list token (case-insensitive
/// substring)? Used to filter the sanctions feed per spec.md §4.2.
pub fn dataset_allowed(dataset: &str, allowlist: &[String]) -> bool {
    let dataset_lc = dataset.to_ascii_lowercase();
    allowlist.iter().any(|token| dataset_lc.contains(&token.to_ascii_lowercase()))
}

/// Is this dataset part of the UK-relevant subset used for the UK-hash
/// fingerprint? A conservative substring check against HMT/UK tokens.
pub fn is_uk_dataset(dataset: &str) -> bool {
    let d = dataset.to_ascii_lowercase();
    d.contains("hmt") || d.contains("hm treasury") || d.contains("uk ") || d.contains("ofsi")
}

/// Project raw rows from both feeds into a `WatchlistSnapshot`: tag
/// `source_type`, filter the sanctions feed by the dataset allow-list,
/// compute `name_norm`/`birth_norm`, and derive the UK-subset fingerprint.
pub fn build_snapshot(sanctions_rows: Vec<RawRow>, peps_rows: Vec<RawRow>, sanctions_allowlist: &[String]) -> WatchlistSnapshot {
    let mut entries = Vec::with_capacity(sanctions_rows.len() + peps_rows.len());
    let mut uk_entries = Vec::new();

    for row in sanctions_rows {
        if !dataset_allowed(&row.dataset, sanctions_allowlist) {
            continue;
        }
        let entry = project_entry(row, SourceType::Sanctions);
        if is_uk_dataset(&entry.dataset) {
            uk_entries.push(UkFingerprintEntry {
                entity_id: None,
                name_norm: entry.name_norm.clone(),
                birth_date: entry.birth_norm.map(|d| d.format("%Y-%m-%d").to_string()),
                dataset: entry.dataset.clone(),
                regime: derive_regime_label(&entry.program_ids, &entry.sanctions, &entry.dataset),
            });
        }
        entries.push(entry);
    }

    for row in peps_rows {
        entries.push(project_entry(row, SourceType::Peps));
    }

    let uk_hash = compute_uk_hash(&uk_entries);

    WatchlistSnapshot { entries, uk_hash, uk_entries }
}

fn project_entry(row: RawRow, source_type: SourceType) -> WatchlistEntry {
    let name_norm = normalize_text(&row.name);
    let birth_norm = normalize_dob(row.birth_date.as_deref());
    WatchlistEntry {
        schema: row.schema,
        name: row.name,
        aliases: row.aliases,
        birth_date: row.birth_date,
        program_ids: row.program_ids,
        dataset: row.dataset,
        sanctions: row.sanctions,
        source_type,
        name_norm,
        birth_norm,
    }
}

/// First non-empty of: first `;`-separated token of `program_ids`, first
/// `;`-separated chunk (or first line) of `sanctions`, `dataset` (spec.md
/// §4.3 step 8).
pub fn derive_regime_label(program_ids: &str, sanctions: &str, dataset: &str) -> String {
    if let Some(first) = program_ids.split(';').map(str::trim).find(|s| !s.is_empty()) {
        return first.to_string();
    }
    if let Some(first) = sanctions
        .split(';')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| sanctions.lines().next().map(str::trim).filter(|s| !s.is_empty()))
    {
        return first.to_string();
    }
    dataset.trim().to_string()
}

/// Write the snapshot as newline-delimited JSON to a temp file in the same
/// directory as `path`, then atomically rename into place (spec.md §4.2/
/// §4.7: "write to temp, then move/replace").
pub fn write_snapshot_atomic(path: &Path, snapshot: &WatchlistSnapshot) -> Result<()> {
    let dir = path.parent().ok_or_else(|| anyhow!("snapshot path has no parent directory"))?;
    std::fs::create_dir_all(dir).with_context(|| format!("create_dir_all {}", dir.display()))?;

    let tmp_path = dir.join(format!(".{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot")));

    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp_path).with_context(|| format!("create temp snapshot {}", tmp_path.display()))?;
        for entry in &snapshot.entries {
            let line = serde_json::to_string(entry).context("serialize watchlist entry")?;
            writeln!(file, "{line}").context("write snapshot entry")?;
        }
        file.sync_all().ok();
    }

    std::fs::rename(&tmp_path, path).with_context(|| format!("rename {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Read a previously written newline-delimited JSON snapshot file. Returns
/// an empty snapshot (never an error) if the file is absent, matching
/// spec.md §4.2's "missing snapshot causes Cleared, not failure" semantics.
pub fn read_snapshot_from_disk(path: &Path) -> Result<WatchlistSnapshot> {
    if !path.exists() {
        return Ok(WatchlistSnapshot::default());
    }
    let content = std::fs::read_to_string(path).with_context(|| format!("read snapshot {}", path.display()))?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: WatchlistEntry = serde_json::from_str(line).context("parse snapshot entry")?;
        entries.push(entry);
    }
    // uk_hash/uk_entries are recomputed by the next refresh; a disk-loaded
    // snapshot is used for matching only, not for delta computation.
    Ok(WatchlistSnapshot { entries, uk_hash: String::new(), uk_entries: Vec::new() })
}
