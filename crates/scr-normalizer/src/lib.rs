//! Deterministic canonicalization and entity keying. Pure, total, no I/O:
//! malformed input yields empty strings or `None`, never an error.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Corporate/geographic noise tokens dropped by `tokenize_for_match`.
const STOP_WORDS: &[&str] = &[
    "the",
    "ltd",
    "llc",
    "inc",
    "co",
    "company",
    "corp",
    "plc",
    "limited",
    "real",
    "estate",
    "group",
    "services",
    "solutions",
    "hub",
    "global",
    "trust",
    "association",
    "federation",
    "union",
    "committee",
    "organization",
    "network",
    "centre",
    "center",
    "international",
    "foundation",
    "institute",
    "bank",
];

/// NFKD-decompose, drop combining marks (the ASCII-fold a "normalize to
/// NFKD then encode ascii/ignore" round-trip achieves), strip everything
/// outside `[A-Za-z0-9_\s]`, collapse whitespace, lowercase, trim.
pub fn normalize_text(s: &str) -> String {
    let decomposed: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();

    let stripped: String = decomposed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.to_lowercase().trim().to_string()
}

const DOB_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d.%m.%Y",
    "%Y.%m.%d",
    "%d-%m-%Y",
];

/// Parse any reasonable date string to an ISO `NaiveDate`. Returns `None`
/// for unparseable or empty input.
pub fn normalize_dob(d: Option<&str>) -> Option<NaiveDate> {
    let d = d?.trim();
    if d.is_empty() {
        return None;
    }
    DOB_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(d, fmt).ok())
}

/// SHA-256 hex of `"<name_norm>|<entity_type_lc>|<dob_iso_or_empty>"`.
pub fn derive_entity_key(name: &str, entity_type_lc: &str, dob: Option<&str>) -> String {
    let name_norm = normalize_text(name);
    let dob_iso = normalize_dob(dob).map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();

    let payload = format!("{name_norm}|{entity_type_lc}|{dob_iso}");
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// `normalize_text` then split on whitespace and drop the stop-word set.
/// Returns the joined cleaned string and the deduplicated token set.
pub fn tokenize_for_match(s: &str) -> (String, BTreeSet<String>) {
    let tokens: Vec<String> = normalize_text(s)
        .split_whitespace()
        .filter(|t| !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect();

    let joined = tokens.join(" ");
    let set: BTreeSet<String> = tokens.into_iter().collect();
    (joined, set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_strips_accents_and_punctuation() {
        assert_eq!(normalize_text("Volodymyr Zelens'kyy-Ríos!"), "volodymyr zelenskyyrios");
    }

    #[test]
    fn normalize_text_collapses_whitespace() {
        assert_eq!(normalize_text("  Jane   Doe  "), "jane doe");
    }

    #[test]
    fn normalize_text_empty_for_non_string_like_input() {
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn normalize_dob_parses_iso_and_slash_forms() {
        let expect = NaiveDate::from_ymd_opt(1990, 3, 15).unwrap();
        assert_eq!(normalize_dob(Some("1990-03-15")), Some(expect));
        assert_eq!(normalize_dob(Some("15/03/1990")), Some(expect));
    }

    #[test]
    fn normalize_dob_none_on_garbage() {
        assert_eq!(normalize_dob(Some("not a date")), None);
        assert_eq!(normalize_dob(None), None);
    }

    #[test]
    fn derive_entity_key_is_deterministic() {
        let a = derive_entity_key("Jane Doe", "person", Some("1990-03-15"));
        let b = derive_entity_key("  Jane   Doe ", "person", Some("15/03/1990"));
        assert_eq!(a, b);
    }

    #[test]
    fn derive_entity_key_differs_on_dob() {
        let a = derive_entity_key("Jane Doe", "person", Some("1990-03-15"));
        let b = derive_entity_key("Jane Doe", "person", None);
        assert_ne!(a, b);
    }

    #[test]
    fn tokenize_for_match_drops_stop_words() {
        let (joined, tokens) = tokenize_for_match("Acme Global Trust Ltd");
        assert_eq!(joined, "acme");
        assert!(tokens.contains("acme"));
        assert!(!tokens.contains("global"));
        assert!(!tokens.contains("trust"));
        assert!(!tokens.contains("ltd"));
    }
}
