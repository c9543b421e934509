//! The learned-policy store: YAML-backed match entries.
//!
//! File order is semantically significant (evaluation walks entries top to
//! bottom and the first match wins), so the store loads into an ordered
//! `Vec` and is never re-sorted.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Decision, PolicyError};

/// What a policy entry matches against. All specified criteria must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchCriteria {
    /// Capability name; must equal the segment's capability exactly.
    pub cap: String,
    /// First positional argument, when constrained.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subcmd: String,
    /// At least one of these flags must be present (past the subcmd).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub has_flags: Vec<String>,
    /// None of these flags may be present (past the subcmd).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_flags: Vec<String>,
    /// Every positional argument must match at least one of these globs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args_glob: Vec<String>,
}

/// Spaced-repetition review state of an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReviewSchedule {
    /// When the entry was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// When a human last reviewed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed: Option<DateTime<Utc>>,
    /// How many reviews have been completed.
    #[serde(default)]
    pub review_count: u32,
    /// When the next review is due.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_review: Option<DateTime<Utc>>,
}

/// A single learned policy rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreEntry {
    /// Stable identifier, carried into audit records on match.
    pub id: String,
    /// Human-readable summary.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Match criteria.
    #[serde(rename = "match")]
    pub criteria: MatchCriteria,
    /// "allow", "deny", or "escalate".
    pub decision: String,
    /// Why this decision was made.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    /// "high", "medium", or "low".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub confidence: String,
    /// "human" or "gatekeeper".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provenance: String,
    /// Only approved entries participate in evaluation; the rest exist for
    /// human review.
    #[serde(default)]
    pub approved: bool,
    /// Review schedule.
    #[serde(default)]
    pub review: ReviewSchedule,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    entries: Vec<StoreEntry>,
}

/// Default store location: `~/.config/doit/learned-policy.yaml`.
#[must_use]
pub fn default_store_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".config").join("doit"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("learned-policy.yaml")
}

/// Loads and validates policy entries from YAML, preserving file order.
/// A missing file yields an empty store.
///
/// # Errors
///
/// [`PolicyError::Parse`] for malformed YAML, or a validation error for an
/// entry missing its id, its `match.cap`, or carrying a decision outside
/// the closed allow/deny/escalate set. Malformed entries abort the load.
pub fn load_store(path: impl AsRef<Path>) -> Result<Vec<StoreEntry>, PolicyError> {
    let path = path.as_ref();
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PolicyError::Io(e)),
    };

    let file: StoreFile = serde_yaml::from_str(&data).map_err(|source| PolicyError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    for (index, entry) in file.entries.iter().enumerate() {
        if entry.id.is_empty() {
            return Err(PolicyError::MissingId {
                path: path.display().to_string(),
                index,
            });
        }
        if entry.criteria.cap.is_empty() {
            return Err(PolicyError::MissingCap {
                path: path.display().to_string(),
                id: entry.id.clone(),
            });
        }
        entry.decision.parse::<Decision>()?;
    }

    Ok(file.entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
entries:
  - id: allow-cargo-check
    match:
      cap: make
      has_flags: ["-n"]
    decision: allow
    reasoning: dry runs are harmless
    confidence: high
    provenance: human
    approved: true
  - id: deny-push-main
    match:
      cap: git
      subcmd: push
      args_glob: ["main", "master"]
    decision: deny
    provenance: gatekeeper
"#;

    #[test]
    fn test_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learned-policy.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let entries = load_store(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "allow-cargo-check");
        assert!(entries[0].approved);
        assert_eq!(entries[1].id, "deny-push-main");
        assert_eq!(entries[1].criteria.subcmd, "push");
        assert!(!entries[1].approved);
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        assert!(load_store("/nonexistent/learned-policy.yaml")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_entry_without_id_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learned-policy.yaml");
        std::fs::write(
            &path,
            "entries:\n  - match:\n      cap: git\n    decision: allow\n",
        )
        .unwrap();
        assert!(matches!(
            load_store(&path).unwrap_err(),
            PolicyError::MissingId { index: 0, .. }
        ));
    }

    #[test]
    fn test_entry_without_cap_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learned-policy.yaml");
        std::fs::write(
            &path,
            "entries:\n  - id: x\n    match:\n      cap: \"\"\n    decision: allow\n",
        )
        .unwrap();
        assert!(matches!(
            load_store(&path).unwrap_err(),
            PolicyError::MissingCap { .. }
        ));
    }

    #[test]
    fn test_invalid_decision_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learned-policy.yaml");
        std::fs::write(
            &path,
            "entries:\n  - id: x\n    match:\n      cap: git\n    decision: maybe\n",
        )
        .unwrap();
        assert!(matches!(
            load_store(&path).unwrap_err(),
            PolicyError::InvalidDecision(s) if s == "maybe"
        ));
    }
}
