//! Hash-chained, append-only audit log.
//!
//! Every completed invocation appends one JSON line. Entries chain through
//! SHA-256: each record carries the previous record's hash and its own hash,
//! computed over the record serialized with the `hash` field empty. The
//! first entry links to the digest of the literal `doit-genesis`, so an
//! empty log has a well-defined cursor and any tampering invalidates the
//! suffix from the altered line onward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

mod logger;
mod verify;

pub use logger::Logger;
pub use verify::{tail, verify};

use crate::policy::EvalInfo;

/// Seed string for the chain: the genesis hash is `SHA256("doit-genesis")`.
const GENESIS_INPUT: &str = "doit-genesis";

/// Number of entries shown by `doit --audit show|tail`.
pub const TAIL_DEFAULT: usize = 20;

/// Hex SHA-256 of the genesis seed, the `prev_hash` of the first entry.
#[must_use]
pub fn genesis_hash() -> String {
    hex::encode(Sha256::digest(GENESIS_INPUT.as_bytes()))
}

/// One audit record. Field order is load-bearing: hashes are computed over
/// the serialized form, so reordering fields invalidates existing logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    /// Monotonic sequence number, starting at 1.
    pub seq: u64,
    /// UTC timestamp of completion.
    #[serde(rename = "ts")]
    pub time: DateTime<Utc>,
    /// Hash of the previous entry (or the genesis hash).
    pub prev_hash: String,
    /// Raw pipeline description.
    pub pipeline: String,
    /// Capability name of every segment across the command, in order.
    pub segments: Vec<String>,
    /// Tier of each segment, parallel to `segments`.
    pub tiers: Vec<String>,
    /// Whether `--retry` was used.
    #[serde(default, skip_serializing_if = "is_false")]
    pub retry: bool,
    /// Process exit code; 0 on success.
    pub exit_code: i32,
    /// Error message when the command failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Execution time in milliseconds.
    #[serde(rename = "duration_ms")]
    pub duration: f64,
    /// Working directory of the invocation.
    pub cwd: String,
    /// Policy level that decided (1, 2, or 3); 0 when policy did not run.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub policy_level: u8,
    /// Policy decision: "allow", "deny", or "escalate".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_result: String,
    /// Identifier of the rule that matched.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_rule_id: String,
    /// Worker-supplied justification, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub justification: String,
    /// Worker-supplied safety argument, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub safety_arg: String,
    /// Hex SHA-256 of this entry with this field empty.
    pub hash: String,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u8) -> bool {
    *n == 0
}

/// Hex SHA-256 of `entry` serialized with its `hash` field blanked.
#[must_use]
pub fn compute_hash(entry: &Entry) -> String {
    let mut blanked = entry.clone();
    blanked.hash = String::new();
    // Serialization of a fully-owned struct cannot fail.
    let bytes = serde_json::to_vec(&blanked).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Caller-supplied fields of a new audit record; the logger fills in the
/// sequence number, timestamp, and chain hashes.
#[derive(Debug, Clone, Default)]
pub struct LogRecord {
    /// Raw pipeline description.
    pub pipeline: String,
    /// Capability name per segment.
    pub segments: Vec<String>,
    /// Tier per segment.
    pub tiers: Vec<String>,
    /// Process exit code.
    pub exit_code: i32,
    /// Error message, empty on success.
    pub error: String,
    /// Wall-clock execution time.
    pub duration: std::time::Duration,
    /// Working directory.
    pub cwd: String,
    /// Whether `--retry` was used.
    pub retry: bool,
    /// Policy evaluation metadata, when policy ran.
    pub policy: Option<EvalInfo>,
}

/// Audit subsystem failures.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Filesystem failure while opening, reading, or appending.
    #[error("audit log: {0}")]
    Io(#[from] std::io::Error),

    /// The last line of an existing log is not a well-formed entry, so the
    /// chain cursor cannot be seeded.
    #[error("audit log {path}: malformed trailing line {line}")]
    CorruptTail {
        /// Log file path.
        path: String,
        /// 1-based line number.
        line: usize,
    },

    /// A record could not be serialized.
    #[error("marshal audit entry: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Verification: a line is not valid JSON.
    #[error("line {line}: invalid JSON: {source}")]
    BadLine {
        /// 1-based line number.
        line: usize,
        /// Parse failure.
        source: serde_json::Error,
    },

    /// Verification: sequence numbers do not increase by one.
    #[error("line {line}: sequence gap: expected {expected}, got {got}")]
    SequenceGap {
        /// 1-based line number.
        line: usize,
        /// Expected sequence number.
        expected: u64,
        /// Sequence number found.
        got: u64,
    },

    /// Verification: an entry's `prev_hash` does not match its predecessor.
    #[error("line {line}: prev_hash mismatch")]
    ChainBroken {
        /// 1-based line number.
        line: usize,
    },

    /// Verification: an entry's recomputed hash differs from its `hash`.
    #[error("line {line}: hash mismatch")]
    HashMismatch {
        /// 1-based line number.
        line: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_hash_is_stable() {
        // SHA-256 of the ASCII bytes "doit-genesis".
        assert_eq!(genesis_hash(), genesis_hash());
        assert_eq!(genesis_hash().len(), 64);
        assert!(genesis_hash().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_compute_hash_ignores_existing_hash() {
        let mut entry = Entry {
            seq: 1,
            time: Utc::now(),
            prev_hash: genesis_hash(),
            pipeline: "echo hi".to_string(),
            segments: vec!["echo".to_string()],
            tiers: vec!["read".to_string()],
            retry: false,
            exit_code: 0,
            error: String::new(),
            duration: 1.25,
            cwd: "/tmp".to_string(),
            policy_level: 0,
            policy_result: String::new(),
            policy_rule_id: String::new(),
            justification: String::new(),
            safety_arg: String::new(),
            hash: String::new(),
        };
        let first = compute_hash(&entry);
        entry.hash = first.clone();
        assert_eq!(compute_hash(&entry), first);

        entry.exit_code = 1;
        assert_ne!(compute_hash(&entry), first);
    }
}
