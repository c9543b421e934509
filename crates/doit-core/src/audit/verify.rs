//! Independent audit chain verifier and tail reader.

use std::path::Path;

use super::{compute_hash, genesis_hash, AuditError, Entry};

/// Reads the log top to bottom, recomputing every hash and checking both
/// the chain link and the sequence increment. Returns the number of valid
/// entries; a missing or empty log verifies as zero entries.
///
/// # Errors
///
/// The first violation, as [`AuditError::BadLine`],
/// [`AuditError::SequenceGap`], [`AuditError::ChainBroken`], or
/// [`AuditError::HashMismatch`], each naming the offending line.
pub fn verify(path: impl AsRef<Path>) -> Result<u64, AuditError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(AuditError::Io(e)),
    };

    let mut expected_prev = genesis_hash();
    let mut prev_seq = 0u64;
    let mut count = 0u64;

    for (i, raw) in data.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        let line = i + 1;
        let entry: Entry =
            serde_json::from_str(raw).map_err(|source| AuditError::BadLine { line, source })?;

        if entry.seq != prev_seq + 1 {
            return Err(AuditError::SequenceGap {
                line,
                expected: prev_seq + 1,
                got: entry.seq,
            });
        }
        if entry.prev_hash != expected_prev {
            return Err(AuditError::ChainBroken { line });
        }
        if compute_hash(&entry) != entry.hash {
            return Err(AuditError::HashMismatch { line });
        }

        expected_prev = entry.hash.clone();
        prev_seq = entry.seq;
        count += 1;
    }

    Ok(count)
}

/// Returns the last `n` entries. Malformed lines are skipped silently; the
/// chain is not required to be valid. A missing log yields no entries.
///
/// # Errors
///
/// [`AuditError::Io`] on a read failure other than a missing file.
pub fn tail(path: impl AsRef<Path>, n: usize) -> Result<Vec<Entry>, AuditError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AuditError::Io(e)),
    };

    let entries: Vec<Entry> = data
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();

    let skip = entries.len().saturating_sub(n);
    Ok(entries.into_iter().skip(skip).collect())
}
