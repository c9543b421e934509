//! The audit log writer.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use super::{compute_hash, genesis_hash, AuditError, Entry, LogRecord};

struct ChainState {
    seq: u64,
    prev_hash: String,
}

/// Append-only, hash-chained audit log writer.
///
/// A single mutex serializes the sequence counter, the previous-hash
/// cursor, and file appends, so concurrent completions produce strictly
/// increasing sequence numbers.
pub struct Logger {
    path: PathBuf,
    state: Mutex<ChainState>,
}

impl Logger {
    /// Opens (or creates) the audit log at `path`, seeding the sequence and
    /// hash cursor from the last entry of an existing file.
    ///
    /// # Errors
    ///
    /// [`AuditError::Io`] on filesystem failure, or
    /// [`AuditError::CorruptTail`] when the file's last line is not a
    /// well-formed entry; the chain cursor cannot be trusted and callers
    /// should degrade to running without a logger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(dir)?;
            }
            #[cfg(not(unix))]
            std::fs::create_dir_all(dir)?;
        }

        let mut state = ChainState {
            seq: 0,
            prev_hash: genesis_hash(),
        };

        match std::fs::read_to_string(&path) {
            Ok(data) => {
                let lines: Vec<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
                if let Some(last) = lines.last() {
                    let entry: Entry = serde_json::from_str(last).map_err(|_| {
                        AuditError::CorruptTail {
                            path: path.display().to_string(),
                            line: lines.len(),
                        }
                    })?;
                    state.seq = entry.seq;
                    state.prev_hash = entry.hash;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AuditError::Io(e)),
        }

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Appends one record, assigning the next sequence number and linking
    /// the hash chain. The cursor advances only after a successful write.
    ///
    /// # Errors
    ///
    /// [`AuditError::Io`] or [`AuditError::Serialize`]. Callers treat audit
    /// failures as best-effort: they never fail the user's command.
    pub fn append(&self, record: LogRecord) -> Result<Entry, AuditError> {
        let mut state = self.state.lock().expect("audit lock poisoned");

        let mut entry = Entry {
            seq: state.seq + 1,
            time: Utc::now(),
            prev_hash: state.prev_hash.clone(),
            pipeline: record.pipeline,
            segments: record.segments,
            tiers: record.tiers,
            retry: record.retry,
            exit_code: record.exit_code,
            error: record.error,
            duration: record.duration.as_secs_f64() * 1000.0,
            cwd: record.cwd,
            policy_level: 0,
            policy_result: String::new(),
            policy_rule_id: String::new(),
            justification: String::new(),
            safety_arg: String::new(),
            hash: String::new(),
        };
        if let Some(policy) = record.policy {
            entry.policy_level = policy.level;
            entry.policy_result = policy.decision;
            entry.policy_rule_id = policy.rule_id;
            entry.justification = policy.justification;
            entry.safety_arg = policy.safety_arg;
        }
        entry.hash = compute_hash(&entry);

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = {
            let mut opts = OpenOptions::new();
            opts.create(true).append(true).write(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            opts.open(&self.path)?
        };
        file.write_all(&line)?;

        state.seq = entry.seq;
        state.prev_hash = entry.hash.clone();
        Ok(entry)
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::verify;
    use super::*;

    fn record(pipeline: &str) -> LogRecord {
        LogRecord {
            pipeline: pipeline.to_string(),
            segments: vec!["echo".to_string()],
            tiers: vec!["read".to_string()],
            exit_code: 0,
            error: String::new(),
            duration: Duration::from_millis(3),
            cwd: "/tmp".to_string(),
            retry: false,
            policy: None,
        }
    }

    #[test]
    fn test_append_chains_from_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = Logger::open(&path).unwrap();

        let first = logger.append(record("echo one")).unwrap();
        let second = logger.append(record("echo two")).unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(first.prev_hash, genesis_hash());
        assert_eq!(second.seq, 2);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(verify(&path).unwrap(), 2);
    }

    #[test]
    fn test_reopen_seeds_cursor_from_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let first = {
            let logger = Logger::open(&path).unwrap();
            logger.append(record("echo one")).unwrap()
        };

        let logger = Logger::open(&path).unwrap();
        let second = logger.append(record("echo two")).unwrap();
        assert_eq!(second.seq, first.seq + 1);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(verify(&path).unwrap(), 2);
    }

    #[test]
    fn test_open_rejects_malformed_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "{\"seq\": 1, truncated garbage\n").unwrap();

        assert!(matches!(
            Logger::open(&path),
            Err(AuditError::CorruptTail { line: 1, .. })
        ));
    }

    #[test]
    fn test_append_records_policy_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::open(dir.path().join("audit.jsonl")).unwrap();

        let mut rec = record("rm -rf /");
        rec.exit_code = 1;
        rec.error = "refused".to_string();
        rec.policy = Some(crate::policy::EvalInfo {
            level: 1,
            decision: "deny".to_string(),
            rule_id: "deny-rm-catastrophic".to_string(),
            justification: String::new(),
            safety_arg: String::new(),
        });
        let entry = logger.append(rec).unwrap();
        assert_eq!(entry.policy_level, 1);
        assert_eq!(entry.policy_result, "deny");
        assert_eq!(entry.policy_rule_id, "deny-rm-catastrophic");
    }
}
