//! `doit --audit <verify|show|tail>`.

use std::io::Write;

use doit_core::audit::{self, TAIL_DEFAULT};
use doit_core::config::Config;

/// Runs an audit subcommand against the configured log, writing to `out`.
pub fn run(config: &Config, out: &mut impl Write, subcmd: &str) -> i32 {
    match subcmd {
        "verify" => match audit::verify(&config.audit.path) {
            Ok(count) => {
                let _ = writeln!(out, "audit log integrity verified ({count} entries)");
                0
            }
            Err(e) => {
                let _ = writeln!(out, "audit verification FAILED: {e}");
                1
            }
        },
        "show" | "tail" => match audit::tail(&config.audit.path, TAIL_DEFAULT) {
            Ok(entries) if entries.is_empty() => {
                let _ = writeln!(out, "no audit entries");
                0
            }
            Ok(entries) => {
                for entry in entries {
                    match serde_json::to_string_pretty(&entry) {
                        Ok(pretty) => {
                            let _ = writeln!(out, "{pretty}");
                        }
                        Err(e) => {
                            let _ = writeln!(out, "doit audit: {e}");
                        }
                    }
                }
                0
            }
            Err(e) => {
                let _ = writeln!(out, "doit audit: {e}");
                1
            }
        },
        other => {
            let _ = writeln!(out, "doit audit: unknown subcommand \"{other}\"");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use doit_core::audit::{Logger, LogRecord};

    use super::*;

    fn config_with_log(entries: usize) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.audit.path = dir.path().join("audit.jsonl");

        let logger = Logger::open(&config.audit.path).unwrap();
        for i in 0..entries {
            logger
                .append(LogRecord {
                    pipeline: format!("echo {i}"),
                    segments: vec!["echo".to_string()],
                    tiers: vec!["read".to_string()],
                    duration: Duration::from_millis(1),
                    cwd: "/tmp".to_string(),
                    ..LogRecord::default()
                })
                .unwrap();
        }
        (dir, config)
    }

    #[test]
    fn test_verify_ok_and_failed() {
        let (_dir, config) = config_with_log(3);
        let mut out = Vec::new();
        assert_eq!(run(&config, &mut out, "verify"), 0);
        assert!(String::from_utf8(out).unwrap().contains("verified (3 entries)"));

        // Flip a byte and verification reports the line.
        let data = std::fs::read_to_string(&config.audit.path).unwrap();
        std::fs::write(&config.audit.path, data.replace("echo 1", "echo X")).unwrap();
        let mut out = Vec::new();
        assert_eq!(run(&config, &mut out, "verify"), 1);
        assert!(String::from_utf8(out).unwrap().contains("FAILED"));
    }

    #[test]
    fn test_tail_shows_entries() {
        let (_dir, config) = config_with_log(2);
        let mut out = Vec::new();
        assert_eq!(run(&config, &mut out, "tail"), 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"seq\": 1"));
        assert!(text.contains("\"seq\": 2"));
    }

    #[test]
    fn test_tail_empty_log() {
        let (_dir, config) = config_with_log(0);
        let mut out = Vec::new();
        assert_eq!(run(&config, &mut out, "show"), 0);
        assert!(String::from_utf8(out).unwrap().contains("no audit entries"));
    }

    #[test]
    fn test_unknown_subcommand() {
        let (_dir, config) = config_with_log(0);
        let mut out = Vec::new();
        assert_eq!(run(&config, &mut out, "rotate"), 1);
    }
}
