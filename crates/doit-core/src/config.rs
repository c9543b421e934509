//! The `~/.config/doit/config.yaml` configuration surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::{Registry, Tier};

/// Idle shutdown applied when `daemon.idle_timeout` is absent or
/// unparseable.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid YAML for the config schema.
    #[error("parse config {path}: {source}")]
    Parse {
        /// Config file path.
        path: String,
        /// YAML failure.
        source: serde_yaml::Error,
    },
}

/// One capability's rules from config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CapRuleConfig {
    /// Flags rejected for the capability as a whole.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reject_flags: Vec<String>,
    /// Rules scoped to a first-positional subcommand.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subcommands: BTreeMap<String, SubRuleConfig>,
}

/// Rules for one subcommand of a capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubRuleConfig {
    /// Flags rejected for this subcommand.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reject_flags: Vec<String>,
}

/// Which safety tiers are enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TierConfig {
    /// Enable `read`.
    pub read: bool,
    /// Enable `build`.
    pub build: bool,
    /// Enable `write`.
    pub write: bool,
    /// Enable `dangerous`.
    pub dangerous: bool,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            read: true,
            build: true,
            write: true,
            dangerous: false,
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Log location; a leading `~` expands to the home directory.
    pub path: PathBuf,
    /// Recognized but not enforced; rotation is out of scope.
    pub max_size_mb: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: home_join(&[".local", "share", "doit", "audit.jsonl"]),
            max_size_mb: 100,
        }
    }
}

/// Daemon behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// `None` = auto (try the daemon, fall back in-process), `Some(true)` =
    /// require the daemon, `Some(false)` = always in-process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Idle shutdown as a humantime string, e.g. `"5m"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,
}

impl DaemonConfig {
    /// The configured idle timeout, or the default when absent or
    /// unparseable.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
            .unwrap_or(DEFAULT_IDLE_TIMEOUT)
    }
}

/// Policy engine switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Enable Level 1 (deterministic rules).
    pub level1_enabled: bool,
    /// Enable Level 2 (learned-policy store).
    pub level2_enabled: bool,
    /// Store location override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level2_path: Option<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            level1_enabled: true,
            level2_enabled: false,
            level2_path: None,
        }
    }
}

/// The global doit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Tier enable switches.
    pub tiers: TierConfig,
    /// Audit settings.
    pub audit: AuditConfig,
    /// Per-capability rules; `None` means use [`Config::default_rules`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<BTreeMap<String, CapRuleConfig>>,
    /// Daemon settings.
    pub daemon: DaemonConfig,
    /// Policy settings.
    pub policy: PolicyConfig,
}

impl Config {
    /// Loads from the standard location; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for an unreadable or malformed file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::config_path())
    }

    /// Loads from `path`; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for an unreadable or malformed file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let mut config: Self =
            serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        config.audit.path = expand_home(&config.audit.path);
        if let Some(store) = config.policy.level2_path.take() {
            config.policy.level2_path = Some(expand_home(&store));
        }
        Ok(config)
    }

    /// The standard config file path: `~/.config/doit/config.yaml`.
    #[must_use]
    pub fn config_path() -> PathBuf {
        home_join(&[".config", "doit", "config.yaml"])
    }

    /// The built-in argument-level rules used when the config supplies
    /// none: `make -j` is rejected, as are force pushes and hard resets.
    #[must_use]
    pub fn default_rules() -> BTreeMap<String, CapRuleConfig> {
        let mut rules = BTreeMap::new();
        rules.insert(
            "make".to_string(),
            CapRuleConfig {
                reject_flags: vec!["-j".to_string()],
                subcommands: BTreeMap::new(),
            },
        );
        let mut git_subs = BTreeMap::new();
        git_subs.insert(
            "push".to_string(),
            SubRuleConfig {
                reject_flags: vec![
                    "--force".to_string(),
                    "-f".to_string(),
                    "--force-with-lease".to_string(),
                ],
            },
        );
        git_subs.insert(
            "reset".to_string(),
            SubRuleConfig {
                reject_flags: vec!["--hard".to_string()],
            },
        );
        rules.insert(
            "git".to_string(),
            CapRuleConfig {
                reject_flags: Vec::new(),
                subcommands: git_subs,
            },
        );
        rules
    }

    /// The effective rule table: configured rules, or the defaults.
    #[must_use]
    pub fn effective_rules(&self) -> BTreeMap<String, CapRuleConfig> {
        self.rules.clone().unwrap_or_else(Self::default_rules)
    }

    /// Applies the tier switches to a registry.
    pub fn apply_tiers(&self, registry: &Registry) {
        registry.set_tier(Tier::Read, self.tiers.read);
        registry.set_tier(Tier::Build, self.tiers.build);
        registry.set_tier(Tier::Write, self.tiers.write);
        registry.set_tier(Tier::Dangerous, self.tiers.dangerous);
    }
}

fn home_join(parts: &[&str]) -> PathBuf {
    let mut path = directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    for part in parts {
        path.push(part);
    }
    path
}

fn expand_home(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = s.strip_prefix("~/") {
        return home_join(&[]).join(rest);
    }
    if s == "~" {
        return home_join(&[]);
    }
    path.to_path_buf()
}
