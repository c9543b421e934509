//! Layered policy engine.
//!
//! Three evaluation levels, consulted in order with short-circuit:
//!
//! 1. [`Level1`]; deterministic rules (hardcoded safety rules plus
//!    config-compiled ones).
//! 2. [`Level2`]: the learned-policy store, matched per segment.
//! 3. [`Level3`]: the LLM gatekeeper.
//!
//! `Deny` anywhere stops the chain. A level with no opinion returns
//! `Escalate` and the next level runs; `Escalate` at the final level
//! surfaces a single-use [approval token](TokenStore) to the caller.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

mod flags;
mod level1;
mod level2;
mod level3;
mod review;
mod store;
mod tokens;

pub use flags::has_any_flag;
pub use level1::{Level1, Rule};
pub use level2::Level2;
pub use level3::{Level3, Prompter};
pub use review::{needs_review, next_review_interval, next_review_time};
pub use store::{default_store_path, load_store, MatchCriteria, ReviewSchedule, StoreEntry};
pub use tokens::{TokenEntry, TokenStore, DEFAULT_TOKEN_TTL};

use crate::capability::{Registry, Tier};
use crate::pipeline::Command;

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The command may proceed.
    Allow,
    /// The command is blocked.
    Deny,
    /// No confident decision; defer to the next level or to a human.
    Escalate,
}

impl Decision {
    /// Canonical lowercase name used in stores and audit records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Escalate => "escalate",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Decision::Allow),
            "deny" => Ok(Decision::Deny),
            "escalate" => Ok(Decision::Escalate),
            other => Err(PolicyError::InvalidDecision(other.to_string())),
        }
    }
}

/// A structured policy decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyResult {
    /// The decision.
    pub decision: Decision,
    /// Which level produced it (1, 2, or 3).
    pub level: u8,
    /// Human-readable explanation.
    pub reason: String,
    /// Identifier of the rule or entry that matched; empty if none.
    pub rule_id: String,
}

/// One segment of a command as seen by the policy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySegment {
    /// Capability name.
    pub cap_name: String,
    /// Segment arguments.
    pub args: Vec<String>,
    /// The capability's base tier.
    pub tier: Tier,
}

/// Structured input to the policy engine.
#[derive(Debug, Clone, Default)]
pub struct PolicyRequest {
    /// Original command string.
    pub command: String,
    /// Every segment of every step, in order.
    pub segments: Vec<PolicySegment>,
    /// Working directory of the request.
    pub cwd: String,
    /// Whether `--retry` was used; bypassable rules and Level 2 are skipped
    /// and Level 3 allows immediately.
    pub retry: bool,
    /// Whether any pipeline redirects stdout to a file.
    pub has_redirect_out: bool,
    /// Why the worker needs this command.
    pub justification: String,
    /// Why the worker believes it is safe.
    pub safety_arg: String,
}

impl PolicyRequest {
    /// Builds a request from a parsed command, resolving each segment's
    /// tier through the registry (unknown capabilities fall back to `read`;
    /// the parser has already rejected them for execution).
    #[must_use]
    pub fn from_command(cmd: &Command, registry: &Registry, cwd: &str, retry: bool) -> Self {
        let segments = cmd
            .segments()
            .map(|seg| PolicySegment {
                cap_name: seg.cap_name.clone(),
                args: seg.args.clone(),
                tier: registry
                    .lookup(&seg.cap_name)
                    .map(|c| c.tier())
                    .unwrap_or(Tier::Read),
            })
            .collect();

        Self {
            command: cmd.render().join(" "),
            segments,
            cwd: cwd.to_string(),
            retry,
            has_redirect_out: cmd.has_redirect_out(),
            justification: String::new(),
            safety_arg: String::new(),
        }
    }
}

/// Policy evaluation metadata carried to the audit record.
#[derive(Debug, Clone, Default)]
pub struct EvalInfo {
    /// Level that decided (1, 2, or 3).
    pub level: u8,
    /// Decision string: "allow", "deny", or "escalate".
    pub decision: String,
    /// Rule identifier.
    pub rule_id: String,
    /// Worker-supplied justification.
    pub justification: String,
    /// Worker-supplied safety argument.
    pub safety_arg: String,
}

impl EvalInfo {
    /// Builds audit metadata from a policy result plus the request's
    /// worker-supplied fields.
    #[must_use]
    pub fn from_result(result: &PolicyResult, req: &PolicyRequest) -> Self {
        Self {
            level: result.level,
            decision: result.decision.to_string(),
            rule_id: result.rule_id.clone(),
            justification: req.justification.clone(),
            safety_arg: req.safety_arg.clone(),
        }
    }
}

/// Policy subsystem failures.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Reading the learned-policy store failed.
    #[error("read learned policy: {0}")]
    Io(#[from] std::io::Error),

    /// The learned-policy store is not valid YAML.
    #[error("parse learned policy {path}: {source}")]
    Parse {
        /// Store file path.
        path: String,
        /// YAML failure.
        source: serde_yaml::Error,
    },

    /// A store entry is missing its identifier.
    #[error("learned policy {path}: entry {index}: missing id")]
    MissingId {
        /// Store file path.
        path: String,
        /// Zero-based entry index.
        index: usize,
    },

    /// A store entry has no `match.cap`.
    #[error("learned policy {path}: entry \"{id}\": match.cap is required")]
    MissingCap {
        /// Store file path.
        path: String,
        /// The entry's id.
        id: String,
    },

    /// A decision string outside the closed allow/deny/escalate set.
    #[error("invalid decision \"{0}\" (want allow, deny, or escalate)")]
    InvalidDecision(String),

    /// Token lookup failed: never issued, already used, or purged.
    #[error("unknown or expired approval token")]
    UnknownToken,

    /// The token was found but is past its expiry.
    #[error("approval token expired")]
    TokenExpired,

    /// The token was issued for a different argv.
    #[error("approval token args mismatch")]
    TokenArgsMismatch,
}

/// Loads Level 2 from a store file, emitting a warning for every approved
/// entry that is overdue for review.
///
/// # Errors
///
/// Any [`load_store`] failure; callers typically disable the level with a
/// warning rather than abort.
pub fn level2_from_store(path: &std::path::Path) -> Result<Level2, PolicyError> {
    let entries = load_store(path)?;
    for entry in &entries {
        if !entry.approved {
            continue;
        }
        if let Some(next) = entry.review.next_review {
            if needs_review(next) {
                tracing::warn!(
                    id = %entry.id,
                    due = %next.format("%Y-%m-%d"),
                    "learned policy is overdue for review"
                );
            }
        }
    }
    Ok(Level2::new(entries))
}

/// The composed policy chain. Levels are optional; a `Deny` or `Allow`
/// short-circuits, `Escalate` falls through, and a Level 3 result is final.
pub struct PolicyEngine {
    level1: Option<Level1>,
    level2: Option<Level2>,
    level3: Option<Level3>,
}

impl PolicyEngine {
    /// Composes a chain from whichever levels are configured.
    #[must_use]
    pub fn new(level1: Option<Level1>, level2: Option<Level2>, level3: Option<Level3>) -> Self {
        Self {
            level1,
            level2,
            level3,
        }
    }

    /// Whether any level is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.level1.is_some() || self.level2.is_some() || self.level3.is_some()
    }

    /// Evaluates the chain. Returns `None` when no level is configured.
    pub async fn evaluate(&self, req: &PolicyRequest) -> Option<PolicyResult> {
        let mut last = None;

        if let Some(l1) = &self.level1 {
            let result = l1.evaluate(req);
            if result.decision != Decision::Escalate {
                return Some(result);
            }
            last = Some(result);
        }

        if let Some(l2) = &self.level2 {
            let result = l2.evaluate(req);
            if result.decision != Decision::Escalate {
                return Some(result);
            }
            last = Some(result);
        }

        if let Some(l3) = &self.level3 {
            return Some(l3.evaluate(req).await);
        }

        last
    }
}
