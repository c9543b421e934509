//! Capability model: safety tiers, the capability trait, and the registry.
//!
//! A capability is a named executor with a fixed base safety [`Tier`], a
//! structural argument check, and a streaming `run` body. Capabilities are
//! registered once at daemon startup; the [`Registry`] is concurrently
//! readable for the daemon's lifetime.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::io::{BoxedReader, BoxedWriter};

pub mod builtin;
mod registry;

pub use registry::Registry;

/// Safety classification of a capability, ordered from least to most
/// dangerous. Each tier is independently enabled or disabled in the
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Read-only operations (grep, cat, find, ls).
    Read,
    /// Build/compile operations (make, go build).
    Build,
    /// File mutations (cp, mv, mkdir, tee).
    Write,
    /// Destructive operations (rm, chmod, git push).
    Dangerous,
}

impl Tier {
    /// All tiers in ascending order of danger.
    pub const ALL: [Tier; 4] = [Tier::Read, Tier::Build, Tier::Write, Tier::Dangerous];

    /// Canonical lowercase name used in config, audit records, and the CLI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Tier::Read => "read",
            Tier::Build => "build",
            Tier::Write => "write",
            Tier::Dangerous => "dangerous",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = CapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Tier::Read),
            "build" => Ok(Tier::Build),
            "write" => Ok(Tier::Write),
            "dangerous" => Ok(Tier::Dangerous),
            other => Err(CapabilityError::UnknownTier(other.to_string())),
        }
    }
}

/// Errors surfaced by capability lookup, validation, and execution.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// No capability registered under this name.
    #[error("unknown capability: \"{0}\"")]
    Unknown(String),

    /// A tier name that is not one of read/build/write/dangerous.
    #[error("unknown tier: \"{0}\"")]
    UnknownTier(String),

    /// The capability's (effective) tier is disabled in the registry.
    #[error("tier \"{0}\" is disabled")]
    TierDisabled(Tier),

    /// Structural argument validation failed.
    #[error("{0}")]
    InvalidArgs(String),

    /// The child process exited with a non-zero status. The code is
    /// propagated verbatim; the child already wrote its own stderr.
    #[error("command exited with status {0}")]
    ChildExit(i32),

    /// The surrounding cancellation scope was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// An I/O failure while streaming or spawning.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CapabilityError {
    /// Exit code carried by a [`CapabilityError::ChildExit`], if any.
    #[must_use]
    pub const fn child_exit_code(&self) -> Option<i32> {
        match self {
            CapabilityError::ChildExit(code) => Some(*code),
            _ => None,
        }
    }

    /// Process exit code this error maps to: the child's own code verbatim,
    /// 130 for an interrupt, 1 for lookup/tier/validation failures, and 2
    /// for internal failures.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            CapabilityError::ChildExit(code) => *code,
            CapabilityError::Cancelled => 130,
            CapabilityError::Unknown(_)
            | CapabilityError::UnknownTier(_)
            | CapabilityError::TierDisabled(_)
            | CapabilityError::InvalidArgs(_) => 1,
            CapabilityError::Io(_) => 2,
        }
    }

    /// Whether doit should stay quiet about this error. A non-zero child
    /// exit already wrote its own stderr; adding more is noise.
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(self, CapabilityError::ChildExit(_))
    }
}

/// Per-request execution bundle passed explicitly through the call chain.
///
/// The daemon serves many requests concurrently; everything a capability
/// needs at run time (registry for tier gates, working directory, curated
/// child environment, cancellation scope) travels here rather than in
/// process globals.
#[derive(Clone)]
pub struct ExecContext {
    /// Capability registry, consulted by subcommand-dispatched capabilities
    /// for their effective tier gate.
    pub registry: Arc<Registry>,
    /// Working directory for child processes, if the request carried one.
    pub cwd: Option<PathBuf>,
    /// Curated child environment; `None` inherits the daemon's own.
    pub env: Option<HashMap<String, String>>,
    /// Cancellation scope for this request.
    pub cancel: CancellationToken,
}

impl ExecContext {
    /// Creates a context with no cwd/env override and a fresh root scope.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            cwd: None,
            env: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the child working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the curated child environment.
    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Replaces the cancellation scope.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Derives a child context whose scope is cancelled with (or before)
    /// this one. Pipeline workers run under such a child scope so the first
    /// failure can tear down its siblings without touching the request.
    #[must_use]
    pub fn child_scope(&self) -> Self {
        let mut child = self.clone();
        child.cancel = self.cancel.child_token();
        child
    }
}

/// A named, tier-classified executor invoked by a pipeline segment.
///
/// Implementations vary only in the `run` body (subprocess exec vs.
/// in-process code); a few compute a stricter effective tier from their
/// arguments and consult the registry's tier gate before exec.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Identifier used in pipelines and the CLI.
    fn name(&self) -> &'static str;

    /// Human-readable summary for help output.
    fn description(&self) -> &'static str;

    /// Base safety classification.
    fn tier(&self) -> Tier;

    /// Structural argument check, called before `run`.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::InvalidArgs`] describing the problem.
    fn validate(&self, args: &[String]) -> Result<(), CapabilityError>;

    /// Executes the capability, streaming stdin through to stdout.
    ///
    /// Dropping `stdout` signals EOF to a downstream pipeline segment, so
    /// implementations must not hold it past completion.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::ChildExit`] for a non-zero child status,
    /// [`CapabilityError::Cancelled`] when the context's scope fires, or
    /// any other variant for setup failures.
    async fn run(
        &self,
        ctx: &ExecContext,
        args: &[String],
        stdin: BoxedReader,
        stdout: BoxedWriter,
        stderr: BoxedWriter,
    ) -> Result<(), CapabilityError>;
}
