//! The shell-free pipeline language.
//!
//! Commands use Unicode operators that no shell treats as metacharacters,
//! so they survive unquoted in bash/zsh/fish:
//!
//! | meaning | token |
//! |---|---|
//! | pipe | `¦` U+00A6 |
//! | stdin from file | `‹` U+2039 |
//! | stdout to file | `›` U+203A |
//! | and-then | `＆＆` U+FF06 ×2 |
//! | or-else | `‖` U+2016 |
//! | sequential | `；` U+FF1B |
//!
//! A token stream parses into a [`Command`] of [`Step`]s, each holding a
//! [`Pipeline`] of [`Segment`]s plus the connector that follows it.

use std::fmt;
use std::path::PathBuf;

mod executor;
mod parser;

pub use executor::{execute_command, execute_pipeline};
pub use parser::{parse_command, parse_pipeline, ParseError};

use crate::capability::{CapabilityError, Registry, Tier};

/// Pipe between two segments (stdout → stdin).
pub const OP_PIPE: &str = "\u{00A6}";
/// Redirect the pipeline's stdin from a file.
pub const OP_REDIRECT_IN: &str = "\u{2039}";
/// Redirect the pipeline's stdout to a file.
pub const OP_REDIRECT_OUT: &str = "\u{203A}";
/// Run the next step only if this one succeeded.
pub const OP_AND_THEN: &str = "\u{FF06}\u{FF06}";
/// Run the next step only if this one failed.
pub const OP_OR_ELSE: &str = "\u{2016}";
/// Run the next step regardless of this one's outcome.
pub const OP_SEQUENTIAL: &str = "\u{FF1B}";

/// One capability invocation: a name plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Capability name (first token of the segment).
    pub cap_name: String,
    /// Remaining tokens.
    pub args: Vec<String>,
}

/// An ordered, non-empty sequence of segments joined by pipes, with at most
/// one stdin and one stdout redirect scoped to the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pipeline {
    /// The piped segments, in order.
    pub segments: Vec<Segment>,
    /// File to read stdin from, if redirected.
    pub redirect_in: Option<PathBuf>,
    /// File to write stdout to, if redirected.
    pub redirect_out: Option<PathBuf>,
}

/// Compound operator joining two steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// `＆＆`: short-circuit on failure.
    AndThen,
    /// `‖`: run only after a failure.
    OrElse,
    /// `；`: run unconditionally.
    Sequential,
}

impl Connector {
    /// The operator token for this connector.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Connector::AndThen => OP_AND_THEN,
            Connector::OrElse => OP_OR_ELSE,
            Connector::Sequential => OP_SEQUENTIAL,
        }
    }

    /// Parses a token into a connector, if it is one.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            OP_AND_THEN => Some(Connector::AndThen),
            OP_OR_ELSE => Some(Connector::OrElse),
            OP_SEQUENTIAL => Some(Connector::Sequential),
            _ => None,
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One pipeline within a compound command, plus the connector that follows
/// it (`None` on the last step).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// The pipeline to run.
    pub pipeline: Pipeline,
    /// Operator joining this step to the next.
    pub connector: Option<Connector>,
}

/// A parsed compound command: a non-empty ordered sequence of steps.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    /// The steps, in execution order.
    pub steps: Vec<Step>,
}

impl Pipeline {
    fn render_into(&self, tokens: &mut Vec<String>) {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                tokens.push(OP_PIPE.to_string());
            }
            tokens.push(seg.cap_name.clone());
            tokens.extend(seg.args.iter().cloned());
        }
        if let Some(path) = &self.redirect_in {
            tokens.push(OP_REDIRECT_IN.to_string());
            tokens.push(path.display().to_string());
        }
        if let Some(path) = &self.redirect_out {
            tokens.push(OP_REDIRECT_OUT.to_string());
            tokens.push(path.display().to_string());
        }
    }
}

impl Command {
    /// Renders the command back into a token stream. Token layout is
    /// normalized (redirects trail their pipeline) but re-parsing yields a
    /// structurally identical command.
    #[must_use]
    pub fn render(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        for step in &self.steps {
            step.pipeline.render_into(&mut tokens);
            if let Some(conn) = step.connector {
                tokens.push(conn.token().to_string());
            }
        }
        tokens
    }

    /// Iterates over every segment of every step, in order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.steps.iter().flat_map(|s| s.pipeline.segments.iter())
    }

    /// Whether any step's pipeline redirects stdout to a file.
    #[must_use]
    pub fn has_redirect_out(&self) -> bool {
        self.steps.iter().any(|s| s.pipeline.redirect_out.is_some())
    }
}

/// Validates every pipeline of a compound command against the registry:
/// tier enablement (an output redirect requires the `write` tier) and each
/// capability's structural argument check.
///
/// # Errors
///
/// The first failing segment's error, prefixed with its position.
pub fn validate_command(cmd: &Command, registry: &Registry) -> Result<(), CapabilityError> {
    for (i, step) in cmd.steps.iter().enumerate() {
        validate_pipeline(&step.pipeline, registry)
            .map_err(|e| CapabilityError::InvalidArgs(format!("pipeline {i}: {e}")))?;
    }
    Ok(())
}

/// Validates a single pipeline; see [`validate_command`].
///
/// # Errors
///
/// The first failing segment's error.
pub fn validate_pipeline(p: &Pipeline, registry: &Registry) -> Result<(), CapabilityError> {
    if p.redirect_out.is_some() {
        registry
            .check_tier(Tier::Write)
            .map_err(|e| CapabilityError::InvalidArgs(format!("redirect {OP_REDIRECT_OUT}: {e}")))?;
    }
    for (i, seg) in p.segments.iter().enumerate() {
        let cap = registry
            .lookup(&seg.cap_name)
            .map_err(|e| CapabilityError::InvalidArgs(format!("segment {i}: {e}")))?;
        registry
            .check_tier(cap.tier())
            .map_err(|e| CapabilityError::InvalidArgs(format!("segment {i} ({}): {e}", seg.cap_name)))?;
        cap.validate(&seg.args)
            .map_err(|e| CapabilityError::InvalidArgs(format!("segment {i} ({}): {e}", seg.cap_name)))?;
    }
    Ok(())
}
