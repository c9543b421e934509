//! `git` capability with subcommand-dependent effective tier.

use async_trait::async_trait;

use super::run_external;
use crate::capability::{Capability, CapabilityError, ExecContext, Tier};
use crate::io::{BoxedReader, BoxedWriter};

/// Git version control. The base tier is `read`; the effective tier is
/// computed from the subcommand and checked against the registry's tier
/// gate before exec.
pub struct Git;

#[async_trait]
impl Capability for Git {
    fn name(&self) -> &'static str {
        "git"
    }

    fn description(&self) -> &'static str {
        "git version control (tier varies by subcommand)"
    }

    fn tier(&self) -> Tier {
        Tier::Read
    }

    fn validate(&self, args: &[String]) -> Result<(), CapabilityError> {
        if args.is_empty() {
            return Err(CapabilityError::InvalidArgs(
                "git requires a subcommand".to_string(),
            ));
        }
        Ok(())
    }

    async fn run(
        &self,
        ctx: &ExecContext,
        args: &[String],
        stdin: BoxedReader,
        stdout: BoxedWriter,
        stderr: BoxedWriter,
    ) -> Result<(), CapabilityError> {
        if let Some(subcmd) = args.first() {
            ctx.registry.check_tier(subcommand_tier(subcmd))?;
        }
        run_external(ctx, "git", args, stdin, stdout, stderr).await
    }
}

/// Effective tier of a git subcommand. Unknown subcommands default to
/// `dangerous`.
fn subcommand_tier(subcmd: &str) -> Tier {
    match subcmd {
        // stash list is read, but stash push/pop is write
        "status" | "log" | "diff" | "show" | "branch" | "tag" | "remote" | "rev-parse"
        | "blame" | "ls-files" | "ls-tree" | "shortlog" | "describe" | "config" | "reflog"
        | "stash" => Tier::Read,
        "add" | "commit" | "checkout" | "switch" | "merge" | "rebase" | "cherry-pick"
        | "fetch" | "pull" | "mv" | "rm" => Tier::Write,
        "push" | "reset" | "clean" | "gc" | "filter-branch" => Tier::Dangerous,
        _ => Tier::Dangerous,
    }
}
