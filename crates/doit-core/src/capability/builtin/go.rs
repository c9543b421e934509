//! `go` capability with subcommand-dependent effective tier.

use async_trait::async_trait;

use super::run_external;
use crate::capability::{Capability, CapabilityError, ExecContext, Tier};
use crate::io::{BoxedReader, BoxedWriter};

/// The go toolchain. Base tier `build`; `go run`/`go install` and friends
/// execute arbitrary code and gate on `dangerous` at run time.
pub struct Go;

#[async_trait]
impl Capability for Go {
    fn name(&self) -> &'static str {
        "go"
    }

    fn description(&self) -> &'static str {
        "go build, test, vet, and other go commands (tier varies by subcommand)"
    }

    fn tier(&self) -> Tier {
        Tier::Build
    }

    fn validate(&self, args: &[String]) -> Result<(), CapabilityError> {
        if args.is_empty() {
            return Err(CapabilityError::InvalidArgs(
                "go requires a subcommand".to_string(),
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
        run_external(ctx, "go", args, stdin, stdout, stderr).await
    }
}

fn subcommand_tier(subcmd: &str) -> Tier {
    match subcmd {
        "build" | "test" | "vet" | "mod" | "list" | "fmt" | "doc" | "env" | "version"
        | "clean" | "work" => Tier::Build,
        "run" | "generate" | "install" | "tool" | "get" => Tier::Dangerous,
        _ => Tier::Dangerous,
    }
}
