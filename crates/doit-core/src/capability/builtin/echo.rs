//! `echo` capability, implemented in-process.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::capability::{Capability, CapabilityError, ExecContext, Tier};
use crate::io::{BoxedReader, BoxedWriter};

/// Writes its arguments to stdout, space-separated and newline-terminated.
/// Runs in-process; the safe output primitive for agents and pipelines.
pub struct Echo;

#[async_trait]
impl Capability for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn description(&self) -> &'static str {
        "write arguments to stdout"
    }

    fn tier(&self) -> Tier {
        Tier::Read
    }

    fn validate(&self, _args: &[String]) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn run(
        &self,
        _ctx: &ExecContext,
        args: &[String],
        _stdin: BoxedReader,
        mut stdout: BoxedWriter,
        _stderr: BoxedWriter,
    ) -> Result<(), CapabilityError> {
        let mut line = args.join(" ");
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::capability::Registry;

    #[tokio::test]
    async fn test_echo_joins_args() {
        let ctx = ExecContext::new(Arc::new(Registry::new()));
        let (out_w, mut out_r) = tokio::io::duplex(256);

        let args = vec!["hello".to_string(), "world".to_string()];
        Echo.run(
            &ctx,
            &args,
            Box::new(tokio::io::empty()),
            Box::new(out_w),
            Box::new(tokio::io::sink()),
        )
        .await
        .unwrap();

        let mut out = String::new();
        out_r.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world\n");
    }
}
