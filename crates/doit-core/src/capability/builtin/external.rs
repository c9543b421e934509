//! Shared subprocess runner for capabilities that wrap external binaries.

use std::io;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::capability::{CapabilityError, ExecContext};
use crate::io::{BoxedReader, BoxedWriter};

/// Executes an external command with streamed I/O under the context's
/// cancellation scope.
///
/// A non-zero child status is returned as [`CapabilityError::ChildExit`] so
/// callers can propagate the code without extra messaging; the child
/// already wrote its own stderr. Cancellation kills the child and returns
/// [`CapabilityError::Cancelled`].
pub(crate) async fn run_external(
    ctx: &ExecContext,
    program: &str,
    args: &[String],
    mut stdin: BoxedReader,
    mut stdout: BoxedWriter,
    mut stderr: BoxedWriter,
) -> Result<(), CapabilityError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &ctx.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &ctx.env {
        cmd.env_clear();
        cmd.envs(env);
    }

    let mut child = cmd.spawn()?;

    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("child stdin not captured"))?;
    let mut child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout not captured"))?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr not captured"))?;

    // The stdin pump runs detached: an upstream segment may keep the pipe
    // open after the child exits (head-style consumers), and the copy ends
    // on its own with EPIPE once the child is gone.
    let stdin_pump = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut stdin, &mut child_stdin).await;
        let _ = child_stdin.shutdown().await;
    });

    let result = {
        let run = async {
            let out = tokio::io::copy(&mut child_stdout, &mut stdout);
            let err = tokio::io::copy(&mut child_stderr, &mut stderr);
            let _ = tokio::join!(out, err);
            child.wait().await
        };
        tokio::pin!(run);

        tokio::select! {
            status = &mut run => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(CapabilityError::ChildExit(exit_code_of(status))),
                Err(e) => Err(CapabilityError::Io(e)),
            },
            () = ctx.cancel.cancelled() => Err(CapabilityError::Cancelled),
        }
    };

    if matches!(result, Err(CapabilityError::Cancelled)) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    stdin_pump.abort();

    result
}

/// Shell convention for a signal-terminated child: 128 + signal number.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::capability::Registry;

    fn test_ctx() -> ExecContext {
        ExecContext::new(Arc::new(Registry::new()))
    }

    #[tokio::test]
    async fn test_run_external_streams_stdout() {
        let ctx = test_ctx();
        let mut out = Vec::new();
        {
            let (stdout_w, mut stdout_r) = tokio::io::duplex(4096);
            let args = vec!["hello".to_string()];
            let run = run_external(
                &ctx,
                "echo",
                &args,
                Box::new(tokio::io::empty()),
                Box::new(stdout_w),
                Box::new(tokio::io::sink()),
            );
            let read = tokio::io::copy(&mut stdout_r, &mut out);
            let (res, _) = tokio::join!(run, read);
            res.unwrap();
        }
        assert_eq!(out, b"hello\n");
    }

    #[tokio::test]
    async fn test_run_external_nonzero_exit() {
        let ctx = test_ctx();
        let err = run_external(
            &ctx,
            "false",
            &[],
            Box::new(tokio::io::empty()),
            Box::new(tokio::io::sink()),
            Box::new(tokio::io::sink()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.child_exit_code(), Some(1));
    }

    #[tokio::test]
    async fn test_run_external_propagates_exact_code() {
        let ctx = test_ctx();
        let args = vec!["-c".to_string(), "exit 7".to_string()];
        let err = run_external(
            &ctx,
            "sh",
            &args,
            Box::new(tokio::io::empty()),
            Box::new(tokio::io::sink()),
            Box::new(tokio::io::sink()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.child_exit_code(), Some(7));
        assert!(err.is_silent());
    }

    #[tokio::test]
    async fn test_run_external_missing_binary() {
        let ctx = test_ctx();
        let err = run_external(
            &ctx,
            "doit-test-no-such-binary",
            &[],
            Box::new(tokio::io::empty()),
            Box::new(tokio::io::sink()),
            Box::new(tokio::io::sink()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CapabilityError::Io(_)));
    }

    #[tokio::test]
    async fn test_run_external_cancelled_within_bound() {
        let ctx = test_ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let args = vec!["30".to_string()];
        let started = std::time::Instant::now();
        let err = run_external(
            &ctx,
            "sleep",
            &args,
            Box::new(tokio::io::empty()),
            Box::new(tokio::io::sink()),
            Box::new(tokio::io::sink()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CapabilityError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
