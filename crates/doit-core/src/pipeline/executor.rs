//! Streaming execution of compound commands.
//!
//! Steps run in order under connector-based flow control. Within a
//! pipeline, every segment runs concurrently, joined by bounded in-memory
//! byte pipes: a writer blocks when its reader falls behind, so no stage
//! buffers the whole stream. The first failure cancels the shared scope and
//! becomes the pipeline's result.

use std::sync::Arc;

use tokio::task::JoinSet;

use super::{Command, Connector, Pipeline};
use crate::capability::{Capability, CapabilityError, ExecContext};
use crate::io::{BoxedReader, BoxedWriter, SharedReader, SharedWriter};

/// Capacity of each inter-segment byte pipe.
const PIPE_BUFFER: usize = 64 * 1024;

/// Runs a compound command, applying connector logic between steps.
///
/// `AndThen` skips the next step after a failure, `OrElse` skips it after a
/// success, `Sequential` always runs it; a skipped step leaves the running
/// error unchanged. Returns the last-executed pipeline's result.
///
/// # Errors
///
/// The error of the last pipeline that actually ran, if it failed.
pub async fn execute_command(
    ctx: &ExecContext,
    cmd: &Command,
    stdin: BoxedReader,
    stdout: BoxedWriter,
    stderr: BoxedWriter,
) -> Result<(), CapabilityError> {
    // Steps share the caller's streams sequentially.
    let stdin = SharedReader::new(stdin);
    let stdout = SharedWriter::new(stdout);
    let stderr = SharedWriter::new(stderr);

    let mut last: Result<(), CapabilityError> = Ok(());
    for (i, step) in cmd.steps.iter().enumerate() {
        if i > 0 {
            match cmd.steps[i - 1].connector {
                Some(Connector::AndThen) if last.is_err() => continue,
                Some(Connector::OrElse) if last.is_ok() => continue,
                _ => {}
            }
        }
        last = execute_pipeline(
            ctx,
            &step.pipeline,
            Box::new(stdin.clone()),
            Box::new(stdout.clone()),
            Box::new(stderr.clone()),
        )
        .await;
    }
    last
}

/// Runs one pipeline, streaming data between its segments.
///
/// Redirects override the caller's stdin/stdout for this pipeline only;
/// file handles are released on every exit path. Each segment runs in its
/// own task under a child cancellation scope; the first error observed
/// cancels the scope and is returned.
///
/// # Errors
///
/// The first segment failure, a redirect open failure, or
/// [`CapabilityError::Cancelled`] when the caller's scope fires.
pub async fn execute_pipeline(
    ctx: &ExecContext,
    p: &Pipeline,
    stdin: BoxedReader,
    stdout: BoxedWriter,
    stderr: BoxedWriter,
) -> Result<(), CapabilityError> {
    let stdin: BoxedReader = match &p.redirect_in {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => stdin,
    };
    let stdout: BoxedWriter = match &p.redirect_out {
        Some(path) => {
            let file = {
                let mut opts = tokio::fs::OpenOptions::new();
                opts.write(true).create(true).truncate(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    opts.mode(0o644);
                }
                opts.open(path).await?
            };
            Box::new(file)
        }
        None => stdout,
    };

    let n = p.segments.len();
    if n == 1 {
        let seg = &p.segments[0];
        let cap = ctx.registry.lookup(&seg.cap_name)?;
        return cap.run(ctx, &seg.args, stdin, stdout, stderr).await;
    }

    // Resolve every capability before spawning anything.
    let caps: Vec<Arc<dyn Capability>> = p
        .segments
        .iter()
        .map(|seg| ctx.registry.lookup(&seg.cap_name))
        .collect::<Result<_, _>>()?;

    // N-1 bounded pipes between N segments. Worker i reads inputs[i] and
    // writes outputs[i]; dropping a pipe's write half is EOF downstream,
    // dropping its read half fails a blocked upstream writer.
    let mut inputs: Vec<BoxedReader> = Vec::with_capacity(n);
    let mut outputs: Vec<BoxedWriter> = Vec::with_capacity(n);
    inputs.push(stdin);
    for _ in 1..n {
        let (write_half, read_half) = tokio::io::duplex(PIPE_BUFFER);
        outputs.push(Box::new(write_half));
        inputs.push(Box::new(read_half));
    }
    outputs.push(stdout);

    let scope = ctx.child_scope();
    let stderr = SharedWriter::new(stderr);

    let mut workers: JoinSet<Result<(), CapabilityError>> = JoinSet::new();
    for ((cap, seg), (input, output)) in caps
        .into_iter()
        .zip(&p.segments)
        .zip(inputs.into_iter().zip(outputs))
    {
        let args = seg.args.clone();
        let worker_ctx = scope.clone();
        let worker_stderr: BoxedWriter = Box::new(stderr.clone());
        workers.spawn(async move {
            // Pipe halves drop with the worker, closing both directions.
            cap.run(&worker_ctx, &args, input, output, worker_stderr).await
        });
    }

    let mut first_err: Option<CapabilityError> = None;
    while let Some(joined) = workers.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(join_err) => Err(CapabilityError::Io(std::io::Error::other(join_err))),
        };
        if let Err(e) = result {
            if first_err.is_none() {
                scope.cancel.cancel();
                first_err = Some(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
