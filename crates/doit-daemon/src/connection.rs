//! Per-connection protocol handling.
//!
//! One connection carries one command invocation: the request frame, then
//! free-order stdin/signal frames inbound and stdout/stderr frames
//! outbound, closed by a single exit frame. Three concurrent workers hang
//! off the connection while a command runs: a demux reading client frames,
//! and one framer per output stream. The framers and the final exit writer
//! share a mutex on the connection's write half so frames never interleave
//! mid-frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use doit_core::audit::LogRecord;
use doit_core::capability::{CapabilityError, ExecContext};
use doit_core::io::{BoxedReader, BoxedWriter};
use doit_core::ipc::{ExitResult, Frame, FrameCodec, FrameTag, ProtocolError, Request, SignalMsg, SIGNAL_INT};
use doit_core::pipeline::{self, Command};
use doit_core::policy::{Decision, EvalInfo, PolicyRequest};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::server::Server;

/// Buffer size of the stdin/stdout/stderr relay pipes.
const RELAY_PIPE_BUFFER: usize = 32 * 1024;

/// Chunk size for output framing.
const FRAME_CHUNK: usize = 32 * 1024;

/// Serializes frame writes from the two output framers and the exit
/// writer.
#[derive(Clone)]
struct FrameSink {
    inner: Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>>,
}

impl FrameSink {
    fn new(write_half: OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                write_half,
                FrameCodec::new(),
            ))),
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        self.inner.lock().await.send(frame).await
    }

    async fn exit(&self, result: &ExitResult) {
        match Frame::json(FrameTag::Exit, result) {
            Ok(frame) => {
                if let Err(e) = self.send(frame).await {
                    debug!("exit frame not delivered: {e}");
                }
            }
            Err(e) => debug!("exit frame not encoded: {e}"),
        }
    }
}

/// Handles one connection end to end.
pub(crate) async fn handle(server: &Server, stream: UnixStream, cancel: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    let sink = FrameSink::new(write_half);

    // The first frame must be the request.
    let request = match read_request(&mut frames).await {
        Ok(request) => request,
        Err(reason) => {
            sink.exit(&ExitResult {
                code: 2,
                error: format!("doit: {reason}"),
                ..ExitResult::default()
            })
            .await;
            return;
        }
    };

    let command = match pipeline::parse_command(&request.args, &server.registry) {
        Ok(command) => command,
        Err(e) => {
            sink.exit(&ExitResult {
                code: 1,
                error: format!("doit: {e}"),
                ..ExitResult::default()
            })
            .await;
            return;
        }
    };

    // Policy first, so a catastrophic command reports its denial rather
    // than a tier or validation message.
    let eval_info = match authorize(server, &request, &command, &sink).await {
        Authorization::Proceed(info) => info,
        Authorization::Refused => return,
    };

    if let Err(e) = pipeline::validate_command(&command, &server.registry) {
        sink.exit(&ExitResult {
            code: 1,
            error: format!("doit: {e}"),
            ..ExitResult::default()
        })
        .await;
        return;
    }

    run_command(server, &request, &command, eval_info, frames, &sink, cancel).await;
}

async fn read_request(
    frames: &mut FramedRead<tokio::net::unix::OwnedReadHalf, FrameCodec>,
) -> Result<Request, String> {
    let frame = match frames.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(format!("read request: {e}")),
        None => return Err("connection closed before request".to_string()),
    };
    if frame.tag != FrameTag::Request {
        return Err(format!(
            "expected request frame (0x{:02x}), got 0x{:02x}",
            FrameTag::Request.as_u8(),
            frame.tag.as_u8()
        ));
    }
    frame
        .parse_json::<Request>()
        .map_err(|e| format!("unmarshal request: {e}"))
}

enum Authorization {
    /// Run the command, carrying this metadata into the audit record.
    Proceed(Option<EvalInfo>),
    /// An exit frame was already sent; the command does not run.
    Refused,
}

/// Evaluates the approval token or the policy chain. Denials and terminal
/// escalations emit their exit frame (and audit record) here.
async fn authorize(
    server: &Server,
    request: &Request,
    command: &Command,
    sink: &FrameSink,
) -> Authorization {
    let mut policy_req =
        PolicyRequest::from_command(command, &server.registry, &request.cwd, request.retry);
    policy_req.command = request.args.join(" ");
    policy_req.justification = request.justification.clone();
    policy_req.safety_arg = request.safety_arg.clone();

    // A validated token skips policy entirely for this one execution.
    if let Some(token) = &request.approved {
        return match server.tokens.validate(token, &request.args) {
            Ok(_entry) => Authorization::Proceed(Some(EvalInfo {
                level: 3,
                decision: Decision::Allow.to_string(),
                rule_id: "approval-token".to_string(),
                justification: request.justification.clone(),
                safety_arg: request.safety_arg.clone(),
            })),
            Err(e) => {
                audit_policy(
                    server,
                    request,
                    command,
                    &EvalInfo {
                        level: 3,
                        decision: Decision::Deny.to_string(),
                        rule_id: "approval-token".to_string(),
                        justification: request.justification.clone(),
                        safety_arg: request.safety_arg.clone(),
                    },
                    &e.to_string(),
                );
                sink.exit(&ExitResult {
                    code: 1,
                    error: format!("doit: policy: {e}"),
                    policy_deny: "approval-token".to_string(),
                    ..ExitResult::default()
                })
                .await;
                Authorization::Refused
            }
        };
    }

    let Some(result) = server.policy.evaluate(&policy_req).await else {
        return Authorization::Proceed(None);
    };
    let info = EvalInfo::from_result(&result, &policy_req);

    match result.decision {
        Decision::Allow => Authorization::Proceed(Some(info)),
        Decision::Deny => {
            audit_policy(server, request, command, &info, &result.reason);
            sink.exit(&ExitResult {
                code: 1,
                error: format!("doit: policy: {}", result.reason),
                policy_deny: result.rule_id,
                ..ExitResult::default()
            })
            .await;
            Authorization::Refused
        }
        Decision::Escalate => {
            // Terminal escalation: issue a fresh approval token and hand it
            // back; the command does not run.
            let token = server.tokens.issue(&policy_req.command, &request.args);
            audit_policy(server, request, command, &info, &result.reason);
            sink.exit(&ExitResult {
                code: 1,
                error: format!("doit: policy: approval required: {}", result.reason),
                policy_escalate: token,
                ..ExitResult::default()
            })
            .await;
            Authorization::Refused
        }
    }
}

async fn run_command(
    server: &Server,
    request: &Request,
    command: &Command,
    eval_info: Option<EvalInfo>,
    frames: FramedRead<tokio::net::unix::OwnedReadHalf, FrameCodec>,
    sink: &FrameSink,
    cancel: CancellationToken,
) {
    let req_cancel = cancel.child_token();

    // Stdin pipe: the demux writes into it, the engine reads from it.
    let (stdin_w, stdin_r) = tokio::io::duplex(RELAY_PIPE_BUFFER);
    let demux = tokio::spawn(demux_frames(frames, stdin_w, req_cancel.clone()));

    // Output pipes, framed back to the client through the shared sink.
    let (stdout_w, stdout_r) = tokio::io::duplex(RELAY_PIPE_BUFFER);
    let (stderr_w, stderr_r) = tokio::io::duplex(RELAY_PIPE_BUFFER);
    let stdout_pump = tokio::spawn(pump_frames(stdout_r, sink.clone(), FrameTag::StdoutData));
    let stderr_pump = tokio::spawn(pump_frames(stderr_r, sink.clone(), FrameTag::StderrData));

    let ctx = {
        let mut ctx = ExecContext::new(Arc::clone(&server.registry)).with_cancel(req_cancel);
        if !request.cwd.is_empty() {
            ctx = ctx.with_cwd(&request.cwd);
        }
        if !request.env.is_empty() {
            ctx = ctx.with_env(request.env.clone());
        }
        ctx
    };

    let started = Instant::now();
    let result = pipeline::execute_command(
        &ctx,
        command,
        Box::new(stdin_r) as BoxedReader,
        Box::new(stdout_w) as BoxedWriter,
        Box::new(stderr_w) as BoxedWriter,
    )
    .await;
    let duration = started.elapsed();

    // The engine dropped its writer clones; the pumps drain to EOF so every
    // output frame precedes the exit frame.
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;
    demux.abort();

    let (code, error) = match &result {
        Ok(()) => (0, String::new()),
        Err(e) if e.is_silent() => (e.exit_code(), String::new()),
        Err(e) => (e.exit_code(), format!("doit: {e}")),
    };

    audit_completion(server, request, command, eval_info, code, &result, duration);

    sink.exit(&ExitResult {
        code,
        error,
        ..ExitResult::default()
    })
    .await;
}

/// Reads client frames for the lifetime of a command: stdin bytes into the
/// pipe, stdin-EOF closes it, an interrupt signal cancels the request's
/// scope. Unknown inbound frames are ignored.
async fn demux_frames(
    mut frames: FramedRead<tokio::net::unix::OwnedReadHalf, FrameCodec>,
    stdin_w: tokio::io::DuplexStream,
    cancel: CancellationToken,
) {
    let mut stdin_w = Some(stdin_w);
    while let Some(frame) = frames.next().await {
        let Ok(frame) = frame else { break };
        match frame.tag {
            FrameTag::StdinData => {
                if let Some(writer) = stdin_w.as_mut() {
                    if writer.write_all(&frame.payload).await.is_err() {
                        stdin_w = None;
                    }
                }
            }
            FrameTag::StdinEof => {
                stdin_w = None;
            }
            FrameTag::Signal => {
                if let Ok(msg) = frame.parse_json::<SignalMsg>() {
                    if msg.signal == SIGNAL_INT {
                        debug!("client interrupt, cancelling request");
                        cancel.cancel();
                    }
                }
            }
            _ => {}
        }
    }
}

/// Copies one output pipe to the client as tagged frames.
async fn pump_frames(
    mut source: tokio::io::DuplexStream,
    sink: FrameSink,
    tag: FrameTag,
) {
    let mut buf = vec![0u8; FRAME_CHUNK];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let frame = Frame::new(tag, buf[..n].to_vec());
                if sink.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Audit entry for a policy denial or terminal escalation. The command
/// never started, so the duration is zero and the exit code is 1.
fn audit_policy(
    server: &Server,
    request: &Request,
    command: &Command,
    info: &EvalInfo,
    reason: &str,
) {
    let (segments, tiers) = segment_names(server, command);
    append_audit(
        server,
        LogRecord {
            pipeline: request.args.join(" "),
            segments,
            tiers,
            exit_code: 1,
            error: reason.to_string(),
            duration: Duration::ZERO,
            cwd: request.cwd.clone(),
            retry: request.retry,
            policy: Some(info.clone()),
        },
    );
}

/// Audit entry for a completed execution.
fn audit_completion(
    server: &Server,
    request: &Request,
    command: &Command,
    eval_info: Option<EvalInfo>,
    code: i32,
    result: &Result<(), CapabilityError>,
    duration: Duration,
) {
    let (segments, tiers) = segment_names(server, command);
    let error = match result {
        Ok(()) => String::new(),
        Err(e) if e.is_silent() => String::new(),
        Err(e) => e.to_string(),
    };
    append_audit(
        server,
        LogRecord {
            pipeline: request.args.join(" "),
            segments,
            tiers,
            exit_code: code,
            error,
            duration,
            cwd: request.cwd.clone(),
            retry: request.retry,
            policy: eval_info,
        },
    );
}

fn append_audit(server: &Server, record: LogRecord) {
    let Some(logger) = &server.logger else { return };
    if let Err(e) = logger.append(record) {
        // Best-effort: an audit failure never fails the user's command.
        warn!("audit append failed: {e}");
    }
}

fn segment_names(server: &Server, command: &Command) -> (Vec<String>, Vec<String>) {
    let mut segments = Vec::new();
    let mut tiers = Vec::new();
    for seg in command.segments() {
        segments.push(seg.cap_name.clone());
        if let Ok(cap) = server.registry.lookup(&seg.cap_name) {
            tiers.push(cap.tier().to_string());
        }
    }
    (segments, tiers)
}
