//! Client side of the IPC protocol: connect-or-spawn and the frame relay.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use doit_core::ipc::{
    self, ExitResult, Frame, FrameCodec, FrameTag, ProtocolError, Request, SignalMsg, SIGNAL_INT,
};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

/// Backoff schedule between connect retries after spawning the daemon.
const SPAWN_BACKOFF_MS: [u64; 6] = [10, 20, 50, 100, 200, 500];

/// Chunk size of the stdin pump.
const STDIN_CHUNK: usize = 32 * 1024;

/// Client-side failures. All of them exit with code 2.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No daemon is listening on the socket.
    #[error("daemon is not running")]
    NotRunning,

    /// Connecting or relaying failed.
    #[error("daemon connection: {0}")]
    Io(#[from] io::Error),

    /// The daemon spoke the protocol wrong (or hung up mid-command).
    #[error("daemon protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// The spawned daemon never started listening.
    #[error("daemon did not start after {0:?}")]
    SpawnTimeout(Duration),
}

/// One connection attempt to the standard socket.
///
/// # Errors
///
/// [`ClientError::NotRunning`] when nothing listens there, or an I/O error.
pub async fn connect() -> Result<UnixStream, ClientError> {
    let path = ipc::socket_path()?;
    UnixStream::connect(&path).await.map_err(|e| {
        if matches!(
            e.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
        ) {
            ClientError::NotRunning
        } else {
            ClientError::Io(e)
        }
    })
}

/// Connects, spawning `self_path --daemon` fully detached on a first
/// failure and retrying on a fixed backoff schedule.
///
/// # Errors
///
/// [`ClientError::SpawnTimeout`] when the daemon never comes up, or any
/// connect/spawn failure.
pub async fn connect_or_spawn(self_path: &Path) -> Result<UnixStream, ClientError> {
    match connect().await {
        Ok(stream) => return Ok(stream),
        Err(e) => debug!("initial connect failed ({e}), spawning daemon"),
    }

    spawn_daemon(self_path)?;

    let mut waited = Duration::ZERO;
    for delay in SPAWN_BACKOFF_MS {
        let delay = Duration::from_millis(delay);
        tokio::time::sleep(delay).await;
        waited += delay;
        match connect().await {
            Ok(stream) => return Ok(stream),
            Err(e) => debug!("connect retry failed: {e}"),
        }
    }
    Err(ClientError::SpawnTimeout(waited))
}

/// Spawns the daemon with no inherited streams in a new session, so it
/// outlives this client and owns no terminal.
fn spawn_daemon(self_path: &Path) -> io::Result<()> {
    let mut cmd = std::process::Command::new(self_path);
    cmd.arg("--daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Safety: setsid is async-signal-safe and the closure does nothing
        // else.
        unsafe {
            cmd.pre_exec(|| {
                let _ = nix::unistd::setsid();
                Ok(())
            });
        }
    }
    cmd.spawn()?;
    Ok(())
}

/// Serializes frame writes from the request, the stdin pump, and the
/// signal forwarder.
#[derive(Clone)]
struct ClientSink {
    inner: Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>>,
}

impl ClientSink {
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
}

/// Relays one command over an established connection: writes the request,
/// pumps `stdin` as frames in bounded chunks, demuxes output frames
/// byte-for-byte onto `stdout`/`stderr`, and forwards SIGINT to the daemon
/// instead of dying locally. The daemon's error text and any escalation
/// hint are written to `stderr`. Returns the daemon's exit code.
///
/// # Errors
///
/// [`ClientError::Protocol`] when the stream breaks before the exit frame.
pub async fn relay<I, O, E>(
    stream: UnixStream,
    request: &Request,
    mut stdin: I,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<i32, ClientError>
where
    I: tokio::io::AsyncRead + Send + Unpin + 'static,
    O: tokio::io::AsyncWrite + Unpin,
    E: tokio::io::AsyncWrite + Unpin,
{
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    let sink = ClientSink::new(write_half);

    sink.send(Frame::json(FrameTag::Request, request)?).await?;

    let stdin_sink = sink.clone();
    let stdin_pump = tokio::spawn(async move {
        let mut buf = vec![0u8; STDIN_CHUNK];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = Frame::new(FrameTag::StdinData, buf[..n].to_vec());
                    if stdin_sink.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = stdin_sink
            .send(Frame::new(FrameTag::StdinEof, Vec::new()))
            .await;
    });

    let signal_sink = sink.clone();
    let signal_forwarder = tokio::spawn(async move {
        let Ok(mut interrupts) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        else {
            return;
        };
        while interrupts.recv().await.is_some() {
            let Ok(frame) = Frame::json(
                FrameTag::Signal,
                &SignalMsg {
                    signal: SIGNAL_INT.to_string(),
                },
            ) else {
                return;
            };
            if signal_sink.send(frame).await.is_err() {
                return;
            }
        }
    });

    let exit: ExitResult = loop {
        match frames.next().await {
            Some(Ok(frame)) => match frame.tag {
                FrameTag::StdoutData => {
                    stdout.write_all(&frame.payload).await?;
                    stdout.flush().await?;
                }
                FrameTag::StderrData => {
                    stderr.write_all(&frame.payload).await?;
                    stderr.flush().await?;
                }
                FrameTag::Exit => break frame.parse_json()?,
                _ => {}
            },
            Some(Err(e)) => {
                stdin_pump.abort();
                signal_forwarder.abort();
                return Err(e.into());
            }
            None => {
                stdin_pump.abort();
                signal_forwarder.abort();
                return Err(ProtocolError::Closed.into());
            }
        }
    };
    stdin_pump.abort();
    signal_forwarder.abort();

    if !exit.error.is_empty() {
        stderr
            .write_all(format!("{}\n", exit.error).as_bytes())
            .await?;
    }
    if !exit.policy_escalate.is_empty() {
        let hint = format!(
            "doit: to approve this command once, retry with: doit --approved {} {}\n",
            exit.policy_escalate,
            request.args.join(" ")
        );
        stderr.write_all(hint.as_bytes()).await?;
    }
    stderr.flush().await?;

    Ok(exit.code)
}
