//! PID file and stale-socket handling.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Socket takeover failures.
#[derive(Debug, Error)]
pub enum StaleSocketError {
    /// Another daemon is serving the socket or holds a live PID.
    #[error("daemon already running ({0})")]
    AlreadyRunning(String),

    /// Filesystem failure while probing or cleaning.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Writes the current process id to `path` (mode 0600).
///
/// # Errors
///
/// Any filesystem failure.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    let contents = std::process::id().to_string();
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents.as_bytes())
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)
    }
}

/// Removes the PID file, ignoring a missing one.
pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Removes a socket file that no process is listening on.
///
/// Probes by connecting first; a successful connect means a live daemon. A
/// PID-liveness check (`kill(pid, 0)`) backs that up before the socket is
/// unlinked.
///
/// # Errors
///
/// [`StaleSocketError::AlreadyRunning`] when a live daemon is detected, or
/// an I/O failure while cleaning up.
pub async fn clean_stale_socket(
    socket_path: &Path,
    pid_path: &Path,
) -> Result<(), StaleSocketError> {
    match std::fs::symlink_metadata(socket_path) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StaleSocketError::Io(e)),
    }

    if tokio::net::UnixStream::connect(socket_path).await.is_ok() {
        return Err(StaleSocketError::AlreadyRunning(format!(
            "socket {} is active",
            socket_path.display()
        )));
    }

    if let Some(pid) = read_pid(pid_path) {
        if process_alive(pid) {
            return Err(StaleSocketError::AlreadyRunning(format!("pid {pid}")));
        }
    }

    std::fs::remove_file(socket_path)?;
    Ok(())
}

fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}
