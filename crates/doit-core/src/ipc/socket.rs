//! Socket and PID file locations.

use std::io;
use std::path::PathBuf;

/// Directory holding the daemon socket and PID file. Prefers
/// `$XDG_RUNTIME_DIR/doit`, falling back to `~/.local/share/doit`.
///
/// # Errors
///
/// An error when neither `XDG_RUNTIME_DIR` nor a home directory can be
/// resolved.
pub fn socket_dir() -> io::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir).join("doit"));
        }
    }
    let base = directories::BaseDirs::new()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))?;
    Ok(base.home_dir().join(".local").join("share").join("doit"))
}

/// Full path to the daemon socket.
///
/// # Errors
///
/// See [`socket_dir`].
pub fn socket_path() -> io::Result<PathBuf> {
    Ok(socket_dir()?.join("daemon.sock"))
}

/// Full path to the daemon PID file.
///
/// # Errors
///
/// See [`socket_dir`].
pub fn pid_path() -> io::Result<PathBuf> {
    Ok(socket_dir()?.join("daemon.pid"))
}
