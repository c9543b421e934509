//! # doit-daemon
//!
//! The persistent daemon half of doit. It owns the unix socket, accepts one
//! connection per command invocation, evaluates the layered policy chain,
//! runs permitted pipelines through the streaming execution engine, and
//! appends an audit record for every completion.
//!
//! The daemon is single-process; connections are independent tasks and no
//! per-connection state outlives its task. An idle timer shuts the server
//! down when no connection has been accepted or completed for the
//! configured period.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod connection;
mod pidfile;
mod server;

pub use pidfile::{clean_stale_socket, remove_pid_file, write_pid_file, StaleSocketError};
pub use server::{DaemonError, Server};
