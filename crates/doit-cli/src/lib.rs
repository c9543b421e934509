//! Library surface of the `doit` binary: the daemon client and the local
//! command handlers. Split out of `main.rs` so integration tests can drive
//! the relay and helpers directly.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod commands;
