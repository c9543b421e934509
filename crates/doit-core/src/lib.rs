//! # doit-core
//!
//! Core library for doit, a capability broker that mediates shell-command
//! execution on behalf of autonomous coding agents.
//!
//! This crate provides the building blocks shared by the daemon and the CLI:
//!
//! - **Capabilities**: named, tier-classified executors and their registry
//! - **Pipeline language**: the shell-free command syntax and its parser
//! - **Execution engine**: concurrent per-segment streaming execution
//! - **Policy**: the three-level policy chain and approval tokens
//! - **Audit**: the hash-chained append-only invocation log
//! - **IPC**: the tagged binary frame protocol between client and daemon
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use doit_core::capability::{builtin, Registry};
//! use doit_core::pipeline;
//!
//! let registry = Arc::new(Registry::new());
//! builtin::register_all(&registry);
//!
//! let tokens: Vec<String> = ["echo", "hi", "\u{00A6}", "wc"]
//!     .map(String::from)
//!     .into();
//! let command = pipeline::parse_command(&tokens, &registry).unwrap();
//! assert_eq!(command.steps.len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audit;
pub mod capability;
pub mod config;
pub mod io;
pub mod ipc;
pub mod llm;
pub mod pipeline;
pub mod policy;

pub use capability::{Capability, CapabilityError, ExecContext, Registry, Tier};
pub use config::Config;
pub use pipeline::{Command, Pipeline, Segment};
pub use policy::{Decision, PolicyEngine, PolicyRequest, PolicyResult};
