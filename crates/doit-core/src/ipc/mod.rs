//! Client ↔ daemon IPC protocol.
//!
//! A single unix-socket byte stream carries tagged, length-prefixed frames:
//! one tag byte, a 32-bit big-endian payload length, then the payload. Tags
//! are disjoint by direction:
//!
//! | tag | direction | payload |
//! |---|---|---|
//! | 0x01 | C→S | JSON [`Request`] |
//! | 0x02 | C→S | raw stdin bytes |
//! | 0x03 | C→S | stdin closed (no payload) |
//! | 0x04 | C→S | JSON [`SignalMsg`] |
//! | 0x10 | S→C | raw stdout bytes |
//! | 0x11 | S→C | raw stderr bytes |
//! | 0x12 | S→C | JSON [`ExitResult`] |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

mod env;
mod frame;
mod socket;

pub use env::capture_env;
pub use frame::{Frame, FrameCodec, ProtocolError, MAX_FRAME_SIZE};
pub use socket::{pid_path, socket_dir, socket_path};

/// Frame type discriminator. Client-to-server tags live in 0x01–0x0F,
/// server-to-client tags in 0x10–0x1F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTag {
    /// C→S: JSON-encoded [`Request`]; always the first frame.
    Request = 0x01,
    /// C→S: raw stdin bytes.
    StdinData = 0x02,
    /// C→S: stdin closed (empty payload).
    StdinEof = 0x03,
    /// C→S: JSON-encoded [`SignalMsg`].
    Signal = 0x04,
    /// S→C: raw stdout bytes.
    StdoutData = 0x10,
    /// S→C: raw stderr bytes.
    StderrData = 0x11,
    /// S→C: JSON-encoded [`ExitResult`]; always the last frame.
    Exit = 0x12,
}

impl FrameTag {
    /// The wire byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte into a tag.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameTag::Request),
            0x02 => Some(FrameTag::StdinData),
            0x03 => Some(FrameTag::StdinEof),
            0x04 => Some(FrameTag::Signal),
            0x10 => Some(FrameTag::StdoutData),
            0x11 => Some(FrameTag::StderrData),
            0x12 => Some(FrameTag::Exit),
            _ => None,
        }
    }
}

/// The initial frame sent by the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// The command tokens, exactly as given after modifier stripping.
    pub args: Vec<String>,
    /// Client working directory.
    pub cwd: String,
    /// Whether `--retry` was supplied.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retry: bool,
    /// Approval token from `--approved`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<String>,
    /// Curated client environment for the child processes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Why the worker needs this command.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub justification: String,
    /// Why the worker believes it is safe.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub safety_arg: String,
}

/// The final frame sent by the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExitResult {
    /// Process exit code for the client to adopt.
    pub code: i32,
    /// Error text for the client's stderr, when doit itself failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Rule id when policy denied the command.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_deny: String,
    /// Freshly-issued approval token when policy escalated terminally.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_escalate: String,
}

/// A signal forwarded from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalMsg {
    /// Signal name; only [`SIGNAL_INT`] is defined.
    pub signal: String,
}

/// Wire name of the interrupt signal.
pub const SIGNAL_INT: &str = "INT";
