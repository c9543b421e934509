//! The `claude -p` subprocess client behind the gatekeeper's
//! [`Prompter`](crate::policy::Prompter) seam.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::policy::Prompter;

/// Default wall-clock limit for one gatekeeper call.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment prefix stripped before any LLM subprocess call, so a nested
/// agent session cannot leak into the gatekeeper.
const STRIPPED_ENV_PREFIX: &str = "CLAUDECODE";

/// LLM transport failures. All of them degrade to `Escalate` at Level 3.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The call exceeded its timeout.
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    /// Spawning or talking to the subprocess failed.
    #[error("LLM call failed: {0}")]
    Io(#[from] std::io::Error),

    /// The subprocess exited non-zero.
    #[error("LLM exited with status {status}: {stderr}")]
    Failed {
        /// Exit status code.
        status: i32,
        /// Captured stderr, trimmed.
        stderr: String,
    },

    /// The subprocess produced no output.
    #[error("LLM returned empty response")]
    Empty(
        /// Diagnostic context.
        String,
    ),
}

/// Invokes `claude -p` as a subprocess and returns the trimmed response.
pub struct ClaudeClient {
    model: Option<String>,
    timeout: Duration,
}

impl ClaudeClient {
    /// Creates a client with the default timeout and no model override.
    #[must_use]
    pub fn new() -> Self {
        Self {
            model: None,
            timeout: DEFAULT_LLM_TIMEOUT,
        }
    }

    /// Selects a specific model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Overrides the call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ClaudeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prompter for ClaudeClient {
    async fn prompt(&self, text: &str) -> Result<String, LlmError> {
        let mut cmd = tokio::process::Command::new("claude");
        cmd.arg("-p");
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear()
            .envs(scrubbed_env());

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| LlmError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(LlmError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply.is_empty() {
            return Err(LlmError::Empty("claude produced no stdout".to_string()));
        }
        Ok(reply)
    }
}

/// The process environment minus every `CLAUDECODE*` key.
fn scrubbed_env() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(key, _)| !key.starts_with(STRIPPED_ENV_PREFIX))
        .collect()
}
