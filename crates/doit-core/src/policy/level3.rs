//! Level 3: the LLM gatekeeper.
//!
//! A wrapper over an abstract [`Prompter`]. The prompt carries the tier
//! taxonomy, the decision labels, and the full command context; the reply
//! must be JSON of shape `{"decision": ..., "reasoning": ...}`. Transport
//! errors and unparseable replies degrade to `Escalate`: never a crash.

use std::fmt::Write as _;

use async_trait::async_trait;

use super::{Decision, PolicyRequest, PolicyResult};
use crate::llm::LlmError;

/// Abstracts the LLM call for testability.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Sends `text` and returns the model's raw reply.
    async fn prompt(&self, text: &str) -> Result<String, LlmError>;
}

/// The gatekeeper engine.
pub struct Level3 {
    client: Box<dyn Prompter>,
}

impl Level3 {
    /// Creates the engine over the given prompter.
    #[must_use]
    pub fn new(client: Box<dyn Prompter>) -> Self {
        Self { client }
    }

    /// Asks the LLM whether to allow, deny, or escalate. `--retry` allows
    /// immediately without a call.
    pub async fn evaluate(&self, req: &PolicyRequest) -> PolicyResult {
        if req.retry {
            return PolicyResult {
                decision: Decision::Allow,
                level: 3,
                reason: "--retry bypasses Level 3".to_string(),
                rule_id: String::new(),
            };
        }

        let prompt = build_prompt(req);
        let raw = match self.client.prompt(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                return PolicyResult {
                    decision: Decision::Escalate,
                    level: 3,
                    reason: format!("LLM error: {e}"),
                    rule_id: String::new(),
                };
            }
        };

        match parse_decision(&raw) {
            Ok((decision, reasoning)) => PolicyResult {
                decision,
                level: 3,
                reason: reasoning,
                rule_id: "llm-gatekeeper".to_string(),
            },
            Err(reason) => PolicyResult {
                decision: Decision::Escalate,
                level: 3,
                reason: format!("unparseable LLM response: {reason}"),
                rule_id: String::new(),
            },
        }
    }
}

fn build_prompt(req: &PolicyRequest) -> String {
    let mut p = String::new();

    p.push_str(
        "You are a security gatekeeper for a command execution broker. \
         Evaluate whether this command should be allowed, denied, or \
         escalated to a human.\n\n",
    );

    p.push_str("Safety tiers (from least to most dangerous):\n");
    p.push_str("  read      — read-only operations (grep, cat, find, ls)\n");
    p.push_str("  build     — build/compile operations (make, go build)\n");
    p.push_str("  write     — file mutations (cp, mv, mkdir, tee)\n");
    p.push_str("  dangerous — destructive operations (rm, chmod, git push)\n\n");

    p.push_str("Decision options:\n");
    p.push_str("  allow    — command is safe to proceed\n");
    p.push_str("  deny     — command is clearly dangerous or harmful\n");
    p.push_str("  escalate — uncertain, needs human review\n\n");

    p.push_str("Command details:\n");
    let _ = writeln!(p, "  Command: {}", req.command);
    if !req.segments.is_empty() {
        p.push_str("  Segments:\n");
        for seg in &req.segments {
            let _ = write!(p, "    - {} (tier: {})", seg.cap_name, seg.tier);
            if !seg.args.is_empty() {
                let _ = write!(p, " args: {:?}", seg.args);
            }
            p.push('\n');
        }
    }
    if !req.cwd.is_empty() {
        let _ = writeln!(p, "  Working directory: {}", req.cwd);
    }
    if req.has_redirect_out {
        p.push_str("  Output redirect: yes\n");
    }
    if !req.justification.is_empty() {
        let _ = writeln!(p, "  Worker justification: {}", req.justification);
    }
    if !req.safety_arg.is_empty() {
        let _ = writeln!(p, "  Worker safety argument: {}", req.safety_arg);
    }

    p.push_str("\nRespond with JSON only:\n");
    p.push_str(r#"{"decision": "allow|deny|escalate", "reasoning": "brief explanation"}"#);
    p.push('\n');

    p
}

/// Parses the model's reply, stripping fenced-code wrappers if present.
fn parse_decision(raw: &str) -> Result<(Decision, String), String> {
    let mut s = raw.trim();

    if s.starts_with("```") {
        let Some(end) = s.find('\n') else {
            return Err("malformed code fence".to_string());
        };
        s = &s[end + 1..];
        if let Some(idx) = s.rfind("```") {
            s = &s[..idx];
        }
        s = s.trim();
    }

    #[derive(serde::Deserialize)]
    struct Reply {
        decision: String,
        #[serde(default)]
        reasoning: String,
    }

    let reply: Reply =
        serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))?;
    let decision = reply
        .decision
        .parse::<Decision>()
        .map_err(|e| e.to_string())?;
    Ok((decision, reply.reasoning))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::super::PolicySegment;
    use super::*;
    use crate::capability::Tier;

    struct FakePrompter {
        reply: Result<String, String>,
        seen: Mutex<Vec<String>>,
    }

    impl FakePrompter {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Prompter for FakePrompter {
        async fn prompt(&self, text: &str) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(text.to_string());
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(message) => Err(LlmError::Empty(message.clone())),
            }
        }
    }

    fn req() -> PolicyRequest {
        PolicyRequest {
            command: "git push origin main".to_string(),
            segments: vec![PolicySegment {
                cap_name: "git".to_string(),
                args: vec!["push".to_string(), "origin".to_string(), "main".to_string()],
                tier: Tier::Read,
            }],
            cwd: "/work".to_string(),
            justification: "publish reviewed changes".to_string(),
            safety_arg: "branch is not protected".to_string(),
            ..PolicyRequest::default()
        }
    }

    #[tokio::test]
    async fn test_allow_reply() {
        let l3 = Level3::new(Box::new(FakePrompter::replying(
            r#"{"decision": "allow", "reasoning": "routine push"}"#,
        )));
        let result = l3.evaluate(&req()).await;
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.reason, "routine push");
        assert_eq!(result.rule_id, "llm-gatekeeper");
    }

    #[tokio::test]
    async fn test_fenced_reply_stripped() {
        let l3 = Level3::new(Box::new(FakePrompter::replying(
            "```json\n{\"decision\": \"deny\", \"reasoning\": \"nope\"}\n```",
        )));
        let result = l3.evaluate(&req()).await;
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.reason, "nope");
    }

    #[tokio::test]
    async fn test_garbage_reply_escalates() {
        let l3 = Level3::new(Box::new(FakePrompter::replying("I think it's fine!")));
        let result = l3.evaluate(&req()).await;
        assert_eq!(result.decision, Decision::Escalate);
        assert!(result.reason.contains("unparseable"));
    }

    #[tokio::test]
    async fn test_unknown_decision_escalates() {
        let l3 = Level3::new(Box::new(FakePrompter::replying(
            r#"{"decision": "probably", "reasoning": ""}"#,
        )));
        let result = l3.evaluate(&req()).await;
        assert_eq!(result.decision, Decision::Escalate);
    }

    #[tokio::test]
    async fn test_transport_error_escalates() {
        let l3 = Level3::new(Box::new(FakePrompter::failing("socket closed")));
        let result = l3.evaluate(&req()).await;
        assert_eq!(result.decision, Decision::Escalate);
        assert!(result.reason.starts_with("LLM error"));
    }

    #[tokio::test]
    async fn test_retry_allows_without_call() {
        let prompter = FakePrompter::replying(r#"{"decision": "deny"}"#);
        let l3 = Level3::new(Box::new(prompter));
        let mut request = req();
        request.retry = true;
        let result = l3.evaluate(&request).await;
        assert_eq!(result.decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_prompt_carries_request_details() {
        let request = req();
        let prompt = build_prompt(&request);
        assert!(prompt.contains("git push origin main"));
        assert!(prompt.contains("Working directory: /work"));
        assert!(prompt.contains("publish reviewed changes"));
        assert!(prompt.contains("branch is not protected"));
        assert!(prompt.contains("read      —"));
        assert!(prompt.contains("escalate"));
    }
}
