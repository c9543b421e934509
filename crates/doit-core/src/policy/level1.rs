//! Level 1: deterministic rules.
//!
//! An ordered list of named rules. Bypassable rules are skipped when the
//! caller requested `--retry`; the first rule with an opinion wins and its
//! id is carried into the result. Hardcoded safety rules are never
//! bypassable; they are doit's core promise and block permanently
//! catastrophic operations even under retry.

use std::collections::BTreeMap;

use super::flags::has_any_flag;
use super::{Decision, PolicyRequest, PolicyResult};
use crate::capability::Tier;
use crate::config::CapRuleConfig;

type RuleCheck = Box<dyn Fn(&PolicyRequest) -> Option<PolicyResult> + Send + Sync>;

/// A named, testable deterministic rule.
pub struct Rule {
    /// Stable identifier carried into audit records.
    pub id: String,
    /// One-line description for inspection output.
    pub description: String,
    /// Whether `--retry` may bypass this rule for one invocation.
    pub bypassable: bool,
    check: RuleCheck,
}

/// The deterministic rule engine.
pub struct Level1 {
    rules: Vec<Rule>,
}

impl Level1 {
    /// Creates the engine with built-in rules plus rules compiled from the
    /// per-capability config.
    #[must_use]
    pub fn new(config_rules: &BTreeMap<String, CapRuleConfig>) -> Self {
        let mut rules = Vec::new();

        // Hardcoded deny rules (never bypassable).
        rules.push(Rule {
            id: "deny-rm-catastrophic".to_string(),
            description: "Block recursive removal of root, home, or current directory"
                .to_string(),
            bypassable: false,
            check: Box::new(check_rm_catastrophic),
        });

        // Config deny rules (bypassable with --retry).
        for (cap_name, cfg) in config_rules {
            rules.extend(compile_config_rules(cap_name, cfg));
        }

        // git checkout . rule (bypassable).
        rules.push(Rule {
            id: "deny-git-checkout-all".to_string(),
            description: "Block git checkout . which discards all changes".to_string(),
            bypassable: true,
            check: Box::new(check_git_checkout_all),
        });

        // Auto-allow rules.
        rules.push(Rule {
            id: "allow-safe-pipeline".to_string(),
            description: "Auto-allow pipelines where every segment is read-only".to_string(),
            bypassable: false,
            check: Box::new(check_safe_pipeline),
        });

        Self { rules }
    }

    /// Runs all rules in order; the first definitive result wins. Returns
    /// `Escalate` if no rule has an opinion.
    #[must_use]
    pub fn evaluate(&self, req: &PolicyRequest) -> PolicyResult {
        for rule in &self.rules {
            if rule.bypassable && req.retry {
                continue;
            }
            if let Some(result) = (rule.check)(req) {
                return result;
            }
        }
        PolicyResult {
            decision: Decision::Escalate,
            level: 1,
            reason: "no deterministic rule matched".to_string(),
            rule_id: String::new(),
        }
    }

    /// The rule list, for inspection and testing.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// Lexically cleans a path the way the catastrophic-removal check needs:
/// collapses `.` and empty components and resolves `..` against prior
/// components, without touching the filesystem.
fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if matches!(stack.last(), Some(&last) if last != "..") {
                    stack.pop();
                } else if !absolute {
                    stack.push("..");
                }
            }
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn deny(level: u8, reason: String, rule_id: &str) -> Option<PolicyResult> {
    Some(PolicyResult {
        decision: Decision::Deny,
        level,
        reason,
        rule_id: rule_id.to_string(),
    })
}

// --- Built-in rules ---

fn check_rm_catastrophic(req: &PolicyRequest) -> Option<PolicyResult> {
    for seg in &req.segments {
        if seg.cap_name != "rm" {
            continue;
        }
        if !has_any_flag(&seg.args, &["-r", "-R"]) {
            continue;
        }
        for arg in &seg.args {
            if arg.is_empty() || arg.starts_with('-') {
                continue;
            }
            let cleaned = clean_path(arg);
            if cleaned == "/" || cleaned == "." || cleaned == ".."
                || arg == "~"
                || arg.starts_with("~/")
            {
                return deny(
                    1,
                    format!("refusing to recursively remove \"{arg}\" (permanently blocked)"),
                    "deny-rm-catastrophic",
                );
            }
        }
    }
    None
}

fn check_git_checkout_all(req: &PolicyRequest) -> Option<PolicyResult> {
    const REASON: &str = "checkout: refusing to discard all changes (config rule). \
                          Ask the user for explicit permission, then retry with: \
                          doit --retry git checkout .";
    for seg in &req.segments {
        if seg.cap_name != "git" || seg.args.first().map(String::as_str) != Some("checkout") {
            continue;
        }
        let rest = &seg.args[1..];
        for (i, arg) in rest.iter().enumerate() {
            if clean_path(arg) == "." {
                return deny(1, REASON.to_string(), "deny-git-checkout-all");
            }
            if arg == "--" && i + 1 < rest.len() && clean_path(&rest[i + 1]) == "." {
                return deny(1, REASON.to_string(), "deny-git-checkout-all");
            }
        }
    }
    None
}

fn check_safe_pipeline(req: &PolicyRequest) -> Option<PolicyResult> {
    if req.has_redirect_out {
        return None; // output redirect is a write operation
    }
    if req.segments.is_empty() {
        return None;
    }
    if req.segments.iter().any(|seg| seg.tier != Tier::Read) {
        return None;
    }
    Some(PolicyResult {
        decision: Decision::Allow,
        level: 1,
        reason: "all segments are read-only".to_string(),
        rule_id: "allow-safe-pipeline".to_string(),
    })
}

// --- Config rule compilation ---

fn compile_config_rules(cap_name: &str, cfg: &CapRuleConfig) -> Vec<Rule> {
    let mut rules = Vec::new();

    if !cfg.reject_flags.is_empty() {
        let id = format!("deny-{cap_name}-flags");
        let name = cap_name.to_string();
        let flags = cfg.reject_flags.clone();
        let rule_id = id.clone();
        rules.push(Rule {
            description: format!("Reject flags {flags:?} for {name}"),
            bypassable: true,
            check: Box::new(move |req| {
                for seg in &req.segments {
                    if seg.cap_name == name && has_any_flag(&seg.args, &flags) {
                        return deny(
                            1,
                            format!(
                                "rejected flag for {name} (config rule). Ask the user for \
                                 explicit permission, then retry with: doit --retry {name} ..."
                            ),
                            &rule_id,
                        );
                    }
                }
                None
            }),
            id,
        });
    }

    for (subcmd, sub_rule) in &cfg.subcommands {
        if sub_rule.reject_flags.is_empty() {
            continue;
        }
        let id = format!("deny-{cap_name}-{subcmd}-flags");
        let name = cap_name.to_string();
        let sub = subcmd.clone();
        let flags = sub_rule.reject_flags.clone();
        let rule_id = id.clone();
        rules.push(Rule {
            description: format!("Reject flags {flags:?} for {name} {sub}"),
            bypassable: true,
            check: Box::new(move |req| {
                for seg in &req.segments {
                    if seg.cap_name != name || seg.args.first() != Some(&sub) {
                        continue;
                    }
                    if has_any_flag(&seg.args[1..], &flags) {
                        return deny(
                            1,
                            format!(
                                "{sub}: rejected flag for {name} (config rule). Ask the user \
                                 for explicit permission, then retry with: doit --retry {name} ..."
                            ),
                            &rule_id,
                        );
                    }
                }
                None
            }),
            id,
        });
    }

    rules
}
