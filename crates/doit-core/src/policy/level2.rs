//! Level 2: the learned-policy store.
//!
//! Per-segment matching against the ordered entry list; approved entries
//! only, first match wins. Segment results combine pipeline-wide: any Deny
//! denies the command (short-circuit), all Allow allows it, anything else
//! escalates. `--retry` bypasses the level entirely; learned policies are
//! not hardcoded safety rules.

use super::flags::has_any_flag;
use super::store::{MatchCriteria, StoreEntry};
use super::{Decision, PolicyRequest, PolicyResult, PolicySegment};
use crate::capability::Tier;

/// The learned-policy engine.
pub struct Level2 {
    entries: Vec<StoreEntry>,
}

impl Level2 {
    /// Creates the engine from ordered store entries.
    #[must_use]
    pub fn new(entries: Vec<StoreEntry>) -> Self {
        Self { entries }
    }

    /// Evaluates per-segment matching and combines the results.
    #[must_use]
    pub fn evaluate(&self, req: &PolicyRequest) -> PolicyResult {
        if req.retry {
            return PolicyResult {
                decision: Decision::Escalate,
                level: 2,
                reason: "--retry bypasses Level 2".to_string(),
                rule_id: String::new(),
            };
        }

        if req.segments.is_empty() {
            return PolicyResult {
                decision: Decision::Escalate,
                level: 2,
                reason: "no segments to evaluate".to_string(),
                rule_id: String::new(),
            };
        }

        let mut results = Vec::with_capacity(req.segments.len());
        for seg in &req.segments {
            let result = self.match_segment(seg);
            if result.decision == Decision::Deny {
                return result;
            }
            results.push(result);
        }

        // Single segment: return its result directly (preserves the id).
        if results.len() == 1 {
            return results.remove(0);
        }

        if results.iter().all(|r| r.decision == Decision::Allow) {
            PolicyResult {
                decision: Decision::Allow,
                level: 2,
                reason: "all segments allowed by learned policy".to_string(),
                rule_id: String::new(),
            }
        } else {
            PolicyResult {
                decision: Decision::Escalate,
                level: 2,
                reason: "no learned policy matched all segments".to_string(),
                rule_id: String::new(),
            }
        }
    }

    /// First matching approved entry for a segment; read-only segments are
    /// implicitly allowed when nothing matches, extending Level 1's
    /// compositionality.
    fn match_segment(&self, seg: &PolicySegment) -> PolicyResult {
        for entry in &self.entries {
            if !entry.approved {
                continue;
            }
            if !matches_criteria(seg, &entry.criteria) {
                continue;
            }
            let Ok(decision) = entry.decision.parse::<Decision>() else {
                continue; // skip entries with invalid decisions
            };
            return PolicyResult {
                decision,
                level: 2,
                reason: format!(
                    "matched learned policy \"{}\": {}",
                    entry.id, entry.reasoning
                ),
                rule_id: entry.id.clone(),
            };
        }

        if seg.tier == Tier::Read {
            return PolicyResult {
                decision: Decision::Allow,
                level: 2,
                reason: format!("{} is read-only (implicit allow)", seg.cap_name),
                rule_id: String::new(),
            };
        }

        PolicyResult {
            decision: Decision::Escalate,
            level: 2,
            reason: format!("no learned policy for {}", seg.cap_name),
            rule_id: String::new(),
        }
    }
}

/// Whether a segment satisfies every specified constraint of the criteria.
fn matches_criteria(seg: &PolicySegment, criteria: &MatchCriteria) -> bool {
    if seg.cap_name != criteria.cap {
        return false;
    }

    if !criteria.subcmd.is_empty()
        && seg.args.first().map(String::as_str) != Some(criteria.subcmd.as_str())
    {
        return false;
    }

    let past_subcmd: &[String] = if criteria.subcmd.is_empty() {
        &seg.args
    } else {
        seg.args.get(1..).unwrap_or(&[])
    };

    if !criteria.has_flags.is_empty() && !has_any_flag(past_subcmd, &criteria.has_flags) {
        return false;
    }

    if !criteria.no_flags.is_empty() && has_any_flag(past_subcmd, &criteria.no_flags) {
        return false;
    }

    if !criteria.args_glob.is_empty() {
        let positional = positional_args(&seg.args, &criteria.subcmd);
        if positional.is_empty() {
            return false; // nothing to match against
        }
        for arg in positional {
            if !matches_any_glob(arg, &criteria.args_glob) {
                return false;
            }
        }
    }

    true
}

/// Non-flag arguments past the subcmd; a literal `--` ends flag parsing.
fn positional_args<'a>(args: &'a [String], subcmd: &str) -> Vec<&'a str> {
    let start = usize::from(!subcmd.is_empty() && args.first().map(String::as_str) == Some(subcmd));
    let mut positional = Vec::new();
    let mut past_dashes = false;
    for arg in &args[start.min(args.len())..] {
        if arg == "--" {
            past_dashes = true;
            continue;
        }
        if !past_dashes && arg.starts_with('-') {
            continue;
        }
        positional.push(arg.as_str());
    }
    positional
}

fn matches_any_glob(s: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| {
        glob::Pattern::new(p)
            .map(|pattern| pattern.matches(s))
            .unwrap_or(false)
    })
}
