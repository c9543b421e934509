//! Two-phase parser: compound split, then per-pipeline redirect and pipe
//! extraction.
//!
//! Input is the pre-tokenized argv vector; the shell already split it.
//! Operators are recognized by exact token equality.

use std::path::PathBuf;

use thiserror::Error;

use super::{
    Command, Connector, Pipeline, Segment, Step, OP_PIPE, OP_REDIRECT_IN, OP_REDIRECT_OUT,
};
use crate::capability::Registry;

/// Typed parse failures, each carrying the offending token position.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// No tokens at all.
    #[error("empty command")]
    EmptyCommand,

    /// A compound operator at the start, end, or adjacent to another.
    #[error("empty pipeline at {op} (token {pos})")]
    EmptyStep {
        /// The compound operator token.
        op: String,
        /// Index of the operator in the token stream.
        pos: usize,
    },

    /// A redirect token with no filename after it.
    #[error("{op} requires a file path (token {pos})")]
    MissingRedirectTarget {
        /// The redirect operator token.
        op: &'static str,
        /// Index of the operator in the token stream.
        pos: usize,
    },

    /// A second stdin or stdout redirect in one pipeline.
    #[error("multiple {op} redirects (token {pos})")]
    DuplicateRedirect {
        /// The redirect operator token.
        op: &'static str,
        /// Index of the duplicate operator.
        pos: usize,
    },

    /// Nothing between two pipes, or before/after one.
    #[error("empty segment at {op} (token {pos})", op = OP_PIPE)]
    EmptySegment {
        /// Index near the offending pipe token.
        pos: usize,
    },

    /// A segment's first token is not a registered capability.
    #[error("unknown capability: \"{name}\" (token {pos})")]
    UnknownCapability {
        /// The unrecognized name.
        name: String,
        /// Its index in the token stream.
        pos: usize,
    },
}

/// Parses a full token stream into a compound [`Command`].
///
/// The stream is split at every compound operator; each part parses as a
/// pipeline and the operator is recorded as that step's connector.
///
/// # Errors
///
/// Any [`ParseError`]; positions index into `tokens`.
pub fn parse_command(tokens: &[String], registry: &Registry) -> Result<Command, ParseError> {
    if tokens.is_empty() {
        return Err(ParseError::EmptyCommand);
    }

    let mut steps = Vec::new();
    let mut start = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        if let Some(connector) = Connector::from_token(token) {
            if start == i {
                return Err(ParseError::EmptyStep {
                    op: token.clone(),
                    pos: i,
                });
            }
            let pipeline = parse_pipeline_at(&tokens[start..i], start, registry)?;
            steps.push(Step {
                pipeline,
                connector: Some(connector),
            });
            start = i + 1;
        }
    }

    if start == tokens.len() {
        // Trailing operator with nothing after it.
        let pos = tokens.len() - 1;
        return Err(ParseError::EmptyStep {
            op: tokens[pos].clone(),
            pos,
        });
    }

    let pipeline = parse_pipeline_at(&tokens[start..], start, registry)?;
    steps.push(Step {
        pipeline,
        connector: None,
    });

    Ok(Command { steps })
}

/// Parses a single pipeline (no compound operators) from a token stream.
///
/// # Errors
///
/// Any [`ParseError`]; positions index into `tokens`.
pub fn parse_pipeline(tokens: &[String], registry: &Registry) -> Result<Pipeline, ParseError> {
    if tokens.is_empty() {
        return Err(ParseError::EmptyCommand);
    }
    parse_pipeline_at(tokens, 0, registry)
}

/// Parses one pipeline slice; `offset` is the slice's position in the
/// original stream so errors report absolute token positions.
fn parse_pipeline_at(
    tokens: &[String],
    offset: usize,
    registry: &Registry,
) -> Result<Pipeline, ParseError> {
    // First pass: extract redirects from anywhere in the slice.
    let mut redirect_in: Option<PathBuf> = None;
    let mut redirect_out: Option<PathBuf> = None;
    let mut filtered: Vec<(usize, &str)> = Vec::with_capacity(tokens.len());

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i].as_str();
        let slot = match token {
            OP_REDIRECT_IN => Some((&mut redirect_in, OP_REDIRECT_IN)),
            OP_REDIRECT_OUT => Some((&mut redirect_out, OP_REDIRECT_OUT)),
            _ => None,
        };
        match slot {
            Some((slot, op)) => {
                if i + 1 >= tokens.len() {
                    return Err(ParseError::MissingRedirectTarget {
                        op,
                        pos: offset + i,
                    });
                }
                if slot.is_some() {
                    return Err(ParseError::DuplicateRedirect {
                        op,
                        pos: offset + i,
                    });
                }
                *slot = Some(PathBuf::from(&tokens[i + 1]));
                i += 2;
            }
            None => {
                filtered.push((offset + i, token));
                i += 1;
            }
        }
    }

    // Second pass: split the remaining tokens on the pipe operator.
    let mut segments = Vec::new();
    let mut current: Vec<(usize, &str)> = Vec::new();
    for (pos, token) in filtered {
        if token == OP_PIPE {
            if current.is_empty() {
                return Err(ParseError::EmptySegment { pos });
            }
            segments.push(parse_segment(&current, registry)?);
            current.clear();
        } else {
            current.push((pos, token));
        }
    }
    if current.is_empty() {
        return Err(ParseError::EmptySegment {
            pos: offset + tokens.len().saturating_sub(1),
        });
    }
    segments.push(parse_segment(&current, registry)?);

    Ok(Pipeline {
        segments,
        redirect_in,
        redirect_out,
    })
}

fn parse_segment(tokens: &[(usize, &str)], registry: &Registry) -> Result<Segment, ParseError> {
    let (pos, name) = tokens[0];
    if registry.lookup(name).is_err() {
        return Err(ParseError::UnknownCapability {
            name: name.to_string(),
            pos,
        });
    }
    Ok(Segment {
        cap_name: name.to_string(),
        args: tokens[1..].iter().map(|(_, t)| (*t).to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::{OP_AND_THEN, OP_OR_ELSE, OP_SEQUENTIAL};
    use super::*;
    use crate::capability::builtin;

    fn registry() -> Registry {
        let reg = Registry::new();
        builtin::register_all(&reg);
        reg
    }

    fn toks(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_single_segment() {
        let reg = registry();
        let cmd = parse_command(&toks(&["echo", "hello", "world"]), &reg).unwrap();
        assert_eq!(cmd.steps.len(), 1);
        let seg = &cmd.steps[0].pipeline.segments[0];
        assert_eq!(seg.cap_name, "echo");
        assert_eq!(seg.args, vec!["hello", "world"]);
        assert_eq!(cmd.steps[0].connector, None);
    }

    #[test]
    fn test_pipe_split() {
        let reg = registry();
        let cmd = parse_command(&toks(&["echo", "hi", OP_PIPE, "wc", "-l"]), &reg).unwrap();
        let segs = &cmd.steps[0].pipeline.segments;
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].cap_name, "echo");
        assert_eq!(segs[1].cap_name, "wc");
        assert_eq!(segs[1].args, vec!["-l"]);
    }

    #[test]
    fn test_redirects_extracted_anywhere() {
        let reg = registry();
        let p = parse_pipeline(
            &toks(&[OP_REDIRECT_IN, "in.txt", "sort", OP_REDIRECT_OUT, "out.txt"]),
            &reg,
        )
        .unwrap();
        assert_eq!(p.redirect_in.as_deref(), Some(std::path::Path::new("in.txt")));
        assert_eq!(
            p.redirect_out.as_deref(),
            Some(std::path::Path::new("out.txt"))
        );
        assert_eq!(p.segments[0].cap_name, "sort");
    }

    #[test]
    fn test_duplicate_redirect_rejected() {
        let reg = registry();
        let err = parse_pipeline(
            &toks(&["sort", OP_REDIRECT_OUT, "a", OP_REDIRECT_OUT, "b"]),
            &reg,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ParseError::DuplicateRedirect {
                op: OP_REDIRECT_OUT,
                pos: 3
            }
        );
    }

    #[test]
    fn test_redirect_without_target_rejected() {
        let reg = registry();
        let err = parse_pipeline(&toks(&["sort", OP_REDIRECT_OUT]), &reg).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingRedirectTarget {
                op: OP_REDIRECT_OUT,
                pos: 1
            }
        );
    }

    #[test]
    fn test_empty_command() {
        let reg = registry();
        assert_eq!(parse_command(&[], &reg).unwrap_err(), ParseError::EmptyCommand);
    }

    #[test]
    fn test_empty_segments_around_pipe() {
        let reg = registry();
        assert!(matches!(
            parse_pipeline(&toks(&[OP_PIPE, "wc"]), &reg).unwrap_err(),
            ParseError::EmptySegment { pos: 0 }
        ));
        assert!(matches!(
            parse_pipeline(&toks(&["echo", "hi", OP_PIPE]), &reg).unwrap_err(),
            ParseError::EmptySegment { .. }
        ));
    }

    #[test]
    fn test_compound_operators() {
        let reg = registry();
        let cmd = parse_command(
            &toks(&[
                "make",
                "all",
                OP_AND_THEN,
                "echo",
                "built",
                OP_OR_ELSE,
                "echo",
                "failed",
                OP_SEQUENTIAL,
                "echo",
                "done",
            ]),
            &reg,
        )
        .unwrap();
        assert_eq!(cmd.steps.len(), 4);
        assert_eq!(cmd.steps[0].connector, Some(Connector::AndThen));
        assert_eq!(cmd.steps[1].connector, Some(Connector::OrElse));
        assert_eq!(cmd.steps[2].connector, Some(Connector::Sequential));
        assert_eq!(cmd.steps[3].connector, None);
    }

    #[test]
    fn test_operator_at_boundaries_rejected() {
        let reg = registry();
        assert!(matches!(
            parse_command(&toks(&[OP_AND_THEN, "echo", "hi"]), &reg).unwrap_err(),
            ParseError::EmptyStep { pos: 0, .. }
        ));
        assert!(matches!(
            parse_command(&toks(&["echo", "hi", OP_AND_THEN]), &reg).unwrap_err(),
            ParseError::EmptyStep { pos: 2, .. }
        ));
        assert!(matches!(
            parse_command(&toks(&["echo", "hi", OP_AND_THEN, OP_OR_ELSE, "echo"]), &reg)
                .unwrap_err(),
            ParseError::EmptyStep { pos: 3, .. }
        ));
    }

    #[test]
    fn test_unknown_capability_with_position() {
        let reg = registry();
        let err = parse_command(&toks(&["echo", "hi", OP_PIPE, "frobnicate"]), &reg).unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownCapability {
                name: "frobnicate".to_string(),
                pos: 3
            }
        );
    }

    #[test]
    fn test_render_round_trip() {
        let reg = registry();
        let cases: Vec<Vec<String>> = vec![
            toks(&["echo", "hello", "world", OP_PIPE, "tr", "a-z", "A-Z"]),
            toks(&[
                "sort",
                OP_REDIRECT_IN,
                "in.txt",
                OP_REDIRECT_OUT,
                "out.txt",
                OP_AND_THEN,
                "echo",
                "ok",
            ]),
            toks(&["make", OP_OR_ELSE, "echo", "failed", OP_SEQUENTIAL, "ls"]),
        ];
        for tokens in cases {
            let cmd = parse_command(&tokens, &reg).unwrap();
            let rendered = cmd.render();
            let reparsed = parse_command(&rendered, &reg).unwrap();
            assert_eq!(cmd, reparsed, "round trip failed for {tokens:?}");
        }
    }
}
