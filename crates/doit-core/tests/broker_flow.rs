//! Library-level broker flow: parse → policy → validate → execute → audit,
//! the same sequence both the daemon and the in-process CLI fallback run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use doit_core::audit::{self, LogRecord, Logger};
use doit_core::capability::{builtin, Capability, CapabilityError, ExecContext, Registry, Tier};
use doit_core::config::Config;
use doit_core::io::{BoxedReader, BoxedWriter};
use doit_core::pipeline::{self, OP_AND_THEN, OP_OR_ELSE, OP_PIPE};
use doit_core::policy::{Decision, EvalInfo, Level1, PolicyEngine, PolicyRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct Upper;

#[async_trait]
impl Capability for Upper {
    fn name(&self) -> &'static str {
        "upper"
    }
    fn description(&self) -> &'static str {
        "uppercase stdin"
    }
    fn tier(&self) -> Tier {
        Tier::Read
    }
    fn validate(&self, _args: &[String]) -> Result<(), CapabilityError> {
        Ok(())
    }
    async fn run(
        &self,
        _ctx: &ExecContext,
        _args: &[String],
        mut stdin: BoxedReader,
        mut stdout: BoxedWriter,
        _stderr: BoxedWriter,
    ) -> Result<(), CapabilityError> {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stdin.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n].to_ascii_uppercase()).await?;
        }
        stdout.flush().await?;
        Ok(())
    }
}

struct Fail;

#[async_trait]
impl Capability for Fail {
    fn name(&self) -> &'static str {
        "fail"
    }
    fn description(&self) -> &'static str {
        "always fails"
    }
    fn tier(&self) -> Tier {
        Tier::Read
    }
    fn validate(&self, _args: &[String]) -> Result<(), CapabilityError> {
        Ok(())
    }
    async fn run(
        &self,
        _ctx: &ExecContext,
        _args: &[String],
        _stdin: BoxedReader,
        _stdout: BoxedWriter,
        _stderr: BoxedWriter,
    ) -> Result<(), CapabilityError> {
        Err(CapabilityError::ChildExit(1))
    }
}

fn registry() -> Arc<Registry> {
    let reg = Registry::new();
    builtin::register_all(&reg);
    reg.register(Arc::new(Upper));
    reg.register(Arc::new(Fail));
    Arc::new(reg)
}

fn toks(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

/// One full invocation against a shared logger, mirroring the daemon's
/// per-connection sequence.
async fn invoke(
    registry: &Arc<Registry>,
    logger: &Logger,
    engine: &PolicyEngine,
    tokens: &[&str],
    retry: bool,
) -> (i32, String) {
    let args = toks(tokens);
    let command = pipeline::parse_command(&args, registry).expect("parse");

    let mut policy_req = PolicyRequest::from_command(&command, registry, "/work", retry);
    policy_req.command = args.join(" ");

    let mut eval_info = None;
    if let Some(result) = engine.evaluate(&policy_req).await {
        let info = EvalInfo::from_result(&result, &policy_req);
        if result.decision != Decision::Allow {
            logger
                .append(LogRecord {
                    pipeline: policy_req.command.clone(),
                    segments: policy_req.segments.iter().map(|s| s.cap_name.clone()).collect(),
                    tiers: policy_req.segments.iter().map(|s| s.tier.to_string()).collect(),
                    exit_code: 1,
                    error: result.reason.clone(),
                    duration: Duration::ZERO,
                    cwd: "/work".to_string(),
                    retry,
                    policy: Some(info),
                })
                .expect("audit");
            return (1, String::new());
        }
        eval_info = Some(info);
    }

    pipeline::validate_command(&command, registry).expect("validate");

    let ctx = ExecContext::new(Arc::clone(registry));
    let (out_w, mut out_r) = tokio::io::duplex(64 * 1024);
    let started = Instant::now();
    let run = pipeline::execute_command(
        &ctx,
        &command,
        Box::new(tokio::io::empty()),
        Box::new(out_w),
        Box::new(tokio::io::sink()),
    );
    let read = async {
        let mut out = String::new();
        out_r.read_to_string(&mut out).await.unwrap();
        out
    };
    let (result, output) = tokio::join!(run, read);

    let code = match &result {
        Ok(()) => 0,
        Err(e) => e.exit_code(),
    };
    logger
        .append(LogRecord {
            pipeline: policy_req.command.clone(),
            segments: policy_req.segments.iter().map(|s| s.cap_name.clone()).collect(),
            tiers: policy_req.segments.iter().map(|s| s.tier.to_string()).collect(),
            exit_code: code,
            error: String::new(),
            duration: started.elapsed(),
            cwd: "/work".to_string(),
            retry,
            policy: eval_info,
        })
        .expect("audit");

    (code, output)
}

#[tokio::test]
async fn test_full_flow_builds_a_verifiable_chain() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let logger = Logger::open(&audit_path).unwrap();
    let registry = registry();
    let engine = PolicyEngine::new(Some(Level1::new(&Config::default_rules())), None, None);

    let (code, out) = invoke(
        &registry,
        &logger,
        &engine,
        &["echo", "hello", "world", OP_PIPE, "upper"],
        false,
    )
    .await;
    assert_eq!(code, 0);
    assert_eq!(out, "HELLO WORLD\n");

    let (code, out) = invoke(
        &registry,
        &logger,
        &engine,
        &["fail", OP_AND_THEN, "echo", "skipped"],
        false,
    )
    .await;
    assert_eq!(code, 1);
    assert_eq!(out, "");

    let (code, out) = invoke(
        &registry,
        &logger,
        &engine,
        &[
            "fail", OP_AND_THEN, "echo", "no", OP_OR_ELSE, "echo", "yes",
        ],
        false,
    )
    .await;
    assert_eq!(code, 0);
    assert!(out.contains("yes") && !out.contains("no"));

    // Denied command: still audited, nothing executed. Policy fires before
    // tier validation, so the denial wins even with `dangerous` disabled.
    let (code, out) = invoke(&registry, &logger, &engine, &["rm", "-rf", "/"], true).await;
    assert_eq!(code, 1);
    assert_eq!(out, "");

    // Four invocations, four chained entries, all verifiable.
    assert_eq!(audit::verify(&audit_path).unwrap(), 4);
    let entries = audit::tail(&audit_path, 20).unwrap();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].segments, vec!["echo", "upper"]);
    assert_eq!(entries[0].tiers, vec!["read", "read"]);
    assert_eq!(entries[0].policy_rule_id, "allow-safe-pipeline");
    assert_eq!(entries[1].exit_code, 1);
    assert_eq!(entries[3].policy_rule_id, "deny-rm-catastrophic");
    assert!(entries[3].retry);

    // A second logger over the same file continues the chain seamlessly.
    let reopened = Logger::open(&audit_path).unwrap();
    let entry = reopened
        .append(LogRecord {
            pipeline: "echo again".to_string(),
            segments: vec!["echo".to_string()],
            tiers: vec!["read".to_string()],
            duration: Duration::from_millis(1),
            cwd: "/work".to_string(),
            ..LogRecord::default()
        })
        .unwrap();
    assert_eq!(entry.seq, 5);
    assert_eq!(audit::verify(&audit_path).unwrap(), 5);
}
