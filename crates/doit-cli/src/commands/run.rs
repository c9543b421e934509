//! Command execution: daemon relay, with the in-process fallback running
//! the same parser, policy chain, engine, and audit logger locally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use doit_core::audit::{Logger, LogRecord};
use doit_core::capability::{ExecContext, Registry};
use doit_core::config::Config;
use doit_core::ipc::{capture_env, Request};
use doit_core::pipeline::{self, Command};
use doit_core::policy::{
    default_store_path, level2_from_store, Decision, EvalInfo, Level1, PolicyEngine,
    PolicyRequest,
};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client;

/// Runs a command per the daemon-mode setting: require the daemon, stay
/// in-process, or (auto) try the daemon and fall back when it cannot be
/// reached. A failure *after* the relay started never falls back, since
/// the command may already be running.
pub async fn execute(
    config: &Config,
    registry: Arc<Registry>,
    args: Vec<String>,
    retry: bool,
    approved: Option<String>,
) -> i32 {
    match config.daemon.enabled {
        Some(false) => run_local(config, registry, &args, retry, approved.as_deref()).await,
        Some(true) => match connect().await {
            Ok(stream) => relay(stream, &args, retry, approved).await,
            Err(e) => {
                eprintln!("doit: {e}");
                2
            }
        },
        None => match connect().await {
            Ok(stream) => relay(stream, &args, retry, approved).await,
            Err(e) => {
                debug!("daemon unavailable ({e}), running in-process");
                run_local(config, registry, &args, retry, approved.as_deref()).await
            }
        },
    }
}

async fn connect() -> Result<UnixStream, client::ClientError> {
    let self_path = std::env::current_exe()?;
    client::connect_or_spawn(&self_path).await
}

async fn relay(stream: UnixStream, args: &[String], retry: bool, approved: Option<String>) -> i32 {
    let request = Request {
        args: args.to_vec(),
        cwd: current_dir(),
        retry,
        approved,
        env: capture_env(),
        justification: String::new(),
        safety_arg: String::new(),
    };
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    match client::relay(stream, &request, tokio::io::stdin(), &mut stdout, &mut stderr).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("doit: {e}");
            2
        }
    }
}

/// The in-process path: same parse → policy → validate → execute → audit
/// sequence the daemon runs, inside the CLI process. Approval tokens live
/// in the daemon's memory, so `--approved` cannot be honored here and a
/// terminal escalation surfaces the `--retry` hint instead of a token.
async fn run_local(
    config: &Config,
    registry: Arc<Registry>,
    args: &[String],
    retry: bool,
    approved: Option<&str>,
) -> i32 {
    if approved.is_some() {
        eprintln!("doit: approval tokens require the daemon");
        return 1;
    }

    let logger = match Logger::open(&config.audit.path) {
        Ok(logger) => Some(logger),
        Err(e) => {
            warn!("audit disabled: {e}");
            None
        }
    };

    let command = match pipeline::parse_command(args, &registry) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("doit: {e}");
            return 1;
        }
    };

    let cwd = current_dir();
    let mut policy_req = PolicyRequest::from_command(&command, &registry, &cwd, retry);
    policy_req.command = args.join(" ");

    let mut eval_info = None;
    if let Some(result) = local_policy_engine(config).evaluate(&policy_req).await {
        let info = EvalInfo::from_result(&result, &policy_req);
        match result.decision {
            Decision::Allow => eval_info = Some(info),
            Decision::Deny => {
                audit(
                    logger.as_ref(),
                    args,
                    &command,
                    &registry,
                    1,
                    &result.reason,
                    Duration::ZERO,
                    &cwd,
                    retry,
                    Some(info),
                );
                eprintln!("doit: policy: {}", result.reason);
                return 1;
            }
            Decision::Escalate => {
                audit(
                    logger.as_ref(),
                    args,
                    &command,
                    &registry,
                    1,
                    &result.reason,
                    Duration::ZERO,
                    &cwd,
                    retry,
                    Some(info),
                );
                eprintln!("doit: policy: approval required: {}", result.reason);
                eprintln!(
                    "doit: approval tokens require the daemon; for a bypassable rule, retry \
                     with: doit --retry {}",
                    args.join(" ")
                );
                return 1;
            }
        }
    }

    if let Err(e) = pipeline::validate_command(&command, &registry) {
        eprintln!("doit: {e}");
        return 1;
    }

    let cancel = CancellationToken::new();
    let interrupt_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt_cancel.cancel();
        }
    });

    // Children inherit this process's environment and run in its cwd.
    let ctx = ExecContext::new(Arc::clone(&registry))
        .with_cwd(&cwd)
        .with_cancel(cancel);

    let started = Instant::now();
    let result = pipeline::execute_command(
        &ctx,
        &command,
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
        Box::new(tokio::io::stderr()),
    )
    .await;
    let duration = started.elapsed();

    let (code, error) = match &result {
        Ok(()) => (0, String::new()),
        Err(e) if e.is_silent() => (e.exit_code(), String::new()),
        Err(e) => (e.exit_code(), e.to_string()),
    };
    if !error.is_empty() {
        eprintln!("doit: {error}");
    }

    audit(
        logger.as_ref(),
        args,
        &command,
        &registry,
        code,
        &error,
        duration,
        &cwd,
        retry,
        eval_info,
    );
    code
}

/// Level 1 and Level 2 per config; never Level 3, because the gatekeeper's
/// escalation path needs the daemon's token store to be useful.
fn local_policy_engine(config: &Config) -> PolicyEngine {
    let level1 = config
        .policy
        .level1_enabled
        .then(|| Level1::new(&config.effective_rules()));

    let level2 = if config.policy.level2_enabled {
        let path = config
            .policy
            .level2_path
            .clone()
            .unwrap_or_else(default_store_path);
        match level2_from_store(&path) {
            Ok(level2) => Some(level2),
            Err(e) => {
                warn!("failed to load learned policy: {e}");
                None
            }
        }
    } else {
        None
    };

    PolicyEngine::new(level1, level2, None)
}

#[allow(clippy::too_many_arguments)]
fn audit(
    logger: Option<&Logger>,
    args: &[String],
    command: &Command,
    registry: &Registry,
    exit_code: i32,
    error: &str,
    duration: Duration,
    cwd: &str,
    retry: bool,
    policy: Option<EvalInfo>,
) {
    let Some(logger) = logger else { return };

    let mut segments = Vec::new();
    let mut tiers = Vec::new();
    for seg in command.segments() {
        segments.push(seg.cap_name.clone());
        if let Ok(cap) = registry.lookup(&seg.cap_name) {
            tiers.push(cap.tier().to_string());
        }
    }

    let record = LogRecord {
        pipeline: args.join(" "),
        segments,
        tiers,
        exit_code,
        error: error.to_string(),
        duration,
        cwd: cwd.to_string(),
        retry,
        policy,
    };
    if let Err(e) = logger.append(record) {
        warn!("audit append failed: {e}");
    }
}

fn current_dir() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}
