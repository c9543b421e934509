//! doit, a capability broker for autonomous coding agents.
//!
//! The binary is both the thin client and, under `--daemon`, the server: a
//! client that cannot reach the daemon spawns `doit --daemon` detached and
//! retries, so the first invocation cold-starts the broker.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use doit_cli::commands;
use doit_core::capability::{builtin, Registry};
use doit_core::config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// doit, a capability broker for coding agents.
///
/// Everything after the first non-flag token is the command itself, so
/// capability arguments (including ones that look like flags) pass through
/// untouched.
#[derive(Parser, Debug)]
#[command(name = "doit", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Run the daemon (internal; clients spawn this automatically).
    #[arg(long)]
    daemon: bool,

    /// List available capabilities.
    #[arg(long)]
    list: bool,

    /// Restrict --list to one tier.
    #[arg(long, value_name = "tier")]
    tier: Option<String>,

    /// Show help, optionally for one capability.
    #[arg(long, value_name = "capability", num_args = 0..=1, default_missing_value = "")]
    help: Option<String>,

    /// Show the agent-oriented usage guide.
    #[arg(long = "help-agent")]
    help_agent: bool,

    /// Audit log operations: verify, show, or tail.
    #[arg(long, value_name = "verify|show|tail")]
    audit: Option<String>,

    /// Print the version.
    #[arg(long)]
    version: bool,

    /// Bypass bypassable rules for this one invocation.
    #[arg(long)]
    retry: bool,

    /// Consume an approval token issued by a previous escalation.
    #[arg(long, value_name = "hex-token")]
    approved: Option<String>,

    /// The command: a capability name, its arguments, and any pipeline or
    /// compound operators.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("DOIT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprint!("{e}");
            return ExitCode::from(1);
        }
    };

    init_tracing(if cli.daemon { "info" } else { "warn" });

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("doit: config: {e}");
            return ExitCode::from(1);
        }
    };

    let registry = Arc::new(Registry::new());
    builtin::register_all(&registry);
    config.apply_tiers(&registry);

    let mut stdout = std::io::stdout();
    let code = if cli.daemon {
        commands::daemon::run(&config, registry).await
    } else if cli.version {
        println!("doit {}", env!("CARGO_PKG_VERSION"));
        0
    } else if cli.list {
        commands::list::run(&registry, &mut stdout, cli.tier.as_deref())
    } else if let Some(topic) = cli.help.as_deref() {
        commands::help::run(&registry, &mut stdout, topic)
    } else if cli.help_agent {
        commands::help::run_agent(&mut stdout)
    } else if let Some(subcmd) = cli.audit.as_deref() {
        commands::audit::run(&config, &mut stdout, subcmd)
    } else if cli.args.is_empty() {
        commands::help::run(&registry, &mut std::io::stderr(), "");
        1
    } else {
        commands::run::execute(&config, registry, cli.args, cli.retry, cli.approved).await
    };

    // Shells see the low byte of the status.
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    ExitCode::from((code & 0xff) as u8)
}
