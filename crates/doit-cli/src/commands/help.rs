//! `doit --help [<capability>]` and `doit --help-agent`.

use std::io::Write;

use doit_core::capability::Registry;
use doit_core::pipeline::{
    OP_AND_THEN, OP_OR_ELSE, OP_PIPE, OP_REDIRECT_IN, OP_REDIRECT_OUT, OP_SEQUENTIAL,
};

const HELP_AGENT: &str = include_str!("help_agent.md");

/// Writes help for a capability, or general usage when `topic` is empty.
pub fn run(registry: &Registry, out: &mut impl Write, topic: &str) -> i32 {
    if topic.is_empty() {
        print_general_help(out);
        return 0;
    }

    match registry.lookup(topic) {
        Ok(cap) => {
            let _ = writeln!(out, "{} — {}", cap.name(), cap.description());
            let _ = writeln!(out, "tier: {}", cap.tier());
            0
        }
        Err(e) => {
            let _ = writeln!(out, "doit help: {e}");
            1
        }
    }
}

/// General help followed by the agent-oriented guide.
pub fn run_agent(out: &mut impl Write) -> i32 {
    print_general_help(out);
    let _ = writeln!(out);
    let _ = write!(out, "{HELP_AGENT}");
    0
}

fn print_general_help(out: &mut impl Write) {
    let _ = writeln!(out, "doit — capability broker for coding agents");
    let _ = writeln!(out);
    let _ = writeln!(out, "usage:");
    let _ = writeln!(out, "  doit <capability> [args...]       run a command");
    let _ = writeln!(out, "  doit <cmd> {OP_PIPE} <cmd> ...           run a pipeline");
    let _ = writeln!(out, "  doit --retry <command>            bypass bypassable rules once");
    let _ = writeln!(out, "  doit --approved <token> <command> consume an approval token");
    let _ = writeln!(out, "  doit --list [--tier <tier>]       list available capabilities");
    let _ = writeln!(out, "  doit --help [<capability>]        show help");
    let _ = writeln!(out, "  doit --audit <verify|show|tail>   audit log operations");
    let _ = writeln!(out, "  doit --version                    show version");
    let _ = writeln!(out);
    let _ = writeln!(out, "pipeline operators:");
    let _ = writeln!(out, "  {OP_PIPE}   pipe (stdout → stdin)");
    let _ = writeln!(out, "  {OP_REDIRECT_OUT}   redirect stdout to file");
    let _ = writeln!(out, "  {OP_REDIRECT_IN}   redirect stdin from file");
    let _ = writeln!(out, "  {OP_AND_THEN}  and-then (short-circuit)");
    let _ = writeln!(out, "  {OP_OR_ELSE}   or-else (run if previous failed)");
    let _ = writeln!(out, "  {OP_SEQUENTIAL}   sequential (run regardless)");
    let _ = writeln!(out);
    let _ = writeln!(out, "safety tiers: read, build, write, dangerous");
}
