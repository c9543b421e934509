//! Built-in capabilities.
//!
//! Most are thin wrappers around the external binary of the same name,
//! declared through [`external_capability!`]. `git` and `go` additionally
//! compute an effective tier from their subcommand and consult the
//! registry's tier gate at run time.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Capability, CapabilityError, ExecContext, Registry, Tier};
use crate::io::{BoxedReader, BoxedWriter};

mod echo;
mod external;
mod git;
mod go;

pub use echo::Echo;
pub use git::Git;
pub use go::Go;

pub(crate) use external::run_external;

/// Declares a capability that execs the external binary of the same name.
macro_rules! external_capability {
    (
        $(#[$meta:meta])*
        $name:ident {
            name: $cap:literal,
            tier: $tier:expr,
            description: $desc:literal
            $(, require_args: $min:literal => $usage:literal)? $(,)?
        }
    ) => {
        $(#[$meta])*
        pub struct $name;

        #[async_trait]
        impl Capability for $name {
            fn name(&self) -> &'static str {
                $cap
            }

            fn description(&self) -> &'static str {
                $desc
            }

            fn tier(&self) -> Tier {
                $tier
            }

            fn validate(&self, args: &[String]) -> Result<(), CapabilityError> {
                let _ = args;
                $(
                    if args.len() < $min {
                        return Err(CapabilityError::InvalidArgs($usage.to_string()));
                    }
                )?
                Ok(())
            }

            async fn run(
                &self,
                ctx: &ExecContext,
                args: &[String],
                stdin: BoxedReader,
                stdout: BoxedWriter,
                stderr: BoxedWriter,
            ) -> Result<(), CapabilityError> {
                run_external(ctx, $cap, args, stdin, stdout, stderr).await
            }
        }
    };
}

external_capability! {
    /// `cat`: concatenate files to stdout.
    Cat {
        name: "cat",
        tier: Tier::Read,
        description: "concatenate files and print to stdout",
    }
}

external_capability! {
    /// `grep`: pattern search. The real grep validates its own args.
    Grep {
        name: "grep",
        tier: Tier::Read,
        description: "search file contents for patterns",
    }
}

external_capability! {
    /// `ls`: directory listing.
    Ls {
        name: "ls",
        tier: Tier::Read,
        description: "list directory contents",
    }
}

external_capability! {
    /// `find`: filesystem walk.
    Find {
        name: "find",
        tier: Tier::Read,
        description: "walk a directory tree and match files",
    }
}

external_capability! {
    /// `head`: first lines of input.
    Head {
        name: "head",
        tier: Tier::Read,
        description: "output the first part of files or stdin",
    }
}

external_capability! {
    /// `tail`: last lines of input.
    Tail {
        name: "tail",
        tier: Tier::Read,
        description: "output the last part of files or stdin",
    }
}

external_capability! {
    /// `sort`: sort lines.
    Sort {
        name: "sort",
        tier: Tier::Read,
        description: "sort lines of text",
    }
}

external_capability! {
    /// `uniq`: filter adjacent duplicate lines.
    Uniq {
        name: "uniq",
        tier: Tier::Read,
        description: "filter adjacent duplicate lines",
    }
}

external_capability! {
    /// `wc`: line/word/byte counts.
    Wc {
        name: "wc",
        tier: Tier::Read,
        description: "count lines, words, and bytes",
    }
}

external_capability! {
    /// `tr`: character translation.
    Tr {
        name: "tr",
        tier: Tier::Read,
        description: "translate or delete characters from stdin",
        require_args: 1 => "tr requires at least one argument",
    }
}

external_capability! {
    /// `tee`: copy stdin to stdout and files.
    Tee {
        name: "tee",
        tier: Tier::Write,
        description: "copy stdin to stdout and to files",
    }
}

external_capability! {
    /// `cp`: copy files.
    Cp {
        name: "cp",
        tier: Tier::Write,
        description: "copy files and directories",
    }
}

external_capability! {
    /// `mv`: move/rename files.
    Mv {
        name: "mv",
        tier: Tier::Write,
        description: "move or rename files and directories",
    }
}

external_capability! {
    /// `mkdir`: create directories.
    Mkdir {
        name: "mkdir",
        tier: Tier::Write,
        description: "create directories",
    }
}

external_capability! {
    /// `rm`: remove files (dangerous; also guarded by policy).
    Rm {
        name: "rm",
        tier: Tier::Dangerous,
        description: "remove files or directories (dangerous)",
        require_args: 1 => "rm requires at least one argument",
    }
}

external_capability! {
    /// `chmod`: change file modes.
    Chmod {
        name: "chmod",
        tier: Tier::Dangerous,
        description: "change file mode bits (dangerous)",
        require_args: 2 => "chmod requires a mode and at least one file",
    }
}

/// `make`: run the project's Makefile. Alternate makefiles are refused so
/// policy decisions stay tied to the checked-in build.
pub struct Make;

#[async_trait]
impl Capability for Make {
    fn name(&self) -> &'static str {
        "make"
    }

    fn description(&self) -> &'static str {
        "run make against the project's Makefile"
    }

    fn tier(&self) -> Tier {
        Tier::Build
    }

    fn validate(&self, args: &[String]) -> Result<(), CapabilityError> {
        for arg in args {
            if arg == "-f" || arg == "--file" || arg == "--makefile" {
                return Err(CapabilityError::InvalidArgs(format!(
                    "make {arg} is not allowed (must use the project's Makefile)"
                )));
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        ctx: &ExecContext,
        args: &[String],
        stdin: BoxedReader,
        stdout: BoxedWriter,
        stderr: BoxedWriter,
    ) -> Result<(), CapabilityError> {
        run_external(ctx, "make", args, stdin, stdout, stderr).await
    }
}

/// Adds all built-in capabilities to the registry.
pub fn register_all(registry: &Registry) {
    registry.register(Arc::new(Cat));
    registry.register(Arc::new(Chmod));
    registry.register(Arc::new(Cp));
    registry.register(Arc::new(Echo));
    registry.register(Arc::new(Find));
    registry.register(Arc::new(Git));
    registry.register(Arc::new(Go));
    registry.register(Arc::new(Grep));
    registry.register(Arc::new(Head));
    registry.register(Arc::new(Ls));
    registry.register(Arc::new(Make));
    registry.register(Arc::new(Mkdir));
    registry.register(Arc::new(Mv));
    registry.register(Arc::new(Rm));
    registry.register(Arc::new(Sort));
    registry.register(Arc::new(Tail));
    registry.register(Arc::new(Tee));
    registry.register(Arc::new(Tr));
    registry.register(Arc::new(Uniq));
    registry.register(Arc::new(Wc));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all_names_and_tiers() {
        let reg = Registry::new();
        register_all(&reg);

        assert_eq!(reg.lookup("grep").unwrap().tier(), Tier::Read);
        assert_eq!(reg.lookup("make").unwrap().tier(), Tier::Build);
        assert_eq!(reg.lookup("tee").unwrap().tier(), Tier::Write);
        assert_eq!(reg.lookup("rm").unwrap().tier(), Tier::Dangerous);
        assert_eq!(reg.all().len(), 20);
    }

    #[test]
    fn test_required_args() {
        let rm = Rm;
        assert!(rm.validate(&[]).is_err());
        assert!(rm.validate(&["file".to_string()]).is_ok());

        let chmod = Chmod;
        assert!(chmod.validate(&["644".to_string()]).is_err());
    }

    #[test]
    fn test_make_rejects_alternate_makefile() {
        let make = Make;
        let err = make.validate(&["-f".to_string(), "evil.mk".to_string()]);
        assert!(matches!(err, Err(CapabilityError::InvalidArgs(_))));
        assert!(make.validate(&["-j4".to_string(), "all".to_string()]).is_ok());
    }
}
