//! Flag-shape matching shared by Level 1 rules and Level 2 criteria.

/// Reports whether any element of `args` matches one of `flags`.
///
/// Handles the shapes agents actually produce:
///
/// - exact match: `-f` matches `-f`
/// - combined short flags: `-rf` matches `-r` and `-f`
/// - short flag with attached value: `-j4` matches `-j`
/// - long flag with `=`: `--force=yes` matches `--force`
#[must_use]
pub fn has_any_flag<S: AsRef<str>>(args: &[String], flags: &[S]) -> bool {
    for arg in args {
        if !arg.starts_with('-') {
            continue;
        }
        for flag in flags {
            let flag = flag.as_ref();
            if arg == flag {
                return true;
            }
            // Short flag: "-j" matches "-j4" (value suffix) and "-rf"
            // (combined).
            if flag.len() == 2
                && flag.starts_with('-')
                && !flag.starts_with("--")
                && arg.len() > 2
                && !arg.starts_with("--")
                && arg[1..].contains(&flag[1..])
            {
                return true;
            }
            // Long flag with =: "--force" matches "--force=yes".
            if flag.starts_with("--") && arg.starts_with(flag) && arg[flag.len()..].starts_with('=')
            {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_exact_match() {
        assert!(has_any_flag(&args(&["-f"]), &["-f"]));
        assert!(!has_any_flag(&args(&["file"]), &["-f"]));
    }

    #[test]
    fn test_combined_short_flags() {
        assert!(has_any_flag(&args(&["-rf"]), &["-r"]));
        assert!(has_any_flag(&args(&["-fr"]), &["-r"]));
        assert!(!has_any_flag(&args(&["-x"]), &["-r"]));
    }

    #[test]
    fn test_short_flag_with_value() {
        assert!(has_any_flag(&args(&["-j4"]), &["-j"]));
    }

    #[test]
    fn test_long_flag_with_value() {
        assert!(has_any_flag(&args(&["--force=yes"]), &["--force"]));
        assert!(has_any_flag(&args(&["--force"]), &["--force"]));
        assert!(!has_any_flag(&args(&["--force-with-lease"]), &["--force"]));
    }

    #[test]
    fn test_non_flag_args_ignored() {
        // A positional that merely contains the letter is not a flag hit.
        assert!(!has_any_flag(&args(&["report"]), &["-r"]));
    }
}
