//! `doit --list [--tier <tier>]`.

use std::io::Write;

use doit_core::capability::{Registry, Tier};

/// Writes the registered capabilities to `out`, optionally filtered by
/// tier.
pub fn run(registry: &Registry, out: &mut impl Write, tier_filter: Option<&str>) -> i32 {
    let filter = match tier_filter {
        Some(name) => match name.parse::<Tier>() {
            Ok(tier) => Some(tier),
            Err(e) => {
                let _ = writeln!(out, "doit list: {e}");
                return 1;
            }
        },
        None => None,
    };

    for cap in registry.all() {
        if let Some(tier) = filter {
            if cap.tier() != tier {
                continue;
            }
        }
        let _ = writeln!(
            out,
            "{:<12} {:<10} {}",
            cap.name(),
            cap.tier(),
            cap.description()
        );
    }
    0
}

#[cfg(test)]
mod tests {
    use doit_core::capability::builtin;

    use super::*;

    fn registry() -> Registry {
        let reg = Registry::new();
        builtin::register_all(&reg);
        reg
    }

    fn listing(tier: Option<&str>) -> (i32, String) {
        let mut out = Vec::new();
        let code = run(&registry(), &mut out, tier);
        (code, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_lists_all_sorted() {
        let (code, out) = listing(None);
        assert_eq!(code, 0);
        let names: Vec<&str> = out
            .lines()
            .map(|l| l.split_whitespace().next().unwrap())
            .collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        assert!(out.contains("grep"));
        assert!(out.contains("dangerous"));
    }

    #[test]
    fn test_tier_filter() {
        let (code, out) = listing(Some("dangerous"));
        assert_eq!(code, 0);
        assert!(out.contains("rm"));
        assert!(out.contains("chmod"));
        assert!(!out.contains("grep"));
    }

    #[test]
    fn test_unknown_tier() {
        let (code, out) = listing(Some("radioactive"));
        assert_eq!(code, 1);
        assert!(out.contains("unknown tier"));
    }
}
