//! Curated environment capture.
//!
//! The client forwards a small allow-listed slice of its environment in the
//! request; the daemon uses it as the child process environment so commands
//! see the caller's PATH and locale rather than the daemon's.

use std::collections::HashMap;

/// Variables propagated from client to daemon by exact name.
const CURATED_KEYS: [&str; 8] = [
    "HOME", "PATH", "USER", "SHELL", "TERM", "LANG", "GOPATH", "GOROOT",
];

/// Prefixes of additional propagated variables.
const CURATED_PREFIXES: [&str; 1] = ["LC_"];

/// Builds the curated environment map from the current process.
#[must_use]
pub fn capture_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in CURATED_KEYS {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    for (key, value) in std::env::vars() {
        if CURATED_PREFIXES.iter().any(|p| key.starts_with(p)) {
            env.insert(key, value);
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_env_is_allow_listed() {
        std::env::set_var("LC_DOIT_TEST", "x");
        std::env::set_var("DOIT_SECRET_TEST", "y");
        let env = capture_env();
        std::env::remove_var("LC_DOIT_TEST");
        std::env::remove_var("DOIT_SECRET_TEST");

        assert_eq!(env.get("LC_DOIT_TEST").map(String::as_str), Some("x"));
        assert!(!env.contains_key("DOIT_SECRET_TEST"));
        for key in env.keys() {
            assert!(
                CURATED_KEYS.contains(&key.as_str())
                    || CURATED_PREFIXES.iter().any(|p| key.starts_with(p)),
                "unexpected key {key}"
            );
        }
    }
}
