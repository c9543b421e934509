//! Single-use, time-limited approval tokens.
//!
//! A terminal `Escalate` issues a token bound to the exact argv it was
//! asked about. Presenting the token back (`--approved <hex>`) skips policy
//! once; the token is removed on its first validation attempt regardless of
//! outcome.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;

use super::PolicyError;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

/// Metadata for an issued approval token.
#[derive(Debug, Clone)]
pub struct TokenEntry {
    /// Human-readable command string the token was issued for.
    pub command: String,
    /// Exact argv the token is bound to.
    pub args: Vec<String>,
    /// Issue time.
    pub created_at: Instant,
    /// Expiry time.
    pub expires_at: Instant,
}

/// In-memory store of outstanding approval tokens.
///
/// All operations are linearizable under one mutex.
pub struct TokenStore {
    tokens: Mutex<HashMap<String, TokenEntry>>,
    ttl: Duration,
}

impl TokenStore {
    /// Creates a store with the given token lifetime.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Issues a token for `command`/`args`: 16 cryptographically-random
    /// bytes, hex-encoded to 32 characters.
    #[must_use]
    pub fn issue(&self, command: &str, args: &[String]) -> String {
        let mut raw = [0u8; 16];
        OsRng.fill_bytes(&mut raw);
        let token = hex::encode(raw);

        let now = Instant::now();
        let entry = TokenEntry {
            command: command.to_string(),
            args: args.to_vec(),
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.tokens
            .lock()
            .expect("token lock poisoned")
            .insert(token.clone(), entry);

        token
    }

    /// Checks and consumes a token. The token is deleted immediately,
    /// before expiry and exact argv equality are checked: single use
    /// regardless of outcome.
    ///
    /// # Errors
    ///
    /// [`PolicyError::UnknownToken`], [`PolicyError::TokenExpired`], or
    /// [`PolicyError::TokenArgsMismatch`].
    pub fn validate(&self, token: &str, args: &[String]) -> Result<TokenEntry, PolicyError> {
        let mut tokens = self.tokens.lock().expect("token lock poisoned");

        let entry = tokens.remove(token).ok_or(PolicyError::UnknownToken)?;

        if Instant::now() > entry.expires_at {
            return Err(PolicyError::TokenExpired);
        }
        if entry.args != args {
            return Err(PolicyError::TokenArgsMismatch);
        }

        Ok(entry)
    }

    /// Removes all entries past expiry.
    pub fn purge(&self) {
        let now = Instant::now();
        self.tokens
            .lock()
            .expect("token lock poisoned")
            .retain(|_, entry| now <= entry.expires_at);
    }

    /// Number of outstanding tokens (expired or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.lock().expect("token lock poisoned").len()
    }

    /// Whether the store holds no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_issue_then_validate_once() {
        let store = TokenStore::new(DEFAULT_TOKEN_TTL);
        let argv = args(&["git", "push", "--force"]);
        let token = store.issue("git push --force", &argv);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        let entry = store.validate(&token, &argv).unwrap();
        assert_eq!(entry.args, argv);

        // Second use fails: the token was consumed.
        assert!(matches!(
            store.validate(&token, &argv),
            Err(PolicyError::UnknownToken)
        ));
    }

    #[test]
    fn test_args_mismatch_consumes_token() {
        let store = TokenStore::new(DEFAULT_TOKEN_TTL);
        let argv = args(&["rm", "-rf", "build"]);
        let token = store.issue("rm -rf build", &argv);

        assert!(matches!(
            store.validate(&token, &args(&["rm", "-rf", "/"])),
            Err(PolicyError::TokenArgsMismatch)
        ));
        // Removed even though validation failed.
        assert!(matches!(
            store.validate(&token, &argv),
            Err(PolicyError::UnknownToken)
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let store = TokenStore::new(Duration::ZERO);
        let argv = args(&["make"]);
        let token = store.issue("make", &argv);
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            store.validate(&token, &argv),
            Err(PolicyError::TokenExpired)
        ));
    }

    #[test]
    fn test_purge_drops_only_expired() {
        let short = TokenStore::new(Duration::ZERO);
        let _ = short.issue("a", &args(&["a"]));
        std::thread::sleep(Duration::from_millis(5));
        short.purge();
        assert!(short.is_empty());

        let long = TokenStore::new(DEFAULT_TOKEN_TTL);
        let _ = long.issue("b", &args(&["b"]));
        long.purge();
        assert_eq!(long.len(), 1);
    }

    #[test]
    fn test_tokens_are_unique() {
        let store = TokenStore::new(DEFAULT_TOKEN_TTL);
        let a = store.issue("x", &args(&["x"]));
        let b = store.issue("x", &args(&["x"]));
        assert_ne!(a, b);
    }
}
