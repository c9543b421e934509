//! Thread-safe capability registry with per-tier enable switches.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{Capability, CapabilityError, Tier};

struct Inner {
    caps: HashMap<String, Arc<dyn Capability>>,
    tiers: [bool; 4],
}

/// Maps capability names to implementations and gates access by tier.
///
/// Registration and tier switches happen once at startup; afterwards the
/// registry is read-only and lookups run under the read half of the lock
/// without contention.
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Creates a registry with every tier enabled except `dangerous`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                caps: HashMap::new(),
                tiers: [true, true, true, false],
            }),
        }
    }

    /// Adds a capability, replacing any previous one of the same name.
    pub fn register(&self, cap: Arc<dyn Capability>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.caps.insert(cap.name().to_string(), cap);
    }

    /// Returns the capability registered under `name`.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::Unknown`] if nothing is registered under `name`.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Capability>, CapabilityError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .caps
            .get(name)
            .cloned()
            .ok_or_else(|| CapabilityError::Unknown(name.to_string()))
    }

    /// Checks that `tier` is enabled.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::TierDisabled`] if the tier is switched off.
    pub fn check_tier(&self, tier: Tier) -> Result<(), CapabilityError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        if inner.tiers[tier as usize] {
            Ok(())
        } else {
            Err(CapabilityError::TierDisabled(tier))
        }
    }

    /// Enables or disables a tier. Used once at startup.
    pub fn set_tier(&self, tier: Tier, enabled: bool) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.tiers[tier as usize] = enabled;
    }

    /// Reports whether `tier` is currently enabled.
    #[must_use]
    pub fn tier_enabled(&self, tier: Tier) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.tiers[tier as usize]
    }

    /// All registered capabilities, sorted by name.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Capability>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut caps: Vec<_> = inner.caps.values().cloned().collect();
        caps.sort_by_key(|c| c.name());
        caps
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
