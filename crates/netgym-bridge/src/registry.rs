//! Named environment configurations.
//!
//! ```
//! use netgym_bridge::registry::Registry;
//! use netgym_core::config::BridgeConfig;
//!
//! let mut registry = Registry::new();
//! registry.register("highway-v0", BridgeConfig::for_scenario("scenarios/highway")).unwrap();
//! let env = registry.make("highway-v0").unwrap();
//! assert!(env.action_space().is_none());
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

use netgym_core::config::BridgeConfig;

use crate::env::NetGymEnv;
use crate::error::BridgeError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Environment {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("No environment registered as {0:?}")]
    Unknown(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, BridgeConfig>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `config` under `id`. Ids are unique.
    pub fn register(&mut self, id: impl Into<String>, config: BridgeConfig) -> Result<(), RegistryError> {
        let id = id.into();
        if self.entries.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        self.entries.insert(id, config);
        Ok(())
    }

    /// Create a fresh environment from the configuration registered as `id`.
    pub fn make(&self, id: &str) -> Result<NetGymEnv, RegistryError> {
        self.make_with(id, |_| {})
    }

    /// Like [`make`](Self::make), adjusting a copy of the configuration first.
    pub fn make_with(
        &self,
        id: &str,
        adjust: impl FnOnce(&mut BridgeConfig),
    ) -> Result<NetGymEnv, RegistryError> {
        let mut config = self
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(id.to_string()))?;
        adjust(&mut config);
        Ok(NetGymEnv::new(config)?)
    }

    pub fn get(&self, id: &str) -> Option<&BridgeConfig> {
        self.entries.get(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
