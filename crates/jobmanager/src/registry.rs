//! Registries for active engines and chains.
//!
//! Both are looked up per job and per node, so engines and chains can come and
//! go while the manager is running. A job that already started keeps its own
//! execution plan; an engine that disappears mid-job is reported as not active.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use enhancer::{Chain, EnhancementEngine};

use crate::ChainError;

/// Name of the chain used when no default chain is configured.
pub const DEFAULT_CHAIN_NAME: &str = "default";

// ---------------------------------------------------------------------------
// EngineManager
// ---------------------------------------------------------------------------

/// The currently active engines, keyed by name.
#[derive(Default)]
pub struct EngineManager {
    engines: RwLock<HashMap<String, Arc<dyn EnhancementEngine>>>,
}

impl EngineManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `engine` under its name, replacing any engine with that name.
    pub fn register(&self, engine: Arc<dyn EnhancementEngine>) -> Option<Arc<dyn EnhancementEngine>> {
        let name = engine.name().to_owned();
        info!(engine = %name, "registered enhancement engine");
        self.engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, engine)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn EnhancementEngine>> {
        let removed = self
            .engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            info!(engine = name, "unregistered enhancement engine");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EnhancementEngine>> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Names of all active engines, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineManager").field("engines", &self.names()).finish()
    }
}

// ---------------------------------------------------------------------------
// ChainManager
// ---------------------------------------------------------------------------

/// The currently active chains, keyed by name.
#[derive(Debug, Default)]
pub struct ChainManager {
    chains: RwLock<HashMap<String, Arc<Chain>>>,
    default_chain: Option<String>,
}

impl ChainManager {
    /// `default_chain` names the chain used by
    /// [`default_chain`](Self::default_chain); without it the chain named
    /// [`DEFAULT_CHAIN_NAME`] is used.
    pub fn new(default_chain: Option<String>) -> Self {
        Self {
            chains: RwLock::default(),
            default_chain,
        }
    }

    pub fn register(&self, chain: Chain) -> Option<Arc<Chain>> {
        let name = chain.name().to_owned();
        info!(chain = %name, "registered enhancement chain");
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(chain))
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<Chain>> {
        let removed = self
            .chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            info!(chain = name, "unregistered enhancement chain");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<Chain>> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Like [`get`](Self::get), but an error for unknown names.
    pub fn require(&self, name: &str) -> Result<Arc<Chain>, ChainError> {
        self.get(name)
            .ok_or_else(|| ChainError::UnknownChain(name.to_owned()))
    }

    pub fn default_chain_name(&self) -> &str {
        self.default_chain.as_deref().unwrap_or(DEFAULT_CHAIN_NAME)
    }

    /// The chain used when a caller does not name one.
    pub fn default_chain(&self) -> Option<Arc<Chain>> {
        self.get(self.default_chain_name())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
