//! Explicit engine registry.
//!
//! The host application owns one registry value and passes handles to the
//! components that need it; there is no ambient global engine state.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::pool::{EnginePool, PoolSettings};
use crate::starter::{ConnectionStarter, EngineStarter};

/// Maps engine names to their pools and owns pool construction.
pub struct EngineRegistry {
    starter: Arc<dyn ConnectionStarter>,
    settings: PoolSettings,
    pools: Mutex<HashMap<String, Arc<EnginePool>>>,
}

impl EngineRegistry {
    /// A registry using the default process/remote starter.
    #[must_use]
    pub fn new(settings: PoolSettings) -> Self {
        Self::with_starter(Arc::new(EngineStarter), settings)
    }

    /// A registry whose pools obtain connections from `starter`.
    #[must_use]
    pub fn with_starter(starter: Arc<dyn ConnectionStarter>, settings: PoolSettings) -> Self {
        Self {
            starter,
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Builds and registers the pool for `config`, locking the config.
    ///
    /// Must be called within an async runtime.
    pub fn register(&self, config: EngineConfig) -> EngineResult<Arc<EnginePool>> {
        let mut pools = self.pools.lock().expect("pools lock poisoned");
        if pools.contains_key(&config.name) {
            return Err(EngineError::Protocol {
                message: format!("engine '{}' is already registered", config.name),
            });
        }

        let config = Arc::new(config);
        let pool = EnginePool::start(
            Arc::clone(&config),
            Arc::clone(&self.starter),
            self.settings.clone(),
        )?;
        pools.insert(config.name.clone(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Pool serving the named engine, if registered.
    #[must_use]
    pub fn pool(&self, engine: &str) -> Option<Arc<EnginePool>> {
        self.pools.lock().expect("pools lock poisoned").get(engine).cloned()
    }

    /// Pool of the engine flagged as the default selection.
    #[must_use]
    pub fn default_pool(&self) -> Option<Arc<EnginePool>> {
        self.pools
            .lock()
            .expect("pools lock poisoned")
            .values()
            .find(|pool| pool.config().default_engine)
            .cloned()
    }

    /// Closes every pool's connections, best effort.
    ///
    /// Each pool's aggregate failure is collected; one engine failing to
    /// shut down never prevents closing the others.
    pub async fn close_all(&self) -> Vec<EngineError> {
        let pools: Vec<Arc<EnginePool>> = self
            .pools
            .lock()
            .expect("pools lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for pool in pools {
            if let Err(error) = pool.close_connections().await {
                failures.push(error);
            }
        }
        failures
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .pools
            .lock()
            .expect("pools lock poisoned")
            .keys()
            .cloned()
            .collect();
        f.debug_struct("EngineRegistry").field("engines", &names).finish()
    }
}
