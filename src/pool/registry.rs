//! Registry of pools keyed by namespace

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

use crate::core::config::EngineConfig;
use crate::core::errors::{ParallelError, Result};
use crate::pool::handler::Handler;
use crate::pool::pool::{Pool, PoolConfig};

/// Owns every pool created through it. Cloning shares the same pools.
#[derive(Clone)]
pub struct PoolRegistry {
    pools: Arc<DashMap<String, Pool>>,
    config: Arc<EngineConfig>,
}

impl PoolRegistry {
    /// Create an empty registry with the default engine configuration
    pub fn new() -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            config: Arc::new(EngineConfig::default()),
        }
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pools: Arc::new(DashMap::new()),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Pool configuration seeded with this registry's default settings
    pub fn pool_config<H: Handler>(&self, namespace: impl Into<String>, handler: H) -> PoolConfig {
        PoolConfig::new(namespace, handler).settings(self.config.defaults.clone())
    }

    /// Create and register a pool. A namespace that is already taken is
    /// rejected and the existing pool is left alone.
    ///
    /// Units are spawned without holding any map lock, so lookups stay
    /// responsive. If another caller registers the namespace first, the pool
    /// spawned here is dropped again.
    pub fn create_pool(&self, config: PoolConfig) -> Result<Pool> {
        config.validate(self.config.max_workers)?;
        if self.pools.contains_key(&config.namespace) {
            warn!(namespace = %config.namespace, "Pool namespace already registered");
            return Err(ParallelError::duplicate_namespace(config.namespace));
        }

        let namespace = config.namespace.clone();
        let pool = Pool::spawn(config, self.config.max_workers)?;
        match self.pools.entry(namespace) {
            Entry::Occupied(existing) => {
                warn!(
                    namespace = %existing.key(),
                    "Pool namespace registered concurrently, discarding new pool"
                );
                Err(ParallelError::duplicate_namespace(existing.key().clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(pool.clone());
                Ok(pool)
            }
        }
    }

    pub fn has_pool(&self, namespace: &str) -> bool {
        self.pools.contains_key(namespace)
    }

    pub fn get_pool(&self, namespace: &str) -> Option<Pool> {
        self.pools.get(namespace).map(|entry| entry.value().clone())
    }

    /// Like [`PoolRegistry::get_pool`] but failing with `PoolNotFound`
    pub fn pool(&self, namespace: &str) -> Result<Pool> {
        self.get_pool(namespace)
            .ok_or_else(|| ParallelError::pool_not_found(namespace))
    }

    /// Registered namespaces, sorted
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
