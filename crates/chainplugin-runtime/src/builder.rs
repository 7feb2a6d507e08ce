//! Fluent builder API for creating plugin managers.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainplugin_runtime::{ManagerBuilder, MemoryChain, MemoryChainTypes};
//!
//! let chain = MemoryChain::new(1);
//! let manager = ManagerBuilder::<MemoryChainTypes>::new()
//!     .chain("devnet")
//!     .backfill_batch_size(500)
//!     .source(chain.clone())
//!     .context_factory(chain)
//!     .build()
//!     .expect("valid manager config");
//! ```

use std::sync::Arc;

use chainplugin_core::error::PluginError;
use chainplugin_core::source::{ContextFactory, NotificationSource};
use chainplugin_core::types::ChainTypes;

use crate::config::ManagerConfig;
use crate::manager::PluginManager;

/// Fluent builder for [`PluginManager`].
pub struct ManagerBuilder<T: ChainTypes> {
    config: ManagerConfig,
    source: Option<Arc<dyn NotificationSource<T>>>,
    factory: Option<Arc<dyn ContextFactory<T>>>,
}

impl<T: ChainTypes> ManagerBuilder<T> {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            source: None,
            factory: None,
        }
    }

    /// Start from an existing config (e.g. deserialized from a file).
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the chain label used in logs.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Set the number of blocks per `replay_range` call.
    pub fn backfill_batch_size(mut self, size: u64) -> Self {
        self.config.backfill_batch_size = size;
        self
    }

    /// Whether a `start_from` above the head fails the run.
    pub fn reject_start_ahead_of_head(mut self, reject: bool) -> Self {
        self.config.reject_start_ahead_of_head = reject;
        self
    }

    /// Whether live commits already delivered are skipped.
    pub fn dedup_live_after_backfill(mut self, dedup: bool) -> Self {
        self.config.dedup_live_after_backfill = dedup;
        self
    }

    pub fn source(self, source: impl NotificationSource<T> + 'static) -> Self {
        self.source_arc(Arc::new(source))
    }

    pub fn source_arc(mut self, source: Arc<dyn NotificationSource<T>>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn context_factory(self, factory: impl ContextFactory<T> + 'static) -> Self {
        self.context_factory_arc(Arc::new(factory))
    }

    pub fn context_factory_arc(mut self, factory: Arc<dyn ContextFactory<T>>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Build the manager. Fails if the source or factory is missing or the
    /// config is invalid.
    pub fn build(self) -> Result<PluginManager<T>, PluginError> {
        self.config.validate()?;
        let source = self
            .source
            .ok_or_else(|| PluginError::InvalidConfig("no notification source set".into()))?;
        let factory = self
            .factory
            .ok_or_else(|| PluginError::InvalidConfig("no context factory set".into()))?;
        Ok(PluginManager::with_config(source, factory, self.config))
    }
}

impl<T: ChainTypes> Default for ManagerBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
