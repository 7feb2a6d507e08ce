//! What a caller hands the manager to start a plugin.

use chainplugin_core::middleware::PluginChain;
use chainplugin_core::types::{BlockId, ChainTypes};

/// A plugin ready to run: its id, its compiled chain and where to resume.
///
/// `run()` takes the registration by value, so one registration drives at
/// most one run.
pub struct PluginRegistration<T: ChainTypes> {
    /// Unique among the manager's running plugins.
    pub id: String,
    pub chain: PluginChain<T>,
    /// Last block the plugin already processed. Backfill starts right after
    /// it; `None` means live only.
    pub start_from: Option<BlockId>,
}

impl<T: ChainTypes> PluginRegistration<T> {
    pub fn new(id: impl Into<String>, chain: PluginChain<T>) -> Self {
        Self {
            id: id.into(),
            chain,
            start_from: None,
        }
    }

    /// Resume after `block`.
    pub fn start_from(mut self, block: BlockId) -> Self {
        self.start_from = Some(block);
        self
    }
}

impl<T: ChainTypes> std::fmt::Debug for PluginRegistration<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistration")
            .field("id", &self.id)
            .field("chain", &self.chain)
            .field("start_from", &self.start_from)
            .finish()
    }
}
