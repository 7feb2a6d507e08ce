//! Manager configuration and per-plugin lifecycle types.

use serde::{Deserialize, Serialize};

use chainplugin_core::error::PluginError;

/// Configuration for a [`PluginManager`](crate::PluginManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Chain label used in logs (e.g. `"ethereum"`).
    #[serde(default = "default_chain")]
    pub chain: String,
    /// How many blocks to request per `replay_range` call during backfill.
    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: u64,
    /// Fail a run whose `start_from` is above the captured head instead of
    /// waiting for the live feed to reach it.
    #[serde(default = "bool_true")]
    pub reject_start_ahead_of_head: bool,
    /// Drop live commits for blocks the plugin already has: those delivered by
    /// backfill, or at or below `start_from` when resuming at the head.
    #[serde(default = "bool_true")]
    pub dedup_live_after_backfill: bool,
}

fn default_chain() -> String {
    "ethereum".into()
}
fn default_backfill_batch_size() -> u64 {
    1_000
}
fn bool_true() -> bool {
    true
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            backfill_batch_size: default_backfill_batch_size(),
            reject_start_ahead_of_head: true,
            dedup_live_after_backfill: true,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.backfill_batch_size == 0 {
            return Err(PluginError::InvalidConfig(
                "backfill_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Where a plugin's run loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginPhase {
    /// Replaying historical blocks up to the captured head.
    Backfilling,
    /// Following the live feed.
    Live,
    /// The run returned normally (source ended or cancelled).
    Stopped,
    /// The run returned an error.
    Failed,
}

impl PluginPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Backfilling | Self::Live)
    }
}

impl std::fmt::Display for PluginPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
