//! Per-run snapshot and per-notification context handed to middleware and handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::PluginError;
use crate::types::{BlockId, ChainTypes, Notification, NotificationKind};

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Chain position and read handles captured once when a plugin run starts.
pub struct Snapshot<T: ChainTypes> {
    /// Chain head at capture time. Bounds the backfill range.
    pub head: BlockId,
    /// Numeric chain id (e.g. `1` for Ethereum mainnet).
    pub chain_id: u64,
    /// State reader handle.
    pub state: Arc<T::State>,
    /// Block reader handle.
    pub blocks: Arc<T::Blocks>,
}

impl<T: ChainTypes> Snapshot<T> {
    pub fn new(head: BlockId, chain_id: u64, state: Arc<T::State>, blocks: Arc<T::Blocks>) -> Self {
        Self {
            head,
            chain_id,
            state,
            blocks,
        }
    }
}

impl<T: ChainTypes> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            chain_id: self.chain_id,
            state: Arc::clone(&self.state),
            blocks: Arc::clone(&self.blocks),
        }
    }
}

impl<T: ChainTypes> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("head", &self.head)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

// ─── NotificationContext ─────────────────────────────────────────────────────

/// Context passed through the middleware chain for a single notification.
///
/// Lives exactly as long as one `execute()` call: the key-value bag and the
/// checkpoint slot start fresh for every notification.
pub struct NotificationContext<'a, T: ChainTypes> {
    snapshot: &'a Snapshot<T>,
    notification: &'a Notification<T>,
    values: HashMap<String, Value>,
    checkpoint: BlockId,
    explicit_checkpoint: bool,
}

impl<'a, T: ChainTypes> NotificationContext<'a, T> {
    /// Fresh context whose checkpoint defaults to the notification's tip.
    pub fn new(snapshot: &'a Snapshot<T>, notification: &'a Notification<T>) -> Self {
        Self {
            snapshot,
            notification,
            values: HashMap::new(),
            checkpoint: notification.tip(),
            explicit_checkpoint: false,
        }
    }

    // Read-only handles

    pub fn snapshot(&self) -> &'a Snapshot<T> {
        self.snapshot
    }

    pub fn head(&self) -> &'a BlockId {
        &self.snapshot.head
    }

    pub fn chain_id(&self) -> u64 {
        self.snapshot.chain_id
    }

    pub fn state(&self) -> &'a T::State {
        &self.snapshot.state
    }

    pub fn blocks(&self) -> &'a T::Blocks {
        &self.snapshot.blocks
    }

    /// The notification being processed. The returned borrow is independent of
    /// `self`, so handlers can keep it while mutating the context.
    pub fn notification(&self) -> &'a Notification<T> {
        self.notification
    }

    pub fn kind(&self) -> NotificationKind {
        self.notification.kind()
    }

    pub fn tip(&self) -> BlockId {
        self.notification.tip()
    }

    // Checkpoint slot

    /// Record `block` as the processing frontier for this notification. Last
    /// write wins.
    pub fn checkpoint(&mut self, block: BlockId) {
        self.checkpoint = block;
        self.explicit_checkpoint = true;
    }

    /// Record the notification's tip as the frontier.
    pub fn checkpoint_tip(&mut self) {
        let tip = self.notification.tip();
        self.checkpoint(tip);
    }

    /// The checkpoint that will be reported if the chain completes now.
    pub fn current_checkpoint(&self) -> &BlockId {
        &self.checkpoint
    }

    /// `true` once any frame has called `checkpoint`.
    pub fn has_explicit_checkpoint(&self) -> bool {
        self.explicit_checkpoint
    }

    pub fn into_checkpoint(self) -> BlockId {
        self.checkpoint
    }

    // Scoped values

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Deserialize the value stored under `key`.
    pub fn get_as<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>, PluginError> {
        self.values
            .get(key)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| PluginError::Other(format!("context value '{key}': {e}")))
            })
            .transpose()
    }
}
