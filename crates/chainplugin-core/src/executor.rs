//! Runs one compiled plugin chain against one notification.

use crate::context::{NotificationContext, Snapshot};
use crate::error::PluginError;
use crate::middleware::PluginChain;
use crate::types::{BlockId, ChainTypes, Notification};

/// A plugin chain bound to the snapshot captured when its run started.
pub struct PluginExecutor<T: ChainTypes> {
    id: String,
    chain: PluginChain<T>,
    snapshot: Snapshot<T>,
}

impl<T: ChainTypes> PluginExecutor<T> {
    pub fn new(id: impl Into<String>, chain: PluginChain<T>, snapshot: Snapshot<T>) -> Self {
        Self {
            id: id.into(),
            chain,
            snapshot,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> &Snapshot<T> {
        &self.snapshot
    }

    /// Process `notification` and return the checkpoint it produced.
    ///
    /// The checkpoint is whatever a frame recorded last, or the notification's
    /// tip if no frame recorded one. Errors from the chain are returned as-is.
    pub async fn execute(&self, notification: &Notification<T>) -> Result<BlockId, PluginError> {
        let mut ctx = NotificationContext::new(&self.snapshot, notification);
        self.chain.run(&mut ctx).await?;

        tracing::trace!(
            plugin = %self.id,
            kind = %notification.kind(),
            explicit = ctx.has_explicit_checkpoint(),
            checkpoint = ctx.current_checkpoint().number,
            "Notification processed"
        );
        Ok(ctx.into_checkpoint())
    }
}
