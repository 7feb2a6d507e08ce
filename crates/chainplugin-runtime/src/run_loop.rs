//! The per-plugin run loop: backfill, then live.
//!
//! # Phase 1: BACKFILL
//! Only when `start_from` is behind the head captured at start. Replays
//! `start_from + 1 ..= head` in batches of `backfill_batch_size` blocks.
//!
//! # Phase 2: LIVE
//! Reads the live subscription, which was opened before the head was captured
//! so nothing committed in between is lost. Whatever the plugin already has,
//! from backfill or from before `start_from`, is trimmed by
//! [`LiveDeduplicator`], including reorgs that backfill already replayed.
//!
//! Every notification goes through `execute()` to completion before the next
//! one is pulled. Cancellation is checked only while waiting for the next one.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use chainplugin_core::error::PluginError;
use chainplugin_core::executor::PluginExecutor;
use chainplugin_core::source::{NotificationSource, NotificationStream};
use chainplugin_core::types::{BlockId, ChainTypes, Notification};

use crate::config::{ManagerConfig, PluginPhase};
use crate::dedup::LiveDeduplicator;
use crate::manager::SharedState;

/// Result of waiting on a notification stream.
enum Pulled<T: ChainTypes> {
    Item(Result<Notification<T>, PluginError>),
    Ended,
    Cancelled,
}

/// One plugin's run, borrowing everything it needs from the manager.
pub(crate) struct PluginRun<'a, T: ChainTypes> {
    pub(crate) id: &'a str,
    pub(crate) executor: &'a PluginExecutor<T>,
    pub(crate) source: &'a dyn NotificationSource<T>,
    pub(crate) config: &'a ManagerConfig,
    pub(crate) state: &'a SharedState<T>,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) shutdown: &'a CancellationToken,
}

impl<'a, T: ChainTypes> PluginRun<'a, T> {
    /// Run until the live feed ends or the run is cancelled.
    /// `live` must have been opened before `head` was captured.
    pub(crate) async fn run(
        self,
        live: NotificationStream<T>,
        head: BlockId,
        start_from: Option<BlockId>,
    ) -> Result<(), PluginError> {
        // A start at u64::MAX has nothing left to replay.
        let backfill_from = start_from
            .as_ref()
            .and_then(|start| start.number.checked_add(1))
            .filter(|from| *from <= head.number);
        let mut dedup = start_from
            .as_ref()
            .filter(|_| self.config.dedup_live_after_backfill)
            .map(|start| LiveDeduplicator::new(start.number));

        if let Some(from) = backfill_from {
            self.state.set_phase(self.id, PluginPhase::Backfilling);
            if !self.backfill(from, head.number, dedup.as_mut()).await? {
                return Ok(());
            }
        }

        self.state.set_phase(self.id, PluginPhase::Live);
        tracing::info!(plugin = %self.id, "Following live notifications");
        self.live(live, dedup).await
    }

    /// Replay `from..=to`. Returns `false` if cancelled part-way.
    /// Every delivered notification is recorded in `dedup`.
    async fn backfill(
        &self,
        from: u64,
        to: u64,
        mut dedup: Option<&mut LiveDeduplicator>,
    ) -> Result<bool, PluginError> {
        let batch = self.config.backfill_batch_size.max(1);
        tracing::info!(plugin = %self.id, from, to, "Starting backfill phase");

        let mut current = from;
        while current <= to {
            let batch_end = current.saturating_add(batch - 1).min(to);
            let mut stream = self.source.replay_range(current, batch_end).await?;
            let mut delivered = 0u64;

            loop {
                match self.pull(&mut stream).await {
                    Pulled::Item(item) => {
                        let notification = item?;
                        if let Some(d) = dedup.as_deref_mut() {
                            d.observe(&notification);
                        }
                        self.deliver(notification).await?;
                        delivered += 1;
                    }
                    Pulled::Ended => break,
                    Pulled::Cancelled => {
                        tracing::info!(plugin = %self.id, at = current, "Backfill cancelled");
                        return Ok(false);
                    }
                }
            }

            tracing::info!(
                plugin = %self.id,
                current,
                batch_end,
                total = to,
                notifications = delivered,
                "Backfill batch complete"
            );
            current = batch_end + 1;
        }

        tracing::info!(plugin = %self.id, at = to, "Backfill complete");
        Ok(true)
    }

    async fn live(
        &self,
        mut stream: NotificationStream<T>,
        mut dedup: Option<LiveDeduplicator>,
    ) -> Result<(), PluginError> {
        loop {
            let notification = match self.pull(&mut stream).await {
                Pulled::Item(item) => item?,
                Pulled::Ended => {
                    tracing::info!(plugin = %self.id, "Live feed ended");
                    return Ok(());
                }
                Pulled::Cancelled => return Ok(()),
            };

            let notification = match dedup.as_mut() {
                Some(d) => match d.filter(notification) {
                    Some(n) => n,
                    None => {
                        tracing::debug!(
                            plugin = %self.id,
                            frontier = d.frontier(),
                            dropped = d.dropped(),
                            "Skipping live notification already delivered"
                        );
                        continue;
                    }
                },
                None => notification,
            };

            self.deliver(notification).await?;
        }
    }

    /// Wait for the next item unless the run or the manager is cancelled.
    async fn pull(&self, stream: &mut NotificationStream<T>) -> Pulled<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Pulled::Cancelled,
            _ = self.shutdown.cancelled() => Pulled::Cancelled,
            item = stream.next() => match item {
                Some(item) => Pulled::Item(item),
                None => Pulled::Ended,
            },
        }
    }

    async fn deliver(&self, notification: Notification<T>) -> Result<(), PluginError> {
        if let Notification::Reorg {
            reverted,
            committed,
        } = &notification
        {
            tracing::warn!(
                plugin = %self.id,
                reverted = ?reverted.range(),
                committed = ?committed.range(),
                "Reorg received"
            );
        }

        let checkpoint = self.executor.execute(&notification).await?;
        tracing::debug!(
            plugin = %self.id,
            kind = %notification.kind(),
            checkpoint = checkpoint.number,
            "Checkpoint recorded"
        );
        self.state.record_checkpoint(self.id, checkpoint);
        Ok(())
    }
}
