//! In-memory chain: a canonical block list plus a live broadcast feed.
//!
//! Useful for tests, demos and short-lived pipelines that don't talk to a node.
//! Backfill serves one `Commit` per block from the canonical list; live
//! notifications are whatever `mine`, `commit`, `revert_to` and `reorg` emit.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

use chainplugin_core::context::Snapshot;
use chainplugin_core::error::PluginError;
use chainplugin_core::source::{ContextFactory, NotificationSource, NotificationStream};
use chainplugin_core::types::{BlockId, ChainBlock, ChainSegment, ChainTypes, Notification};

// ─── Chain types ─────────────────────────────────────────────────────────────

/// A block in the in-memory chain. Hashes are derived from number + fork tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
}

impl MemoryBlock {
    /// Block `number` on the original (untagged) chain.
    pub fn canonical(number: u64) -> Self {
        Self {
            number,
            hash: block_hash(number, ""),
            parent_hash: parent_hash(number, ""),
        }
    }

    /// The block after `self` on fork `fork`.
    pub fn child(&self, fork: &str) -> Self {
        Self {
            number: self.number + 1,
            hash: block_hash(self.number + 1, fork),
            parent_hash: self.hash.clone(),
        }
    }
}

impl ChainBlock for MemoryBlock {
    fn id(&self) -> BlockId {
        BlockId::new(self.number, self.hash.clone())
    }

    fn parent_hash(&self) -> &str {
        &self.parent_hash
    }

    fn number(&self) -> u64 {
        self.number
    }
}

fn block_hash(number: u64, fork: &str) -> String {
    format!("0x{number:08x}{fork}")
}

fn parent_hash(number: u64, fork: &str) -> String {
    match number {
        0 => "0x".into(),
        n => block_hash(n - 1, fork),
    }
}

/// A receipt in the in-memory chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReceipt {
    pub tx_hash: String,
    pub success: bool,
}

/// [`ChainTypes`] for [`MemoryChain`]. The block reader is the chain itself;
/// there is no state handle.
#[derive(Debug, Clone, Copy)]
pub struct MemoryChainTypes;

impl ChainTypes for MemoryChainTypes {
    type Block = MemoryBlock;
    type Receipt = MemoryReceipt;
    type State = ();
    type Blocks = MemoryChain;
}

// ─── MemoryChain ─────────────────────────────────────────────────────────────

type Entry = (MemoryBlock, Vec<MemoryReceipt>);

struct Inner {
    chain_id: u64,
    /// Canonical chain, index == block number.
    blocks: RwLock<Vec<Entry>>,
    /// Fork tag for newly mined blocks.
    fork: RwLock<String>,
    /// `None` once closed; live streams then end.
    tx: RwLock<Option<broadcast::Sender<Notification<MemoryChainTypes>>>>,
}

/// In-memory chain with a live notification feed. Clones share the chain.
#[derive(Clone)]
pub struct MemoryChain {
    inner: Arc<Inner>,
}

impl MemoryChain {
    /// A chain holding only genesis (block 0).
    pub fn new(chain_id: u64) -> Self {
        Self::with_capacity(chain_id, 1_024)
    }

    /// `capacity` bounds how many live notifications a slow subscriber may
    /// fall behind before it sees `PluginError::Lagged`.
    pub fn with_capacity(chain_id: u64, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                chain_id,
                blocks: RwLock::new(vec![(MemoryBlock::canonical(0), Vec::new())]),
                fork: RwLock::new(String::new()),
                tx: RwLock::new(Some(tx)),
            }),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.inner.chain_id
    }

    pub fn head(&self) -> BlockId {
        self.read_blocks()
            .last()
            .map(|(b, _)| b.id())
            .unwrap_or_else(|| MemoryBlock::canonical(0).id())
    }

    pub fn block(&self, number: u64) -> Option<MemoryBlock> {
        self.read_blocks().get(number as usize).map(|(b, _)| b.clone())
    }

    pub fn receipts(&self, number: u64) -> Option<Vec<MemoryReceipt>> {
        self.read_blocks().get(number as usize).map(|(_, r)| r.clone())
    }

    /// Append `count` empty blocks on the current fork and announce them as one
    /// commit. Returns the new head.
    pub fn mine(&self, count: u64) -> Result<BlockId, PluginError> {
        if count == 0 {
            return Ok(self.head());
        }
        let fork = self.read_fork();
        let mut parent = self.head_block();
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let block = parent.child(&fork);
            let receipt = MemoryReceipt {
                tx_hash: format!("{}-tx0", block.hash),
                success: true,
            };
            entries.push((block.clone(), vec![receipt]));
            parent = block;
        }
        self.commit(entries)?;
        Ok(self.head())
    }

    /// Append `entries` on top of the head and announce them as one commit.
    pub fn commit(&self, entries: Vec<Entry>) -> Result<(), PluginError> {
        let segment = ChainSegment::<MemoryChainTypes>::new(entries.clone())?;
        {
            let mut blocks = self.write_blocks();
            let head = blocks
                .last()
                .map(|(b, _)| b.id())
                .ok_or_else(|| PluginError::Source("chain has no genesis".into()))?;
            let first = segment.first();
            if first.number != head.number + 1 || first.parent_hash != head.hash {
                return Err(PluginError::InvalidSegment(format!(
                    "block {} does not extend head {head}",
                    first.id()
                )));
            }
            blocks.extend(entries);
        }
        self.publish(Notification::Commit { chain: segment });
        Ok(())
    }

    /// Drop every block above `number` and announce them as one revert.
    /// No-op if `number` is at or above the head.
    pub fn revert_to(&self, number: u64) -> Result<(), PluginError> {
        let removed = self.truncate_above(number)?;
        if let Some(chain) = removed {
            self.publish(Notification::Revert { chain });
        }
        Ok(())
    }

    /// Replace every block above `fork_point` with `count` blocks on fork
    /// `fork`, announced as one reorg. Later `mine` calls extend the new fork.
    pub fn reorg(&self, fork_point: u64, count: u64, fork: &str) -> Result<BlockId, PluginError> {
        if count == 0 {
            return Err(PluginError::InvalidSegment("reorg must commit at least one block".into()));
        }
        let mut parent = self
            .block(fork_point)
            .ok_or_else(|| PluginError::Source(format!("no block at fork point {fork_point}")))?;
        let reverted = self.truncate_above(fork_point)?.ok_or_else(|| {
            PluginError::InvalidSegment(format!("nothing above fork point {fork_point}"))
        })?;

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let block = parent.child(fork);
            entries.push((block.clone(), Vec::new()));
            parent = block;
        }
        let committed = ChainSegment::<MemoryChainTypes>::new(entries.clone())?;
        self.write_blocks().extend(entries);
        *self.inner.fork.write().unwrap_or_else(PoisonError::into_inner) = fork.to_string();

        tracing::debug!(
            fork_point,
            reverted = reverted.len(),
            committed = committed.len(),
            fork,
            "Memory chain reorganized"
        );
        self.publish(Notification::Reorg {
            reverted,
            committed,
        });
        Ok(self.head())
    }

    /// End every live stream. Further changes are no longer announced.
    pub fn close(&self) {
        self.inner
            .tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    // ─── internals ───────────────────────────────────────────────────────────

    fn read_blocks(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.inner.blocks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_blocks(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.inner.blocks.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_fork(&self) -> String {
        self.inner
            .fork
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn head_block(&self) -> MemoryBlock {
        self.read_blocks()
            .last()
            .map(|(b, _)| b.clone())
            .unwrap_or_else(|| MemoryBlock::canonical(0))
    }

    fn truncate_above(&self, number: u64) -> Result<Option<ChainSegment<MemoryChainTypes>>, PluginError> {
        let mut blocks = self.write_blocks();
        let keep = number as usize + 1;
        if keep >= blocks.len() {
            return Ok(None);
        }
        let removed = blocks.split_off(keep);
        ChainSegment::new(removed).map(Some)
    }

    fn publish(&self, notification: Notification<MemoryChainTypes>) {
        let tx = self.inner.tx.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tx.as_ref() {
            // No subscribers is fine: nobody is listening live yet.
            let _ = tx.send(notification);
        }
    }
}

impl std::fmt::Debug for MemoryChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChain")
            .field("chain_id", &self.inner.chain_id)
            .field("head", &self.head())
            .finish()
    }
}

#[async_trait]
impl NotificationSource<MemoryChainTypes> for MemoryChain {
    async fn replay_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<NotificationStream<MemoryChainTypes>, PluginError> {
        let blocks = self.read_blocks();
        let head = blocks.len() as u64 - 1;
        if to > head {
            return Err(PluginError::Source(format!(
                "replay range {from}..={to} is beyond head {head}"
            )));
        }
        let mut notifications = Vec::new();
        if from <= to {
            for entry in &blocks[from as usize..=to as usize] {
                let chain = ChainSegment::new(vec![entry.clone()])?;
                notifications.push(Ok(Notification::Commit { chain }));
            }
        }
        Ok(Box::pin(stream::iter(notifications)))
    }

    async fn subscribe(&self) -> Result<NotificationStream<MemoryChainTypes>, PluginError> {
        let rx = self
            .inner
            .tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| PluginError::Source("memory chain is closed".into()))?;

        let live = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(notification) => Some((Ok(notification), rx)),
                Err(RecvError::Lagged(skipped)) => Some((Err(PluginError::Lagged { skipped }), rx)),
                Err(RecvError::Closed) => None,
            }
        });
        Ok(Box::pin(live))
    }
}

#[async_trait]
impl ContextFactory<MemoryChainTypes> for MemoryChain {
    async fn snapshot(&self) -> Result<Snapshot<MemoryChainTypes>, PluginError> {
        Ok(Snapshot::new(
            self.head(),
            self.chain_id(),
            Arc::new(()),
            Arc::new(self.clone()),
        ))
    }
}
