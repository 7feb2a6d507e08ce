//! Shared types for the plugin pipeline.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

// ─── BlockId ─────────────────────────────────────────────────────────────────

/// Identifies one block: its height plus the hash that disambiguates competing
/// blocks at that height.
///
/// Ordering compares `number` first, then `hash`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
}

impl BlockId {
    pub fn new(number: u64, hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

// ─── Chain abstractions ──────────────────────────────────────────────────────

/// The minimum the pipeline needs to know about a block.
pub trait ChainBlock {
    /// The block's own id.
    fn id(&self) -> BlockId;

    /// Hash of the block this one builds on.
    fn parent_hash(&self) -> &str;

    /// Shorthand for `self.id().number`.
    fn number(&self) -> u64 {
        self.id().number
    }
}

/// Bundles the concrete types a chain integration plugs into the pipeline.
///
/// `State` and `Blocks` are opaque capability handles: they are captured once
/// per plugin run and forwarded to handlers untouched.
pub trait ChainTypes: Send + Sync + 'static {
    type Block: ChainBlock + Clone + fmt::Debug + Send + Sync + 'static;
    type Receipt: Clone + fmt::Debug + Send + Sync + 'static;
    type State: Send + Sync + 'static;
    type Blocks: Send + Sync + 'static;
}

// ─── ChainSegment ────────────────────────────────────────────────────────────

/// A non-empty run of blocks, each linked to its predecessor by parent hash and
/// strictly increasing by number, together with each block's receipts.
pub struct ChainSegment<T: ChainTypes> {
    blocks: Vec<(T::Block, Vec<T::Receipt>)>,
}

impl<T: ChainTypes> ChainSegment<T> {
    /// Build a segment, checking that it is non-empty and contiguous.
    pub fn new(blocks: Vec<(T::Block, Vec<T::Receipt>)>) -> Result<Self, PluginError> {
        if blocks.is_empty() {
            return Err(PluginError::InvalidSegment("segment is empty".into()));
        }
        for pair in blocks.windows(2) {
            let (parent, child) = (&pair[0].0, &pair[1].0);
            let (parent_id, child_id) = (parent.id(), child.id());
            if child_id.number <= parent_id.number {
                return Err(PluginError::InvalidSegment(format!(
                    "block {child_id} does not follow {parent_id}"
                )));
            }
            if child.parent_hash() != parent_id.hash {
                return Err(PluginError::InvalidSegment(format!(
                    "block {child_id} has parent {} but follows {parent_id}",
                    child.parent_hash()
                )));
            }
        }
        Ok(Self { blocks })
    }

    /// Build a segment from blocks that carry no receipts.
    pub fn from_blocks(blocks: impl IntoIterator<Item = T::Block>) -> Result<Self, PluginError> {
        Self::new(blocks.into_iter().map(|b| (b, Vec::new())).collect())
    }

    /// The lowest block in the segment.
    pub fn first(&self) -> &T::Block {
        &self.blocks[0].0
    }

    /// The highest block in the segment.
    pub fn tip_block(&self) -> &T::Block {
        &self.blocks[self.blocks.len() - 1].0
    }

    /// Id of the highest block in the segment.
    pub fn tip(&self) -> BlockId {
        self.tip_block().id()
    }

    /// Block numbers covered, first to tip.
    pub fn range(&self) -> RangeInclusive<u64> {
        self.first().number()..=self.tip_block().number()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Segments are never empty, so this is always `false`.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = &T::Block> {
        self.blocks.iter().map(|(b, _)| b)
    }

    /// `(block, receipts)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (&T::Block, &[T::Receipt])> {
        self.blocks.iter().map(|(b, r)| (b, r.as_slice()))
    }

    /// Receipts of the block at `number`, if it is part of the segment.
    pub fn receipts(&self, number: u64) -> Option<&[T::Receipt]> {
        self.blocks
            .iter()
            .find(|(b, _)| b.number() == number)
            .map(|(_, r)| r.as_slice())
    }

    /// The suffix of this segment strictly above `number`, or `None` if no
    /// block qualifies.
    pub fn above(&self, number: u64) -> Option<Self> {
        let blocks: Vec<_> = self
            .blocks
            .iter()
            .filter(|(b, _)| b.number() > number)
            .cloned()
            .collect();
        (!blocks.is_empty()).then_some(Self { blocks })
    }

    /// The prefix of this segment at or below `number`, or `None` if no
    /// block qualifies.
    pub fn up_to(&self, number: u64) -> Option<Self> {
        let blocks: Vec<_> = self
            .blocks
            .iter()
            .take_while(|(b, _)| b.number() <= number)
            .cloned()
            .collect();
        (!blocks.is_empty()).then_some(Self { blocks })
    }

    pub fn into_inner(self) -> Vec<(T::Block, Vec<T::Receipt>)> {
        self.blocks
    }
}

impl<T: ChainTypes> Clone for ChainSegment<T> {
    fn clone(&self) -> Self {
        Self {
            blocks: self.blocks.clone(),
        }
    }
}

impl<T: ChainTypes> fmt::Debug for ChainSegment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainSegment")
            .field("range", &self.range())
            .field("tip", &self.tip().hash)
            .finish()
    }
}

// ─── Notification ────────────────────────────────────────────────────────────

/// Which shape a notification has; selects the terminal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Commit,
    Revert,
    Reorg,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit => write!(f, "commit"),
            Self::Revert => write!(f, "revert"),
            Self::Reorg => write!(f, "reorg"),
        }
    }
}

/// One chain state transition.
pub enum Notification<T: ChainTypes> {
    /// Blocks appended to the canonical chain.
    Commit { chain: ChainSegment<T> },
    /// Blocks removed from the canonical chain.
    Revert { chain: ChainSegment<T> },
    /// `reverted` replaced by `committed` in one step.
    Reorg {
        reverted: ChainSegment<T>,
        committed: ChainSegment<T>,
    },
}

impl<T: ChainTypes> Notification<T> {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::Commit { .. } => NotificationKind::Commit,
            Self::Revert { .. } => NotificationKind::Revert,
            Self::Reorg { .. } => NotificationKind::Reorg,
        }
    }

    /// The notification's tip: the top of `chain`, or of `committed` for a reorg.
    pub fn tip(&self) -> BlockId {
        match self {
            Self::Commit { chain } | Self::Revert { chain } => chain.tip(),
            Self::Reorg { committed, .. } => committed.tip(),
        }
    }

    /// The segment that becomes canonical, if any.
    pub fn committed(&self) -> Option<&ChainSegment<T>> {
        match self {
            Self::Commit { chain } => Some(chain),
            Self::Reorg { committed, .. } => Some(committed),
            Self::Revert { .. } => None,
        }
    }

    /// The segment that stops being canonical, if any.
    pub fn reverted(&self) -> Option<&ChainSegment<T>> {
        match self {
            Self::Revert { chain } => Some(chain),
            Self::Reorg { reverted, .. } => Some(reverted),
            Self::Commit { .. } => None,
        }
    }
}

impl<T: ChainTypes> Clone for Notification<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Commit { chain } => Self::Commit {
                chain: chain.clone(),
            },
            Self::Revert { chain } => Self::Revert {
                chain: chain.clone(),
            },
            Self::Reorg {
                reverted,
                committed,
            } => Self::Reorg {
                reverted: reverted.clone(),
                committed: committed.clone(),
            },
        }
    }
}

impl<T: ChainTypes> fmt::Debug for Notification<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit { chain } => f.debug_struct("Commit").field("chain", chain).finish(),
            Self::Revert { chain } => f.debug_struct("Revert").field("chain", chain).finish(),
            Self::Reorg {
                reverted,
                committed,
            } => f
                .debug_struct("Reorg")
                .field("reverted", reverted)
                .field("committed", committed)
                .finish(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
