//! Overlap removal between a finished backfill and the live feed.
//!
//! The live subscription is opened before the head is captured, so whatever
//! the chain does in between reaches the plugin twice: once through the
//! backfill, which replays the chain as it is now, and once buffered on the
//! live side. The deduplicator keeps the plugin's view of recent blocks
//! (number and hash) and rewrites each live notification against it:
//!
//! - committed blocks are kept only above the frontier;
//! - reverted blocks are kept only if the plugin was given them;
//! - a reorg with one side left empty becomes a plain commit or revert, and
//!   one with nothing left is dropped.
//!
//! Heights at or below the starting block, or that slid out of the window,
//! are assumed delivered.

use std::collections::BTreeMap;

use chainplugin_core::types::{BlockId, ChainBlock, ChainSegment, ChainTypes, Notification};

/// Recent blocks kept for hash comparison.
pub const DEFAULT_WINDOW: usize = 128;

/// Drops live notifications, or parts of them, the plugin already has.
#[derive(Debug, Clone)]
pub struct LiveDeduplicator {
    /// Heights at or below `floor` are assumed delivered.
    floor: u64,
    /// number → hash of blocks handed to the plugin above `floor`.
    view: BTreeMap<u64, String>,
    window: usize,
    dropped: u64,
}

impl LiveDeduplicator {
    /// `start` is the last block the plugin already has.
    pub fn new(start: u64) -> Self {
        Self::with_window(start, DEFAULT_WINDOW)
    }

    pub fn with_window(start: u64, window: usize) -> Self {
        Self {
            floor: start,
            view: BTreeMap::new(),
            window: window.max(1),
            dropped: 0,
        }
    }

    /// Highest block number the plugin has been handed.
    pub fn frontier(&self) -> u64 {
        self.view.keys().next_back().copied().unwrap_or(self.floor)
    }

    /// Blocks dropped so far, counting both sides of reorgs.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Whether `block` (number and hash) is part of the plugin's view.
    pub fn has_delivered(&self, block: &BlockId) -> bool {
        match self.view.get(&block.number) {
            Some(hash) => *hash == block.hash,
            None => block.number <= self.floor,
        }
    }

    /// Record a notification delivered untouched (e.g. from backfill).
    pub fn observe<T: ChainTypes>(&mut self, notification: &Notification<T>) {
        if let Some(reverted) = notification.reverted() {
            self.rewind(reverted.first().number());
        }
        if let Some(committed) = notification.committed() {
            self.extend(committed);
        }
    }

    /// Rewrite a live `notification` against the view, or `None` if nothing
    /// new is left. The result is recorded as delivered.
    pub fn filter<T: ChainTypes>(
        &mut self,
        notification: Notification<T>,
    ) -> Option<Notification<T>> {
        let (reverted, committed) = match notification {
            Notification::Commit { chain } => (None, Some(chain)),
            Notification::Revert { chain } => (Some(chain), None),
            Notification::Reorg {
                reverted,
                committed,
            } => (Some(reverted), Some(committed)),
        };
        let total = block_count(&reverted) + block_count(&committed);

        let reverted = reverted.and_then(|segment| self.delivered_prefix(&segment));
        if let Some(segment) = &reverted {
            self.rewind(segment.first().number());
        }
        let committed = committed.and_then(|segment| segment.above(self.frontier()));
        if let Some(segment) = &committed {
            self.extend(segment);
        }
        self.dropped += total - block_count(&reverted) - block_count(&committed);

        match (reverted, committed) {
            (Some(reverted), Some(committed)) => Some(Notification::Reorg {
                reverted,
                committed,
            }),
            (None, Some(chain)) => Some(Notification::Commit { chain }),
            (Some(chain), None) => Some(Notification::Revert { chain }),
            (None, None) => None,
        }
    }

    /// The leading blocks of `segment` the plugin has.
    fn delivered_prefix<T: ChainTypes>(
        &self,
        segment: &ChainSegment<T>,
    ) -> Option<ChainSegment<T>> {
        let last = segment
            .blocks()
            .take_while(|block| self.has_delivered(&block.id()))
            .last()?
            .number();
        segment.up_to(last)
    }

    /// Forget every block from `first` up.
    fn rewind(&mut self, first: u64) {
        self.view.retain(|number, _| *number < first);
        self.floor = self.floor.min(first.saturating_sub(1));
    }

    fn extend<T: ChainTypes>(&mut self, segment: &ChainSegment<T>) {
        for block in segment.blocks() {
            self.view.insert(block.number(), block.id().hash);
        }
        while self.view.len() > self.window {
            if let Some((number, _)) = self.view.pop_first() {
                self.floor = self.floor.max(number);
            }
        }
    }
}

fn block_count<T: ChainTypes>(segment: &Option<ChainSegment<T>>) -> u64 {
    segment.as_ref().map_or(0, |s| s.len() as u64)
}
