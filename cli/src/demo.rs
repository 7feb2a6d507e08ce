//! `chainplugin demo`: two plugins against an in-memory chain.
//!
//! `history` backfills from genesis through a tracing layer; `tail` only
//! follows live commits and reorgs. The demo mines, reorganizes, shuts the
//! manager down and prints where each plugin finished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use chainplugin_core::{
    ChainBlock, ChainSegment, CommitHandler, KindFilter, NotificationContext, NotificationKind,
    PluginBuilder, PluginError, ReorgHandler, RevertHandler, TracingMiddleware,
};
use chainplugin_runtime::{
    ManagerBuilder, MemoryBlock, MemoryChain, MemoryChainTypes, PluginManager, PluginPhase,
    PluginRegistration,
};

type Ctx<'a> = NotificationContext<'a, MemoryChainTypes>;
type Segment = ChainSegment<MemoryChainTypes>;

/// Counts blocks and transactions seen by one plugin.
struct BlockCounter {
    name: &'static str,
    blocks: AtomicU64,
    txs: AtomicU64,
    reverted: AtomicU64,
}

impl BlockCounter {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            blocks: AtomicU64::new(0),
            txs: AtomicU64::new(0),
            reverted: AtomicU64::new(0),
        })
    }

    fn apply(&self, ctx: &Ctx<'_>, chain: &Segment) {
        for block in chain.blocks() {
            // Receipts come from the chain handle captured at start.
            let txs = ctx
                .blocks()
                .receipts(block.number())
                .map_or(0, |r| r.len() as u64);
            self.blocks.fetch_add(1, Ordering::Relaxed);
            self.txs.fetch_add(txs, Ordering::Relaxed);
        }
    }

    fn unapply(&self, chain: &Segment) {
        self.reverted.fetch_add(chain.len() as u64, Ordering::Relaxed);
    }

    fn builder(self: &Arc<Self>) -> PluginBuilder<MemoryChainTypes> {
        PluginBuilder::new()
            .on_commit_arc(self.clone())
            .on_revert_arc(self.clone())
            .on_reorg_arc(self.clone())
    }
}

#[async_trait]
impl CommitHandler<MemoryChainTypes> for BlockCounter {
    async fn on_commit(&self, ctx: &mut Ctx<'_>, chain: &Segment) -> Result<(), PluginError> {
        self.apply(ctx, chain);
        Ok(())
    }
}

#[async_trait]
impl RevertHandler<MemoryChainTypes> for BlockCounter {
    async fn on_revert(&self, _ctx: &mut Ctx<'_>, chain: &Segment) -> Result<(), PluginError> {
        self.unapply(chain);
        Ok(())
    }
}

#[async_trait]
impl ReorgHandler<MemoryChainTypes> for BlockCounter {
    async fn on_reorg(
        &self,
        ctx: &mut Ctx<'_>,
        reverted: &Segment,
        committed: &Segment,
    ) -> Result<(), PluginError> {
        tracing::info!(
            plugin = self.name,
            reverted = reverted.len(),
            committed = committed.len(),
            "Switching forks"
        );
        self.unapply(reverted);
        self.apply(ctx, committed);
        Ok(())
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}

fn report(manager: &PluginManager<MemoryChainTypes>, counter: &BlockCounter) {
    println!(
        "  {:<8} finished at {:>3}  blocks={:<3} txs={:<3} reverted={}",
        counter.name,
        manager
            .finished_height_for(counter.name)
            .map_or_else(|| "-".to_string(), |n| n.to_string()),
        counter.blocks.load(Ordering::Relaxed),
        counter.txs.load(Ordering::Relaxed),
        counter.reverted.load(Ordering::Relaxed),
    );
}

pub async fn run() -> anyhow::Result<()> {
    let chain = MemoryChain::new(1337);
    chain.mine(20)?;

    let manager = ManagerBuilder::<MemoryChainTypes>::new()
        .chain("devnet")
        .backfill_batch_size(8)
        .source(chain.clone())
        .context_factory(chain.clone())
        .build()?;

    let history = BlockCounter::new("history");
    let tail = BlockCounter::new("tail");

    let registrations = vec![
        PluginRegistration::new(
            history.name,
            history
                .builder()
                .with(TracingMiddleware::new(history.name))
                .build()?,
        )
        .start_from(MemoryBlock::canonical(0).id()),
        PluginRegistration::new(
            tail.name,
            tail.builder()
                .with(KindFilter::only([NotificationKind::Commit, NotificationKind::Reorg]))
                .build()?,
        ),
    ];

    let task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run_all(registrations).await }
    });

    wait_for("both plugins to go live", || {
        manager.phase(history.name) == Some(PluginPhase::Live)
            && manager.phase(tail.name) == Some(PluginPhase::Live)
    })
    .await?;

    chain.mine(5)?;
    chain.reorg(23, 3, "b")?;
    let head = chain.mine(2)?;
    println!("chain head: {head}");

    wait_for("plugins to reach the head", || {
        manager.finished_height() == Some(head.number)
    })
    .await?;

    manager.shutdown();
    task.await.context("plugin task panicked")??;

    println!("plugins:");
    report(&manager, &history);
    report(&manager, &tail);
    println!(
        "finished height: {}",
        manager
            .finished_height()
            .map_or_else(|| "-".to_string(), |n| n.to_string())
    );
    Ok(())
}
