//! End-to-end tests for `PluginManager` driven by `MemoryChain`.
//!
//! Each test builds one or more plugins whose handlers record what they see,
//! runs them on a spawned task and steers the chain from the test body.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use chainplugin_core::{
    BlockId, ChainBlock, ChainSegment, CommitHandler, ContextFactory, Middleware, Next,
    Notification, NotificationContext, NotificationSource, NotificationStream, PluginChain,
    PluginError, ReorgHandler, RevertHandler, Snapshot,
};
use chainplugin_runtime::{
    ManagerBuilder, MemoryBlock, MemoryChain, MemoryChainTypes, PluginManager, PluginPhase,
    PluginRegistration,
};

type Ctx<'a> = NotificationContext<'a, MemoryChainTypes>;
type Segment = ChainSegment<MemoryChainTypes>;

// ─── Helpers ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Commit(u64, u64),
    Revert(u64, u64),
    Reorg { reverted: (u64, u64), committed: (u64, u64) },
}

fn bounds(segment: &Segment) -> (u64, u64) {
    let range = segment.range();
    (*range.start(), *range.end())
}

/// Records every notification; optionally fails on a commit reaching `fail_at`.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
    fail_at: Option<u64>,
}

impl Recorder {
    fn failing_at(number: u64) -> Self {
        Self {
            fail_at: Some(number),
            ..Default::default()
        }
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn chain(&self) -> PluginChain<MemoryChainTypes> {
        PluginChain::builder().handlers(self.clone()).build().unwrap()
    }
}

#[async_trait]
impl CommitHandler<MemoryChainTypes> for Recorder {
    async fn on_commit(&self, _ctx: &mut Ctx<'_>, chain: &Segment) -> Result<(), PluginError> {
        let (from, to) = bounds(chain);
        if self.fail_at.is_some_and(|n| n <= to) {
            return Err(PluginError::handler("recorder", format!("refusing block {to}")));
        }
        self.seen.lock().unwrap().push(Seen::Commit(from, to));
        Ok(())
    }
}

#[async_trait]
impl RevertHandler<MemoryChainTypes> for Recorder {
    async fn on_revert(&self, _ctx: &mut Ctx<'_>, chain: &Segment) -> Result<(), PluginError> {
        let (from, to) = bounds(chain);
        self.seen.lock().unwrap().push(Seen::Revert(from, to));
        Ok(())
    }
}

#[async_trait]
impl ReorgHandler<MemoryChainTypes> for Recorder {
    async fn on_reorg(
        &self,
        _ctx: &mut Ctx<'_>,
        reverted: &Segment,
        committed: &Segment,
    ) -> Result<(), PluginError> {
        self.seen.lock().unwrap().push(Seen::Reorg {
            reverted: bounds(reverted),
            committed: bounds(committed),
        });
        Ok(())
    }
}

/// Checkpoints `lag` blocks behind the notification tip.
struct Lagging {
    chain: MemoryChain,
    lag: u64,
}

#[async_trait]
impl Middleware<MemoryChainTypes> for Lagging {
    async fn handle(
        &self,
        ctx: &mut Ctx<'_>,
        next: Next<'_, MemoryChainTypes>,
    ) -> Result<(), PluginError> {
        next.run(ctx).await?;
        let target = ctx.tip().number.saturating_sub(self.lag);
        if let Some(block) = self.chain.block(target) {
            ctx.checkpoint(block.id());
        }
        Ok(())
    }
}

fn manager(chain: &MemoryChain) -> PluginManager<MemoryChainTypes> {
    PluginManager::new(chain.clone(), chain.clone())
}

fn canonical(number: u64) -> BlockId {
    MemoryBlock::canonical(number).id()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ─── Backfill and live ────────────────────────────────────────────────────────

#[tokio::test]
async fn backfills_then_follows_live() {
    let chain = MemoryChain::new(1);
    chain.mine(103).unwrap();
    let mgr = manager(&chain);
    let recorder = Recorder::default();

    let reg = PluginRegistration::new("a", recorder.chain()).start_from(canonical(100));
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run(reg).await }
    });

    wait_until(|| mgr.phase("a") == Some(PluginPhase::Live)).await;
    assert_eq!(mgr.finished_height_for("a"), Some(103));

    chain.mine(2).unwrap();
    wait_until(|| mgr.finished_height_for("a") == Some(105)).await;

    chain.close();
    task.await.unwrap().unwrap();

    assert_eq!(
        recorder.seen(),
        vec![
            Seen::Commit(101, 101),
            Seen::Commit(102, 102),
            Seen::Commit(103, 103),
            Seen::Commit(104, 105),
        ]
    );
    assert!(!mgr.is_running("a"));
    assert_eq!(mgr.phase("a"), Some(PluginPhase::Stopped));
}

#[tokio::test]
async fn backfill_spans_several_batches() {
    let chain = MemoryChain::new(1);
    chain.mine(10).unwrap();
    let mgr = ManagerBuilder::<MemoryChainTypes>::new()
        .backfill_batch_size(3)
        .source(chain.clone())
        .context_factory(chain.clone())
        .build()
        .unwrap();
    let recorder = Recorder::default();

    let reg = PluginRegistration::new("a", recorder.chain()).start_from(canonical(0));
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run(reg).await }
    });

    wait_until(|| mgr.finished_height_for("a") == Some(10)).await;
    chain.close();
    task.await.unwrap().unwrap();

    let tips: Vec<u64> = recorder
        .seen()
        .into_iter()
        .map(|s| match s {
            Seen::Commit(from, to) => {
                assert_eq!(from, to);
                to
            }
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(tips, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn live_only_plugin_skips_history() {
    let chain = MemoryChain::new(1);
    chain.mine(50).unwrap();
    let mgr = manager(&chain);
    let recorder = Recorder::default();

    let reg = PluginRegistration::new("live", recorder.chain());
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run(reg).await }
    });

    wait_until(|| mgr.phase("live") == Some(PluginPhase::Live)).await;
    assert_eq!(mgr.finished_height_for("live"), None);

    chain.mine(1).unwrap();
    wait_until(|| mgr.finished_height_for("live") == Some(51)).await;
    chain.close();
    task.await.unwrap().unwrap();

    assert_eq!(recorder.seen(), vec![Seen::Commit(51, 51)]);
}

/// Counts notifications that start while another one is still executing.
#[derive(Clone, Default)]
struct OneAtATime {
    busy: Arc<AtomicBool>,
    overlaps: Arc<AtomicU64>,
}

#[async_trait]
impl Middleware<MemoryChainTypes> for OneAtATime {
    async fn handle(
        &self,
        ctx: &mut Ctx<'_>,
        next: Next<'_, MemoryChainTypes>,
    ) -> Result<(), PluginError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        let result = next.run(ctx).await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notifications_execute_one_at_a_time_in_order() {
    let chain = MemoryChain::new(1);
    chain.mine(12).unwrap();
    let mgr = ManagerBuilder::<MemoryChainTypes>::new()
        .backfill_batch_size(4)
        .source(chain.clone())
        .context_factory(chain.clone())
        .build()
        .unwrap();
    let guard = OneAtATime::default();
    let recorder = Recorder::default();
    let plugin = PluginChain::builder()
        .with(guard.clone())
        .handlers(recorder.clone())
        .build()
        .unwrap();

    let reg = PluginRegistration::new("a", plugin).start_from(canonical(0));
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run(reg).await }
    });
    // Land on the live side while backfill is still running.
    for _ in 0..5 {
        chain.mine(1).unwrap();
    }

    wait_until(|| mgr.finished_height_for("a") == Some(17)).await;
    chain.close();
    task.await.unwrap().unwrap();

    assert_eq!(guard.overlaps.load(Ordering::SeqCst), 0);
    let expected: Vec<_> = (1..=17).map(|n| Seen::Commit(n, n)).collect();
    assert_eq!(recorder.seen(), expected);
}

// ─── Reverts and reorgs ───────────────────────────────────────────────────────

#[tokio::test]
async fn reorg_and_revert_reach_their_handlers() {
    let chain = MemoryChain::new(1);
    chain.mine(5).unwrap();
    let mgr = manager(&chain);
    let recorder = Recorder::default();

    let reg = PluginRegistration::new("a", recorder.chain());
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run(reg).await }
    });
    wait_until(|| mgr.phase("a") == Some(PluginPhase::Live)).await;

    chain.reorg(3, 2, "b").unwrap();
    wait_until(|| mgr.finished_height_for("a") == Some(5)).await;
    assert_eq!(
        mgr.checkpoint_for("a").unwrap().block,
        BlockId::new(5, "0x00000005b")
    );

    chain.revert_to(4).unwrap();
    // A revert checkpoints the tip of the reverted segment by default.
    wait_until(|| recorder.seen().len() == 2).await;
    chain.close();
    task.await.unwrap().unwrap();

    assert_eq!(
        recorder.seen(),
        vec![
            Seen::Reorg {
                reverted: (4, 5),
                committed: (4, 5),
            },
            Seen::Revert(5, 5),
        ]
    );
    assert_eq!(mgr.finished_height_for("a"), Some(5));
}

// ─── Deduplication ────────────────────────────────────────────────────────────

/// Replays from a `MemoryChain` but serves a fixed list as the live feed.
struct ScriptedLive {
    chain: MemoryChain,
    live: Mutex<Vec<Notification<MemoryChainTypes>>>,
}

#[async_trait]
impl NotificationSource<MemoryChainTypes> for ScriptedLive {
    async fn replay_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<NotificationStream<MemoryChainTypes>, PluginError> {
        self.chain.replay_range(from, to).await
    }

    async fn subscribe(&self) -> Result<NotificationStream<MemoryChainTypes>, PluginError> {
        let items: Vec<_> = std::mem::take(&mut *self.live.lock().unwrap())
            .into_iter()
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

fn canonical_commit(from: u64, to: u64) -> Notification<MemoryChainTypes> {
    Notification::Commit {
        chain: ChainSegment::from_blocks((from..=to).map(MemoryBlock::canonical)).unwrap(),
    }
}

async fn run_scripted(dedup: bool) -> Vec<Seen> {
    let chain = MemoryChain::new(1);
    chain.mine(5).unwrap();
    let source = ScriptedLive {
        chain: chain.clone(),
        live: Mutex::new(vec![canonical_commit(4, 7), canonical_commit(8, 8)]),
    };
    let mgr = ManagerBuilder::<MemoryChainTypes>::new()
        .dedup_live_after_backfill(dedup)
        .source(source)
        .context_factory(chain)
        .build()
        .unwrap();

    let recorder = Recorder::default();
    let reg = PluginRegistration::new("a", recorder.chain()).start_from(canonical(2));
    // The scripted feed ends on its own, so the run returns.
    mgr.run(reg).await.unwrap();
    recorder.seen()
}

#[tokio::test]
async fn live_overlap_with_backfill_is_trimmed() {
    assert_eq!(
        run_scripted(true).await,
        vec![
            Seen::Commit(3, 3),
            Seen::Commit(4, 4),
            Seen::Commit(5, 5),
            Seen::Commit(6, 7),
            Seen::Commit(8, 8),
        ]
    );
}

#[tokio::test]
async fn live_overlap_is_kept_when_dedup_is_off() {
    assert_eq!(
        run_scripted(false).await,
        vec![
            Seen::Commit(3, 3),
            Seen::Commit(4, 4),
            Seen::Commit(5, 5),
            Seen::Commit(4, 7),
            Seen::Commit(8, 8),
        ]
    );
}

#[tokio::test]
async fn start_ahead_of_head_waits_for_live_when_allowed() {
    let chain = MemoryChain::new(1);
    chain.mine(5).unwrap();
    let mgr = ManagerBuilder::<MemoryChainTypes>::new()
        .reject_start_ahead_of_head(false)
        .source(chain.clone())
        .context_factory(chain.clone())
        .build()
        .unwrap();
    let recorder = Recorder::default();

    let reg = PluginRegistration::new("a", recorder.chain()).start_from(canonical(9));
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run(reg).await }
    });
    wait_until(|| mgr.phase("a") == Some(PluginPhase::Live)).await;

    chain.mine(5).unwrap();
    wait_until(|| mgr.finished_height_for("a") == Some(10)).await;
    chain.close();
    task.await.unwrap().unwrap();

    assert_eq!(recorder.seen(), vec![Seen::Commit(10, 10)]);
}

#[tokio::test]
async fn start_at_max_height_skips_backfill() {
    let chain = MemoryChain::new(1);
    chain.mine(5).unwrap();
    let mgr = ManagerBuilder::<MemoryChainTypes>::new()
        .reject_start_ahead_of_head(false)
        .source(chain.clone())
        .context_factory(chain.clone())
        .build()
        .unwrap();
    let recorder = Recorder::default();

    let reg = PluginRegistration::new("a", recorder.chain())
        .start_from(BlockId::new(u64::MAX, "0xffffffffffffffff"));
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run(reg).await }
    });
    wait_until(|| mgr.phase("a") == Some(PluginPhase::Live)).await;

    chain.mine(1).unwrap();
    chain.close();
    task.await.unwrap().unwrap();

    assert!(recorder.seen().is_empty());
    assert_eq!(mgr.finished_height_for("a"), None);
    assert_eq!(mgr.phase("a"), Some(PluginPhase::Stopped));
}

/// Lets the chain move once between the live subscription and the head
/// snapshot.
struct MovesDuringStart {
    chain: MemoryChain,
    change: Mutex<Option<Box<dyn FnOnce(&MemoryChain) + Send>>>,
}

impl MovesDuringStart {
    fn new(chain: &MemoryChain, change: impl FnOnce(&MemoryChain) + Send + 'static) -> Self {
        Self {
            chain: chain.clone(),
            change: Mutex::new(Some(Box::new(change))),
        }
    }
}

#[async_trait]
impl ContextFactory<MemoryChainTypes> for MovesDuringStart {
    async fn snapshot(&self) -> Result<Snapshot<MemoryChainTypes>, PluginError> {
        let change = self.change.lock().unwrap().take();
        if let Some(change) = change {
            change(&self.chain);
        }
        self.chain.snapshot().await
    }
}

/// Start from genesis while block 6 is mined and 4..=6 reorged onto fork
/// `b`, then mine block 7 live.
async fn run_with_reorg_during_start(
    dedup: bool,
) -> (PluginManager<MemoryChainTypes>, Vec<Seen>) {
    let chain = MemoryChain::new(1);
    chain.mine(5).unwrap();
    let factory = MovesDuringStart::new(&chain, |chain| {
        chain.mine(1).unwrap();
        chain.reorg(3, 3, "b").unwrap();
    });
    let mgr = ManagerBuilder::<MemoryChainTypes>::new()
        .dedup_live_after_backfill(dedup)
        .source(chain.clone())
        .context_factory(factory)
        .build()
        .unwrap();
    let recorder = Recorder::default();

    let reg = PluginRegistration::new("a", recorder.chain()).start_from(canonical(0));
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run(reg).await }
    });
    wait_until(|| mgr.phase("a") == Some(PluginPhase::Live)).await;

    chain.mine(1).unwrap();
    wait_until(|| mgr.finished_height_for("a") == Some(7)).await;
    chain.close();
    task.await.unwrap().unwrap();
    (mgr, recorder.seen())
}

#[tokio::test]
async fn reorg_replayed_by_backfill_is_not_delivered_again() {
    let (mgr, seen) = run_with_reorg_during_start(true).await;

    // Backfill already walked the new fork, so the buffered commit of the
    // orphaned block 6 and the reorg are both dropped.
    let expected: Vec<_> = (1..=7).map(|n| Seen::Commit(n, n)).collect();
    assert_eq!(seen, expected);
    assert_eq!(
        mgr.checkpoint_for("a").unwrap().block,
        BlockId::new(7, "0x00000007b")
    );
}

#[tokio::test]
async fn reorg_during_start_is_replayed_when_dedup_is_off() {
    let (_, seen) = run_with_reorg_during_start(false).await;

    let mut expected: Vec<_> = (1..=6).map(|n| Seen::Commit(n, n)).collect();
    expected.extend([
        Seen::Commit(6, 6),
        Seen::Reorg {
            reverted: (4, 6),
            committed: (4, 6),
        },
        Seen::Commit(7, 7),
    ]);
    assert_eq!(seen, expected);
}

// ─── Validation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_ahead_of_head_is_rejected() {
    let chain = MemoryChain::new(1);
    chain.mine(5).unwrap();
    let mgr = manager(&chain);

    let reg = PluginRegistration::new("early", Recorder::default().chain())
        .start_from(canonical(9));
    let err = mgr.run(reg).await.unwrap_err();

    assert_eq!(err.plugin_id(), Some("early"));
    assert!(err.is_config());
    assert!(err.to_string().contains("ahead of head"), "{err}");
    assert!(!mgr.is_running("early"));
    assert_eq!(mgr.phase("early"), Some(PluginPhase::Failed));
}

#[tokio::test]
async fn duplicate_id_is_rejected_while_running() {
    let chain = MemoryChain::new(1);
    let mgr = manager(&chain);
    let token = tokio_util::sync::CancellationToken::new();

    let first = tokio::spawn({
        let mgr = mgr.clone();
        let token = token.clone();
        let reg = PluginRegistration::new("dup", Recorder::default().chain());
        async move { mgr.run_with_cancellation(reg, token).await }
    });
    wait_until(|| mgr.phase("dup") == Some(PluginPhase::Live)).await;

    let again = PluginRegistration::new("dup", Recorder::default().chain());
    let err = mgr.run(again).await.unwrap_err();
    match &err {
        PluginError::PluginFailed { id, source } => {
            assert_eq!(id, "dup");
            assert!(matches!(**source, PluginError::DuplicatePlugin { .. }));
        }
        other => panic!("expected PluginFailed, got {other:?}"),
    }
    assert_eq!(mgr.phase("dup"), Some(PluginPhase::Live));
    assert_eq!(mgr.running(), vec!["dup".to_string()]);

    token.cancel();
    first.await.unwrap().unwrap();

    // Once stopped, the id can be reused.
    let recorder = Recorder::default();
    let second = tokio::spawn({
        let mgr = mgr.clone();
        let reg = PluginRegistration::new("dup", recorder.chain());
        async move { mgr.run(reg).await }
    });
    wait_until(|| mgr.phase("dup") == Some(PluginPhase::Live)).await;
    chain.mine(1).unwrap();
    wait_until(|| mgr.finished_height_for("dup") == Some(1)).await;
    chain.close();
    second.await.unwrap().unwrap();
    assert_eq!(recorder.seen(), vec![Seen::Commit(1, 1)]);
}

// ─── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handler_failure_stops_the_plugin() {
    let chain = MemoryChain::new(1);
    chain.mine(5).unwrap();
    let mgr = manager(&chain);
    let recorder = Recorder::failing_at(3);

    let reg = PluginRegistration::new("bad", recorder.chain()).start_from(canonical(0));
    let err = mgr.run(reg).await.unwrap_err();

    assert_eq!(err.plugin_id(), Some("bad"));
    assert!(err.to_string().contains("refusing block 3"), "{err}");
    assert_eq!(recorder.seen(), vec![Seen::Commit(1, 1), Seen::Commit(2, 2)]);
    assert_eq!(mgr.finished_height_for("bad"), Some(2));
    assert_eq!(mgr.phase("bad"), Some(PluginPhase::Failed));
    assert!(!mgr.is_running("bad"));
}

#[tokio::test]
async fn run_all_returns_first_failure_and_releases_others() {
    let chain = MemoryChain::new(1);
    chain.mine(5).unwrap();
    let mgr = manager(&chain);

    let good = Recorder::default();
    let regs = vec![
        PluginRegistration::new("good", good.chain()),
        PluginRegistration::new("bad", Recorder::failing_at(3).chain()).start_from(canonical(0)),
    ];
    let err = mgr.run_all(regs).await.unwrap_err();

    assert_eq!(err.plugin_id(), Some("bad"));
    assert!(mgr.running().is_empty());
    assert_eq!(mgr.phase("good"), Some(PluginPhase::Stopped));
    assert!(good.seen().is_empty());
}

// ─── Finished height ──────────────────────────────────────────────────────────

#[tokio::test]
async fn finished_height_is_the_slowest_plugin() {
    let chain = MemoryChain::new(1);
    chain.mine(10).unwrap();
    let mgr = manager(&chain);
    assert_eq!(mgr.finished_height(), None);

    let fast = Recorder::default();
    let slow = Recorder::default();
    let slow_chain = PluginChain::builder()
        .with(Lagging {
            chain: chain.clone(),
            lag: 2,
        })
        .handlers(slow.clone())
        .build()
        .unwrap();

    let regs = vec![
        PluginRegistration::new("fast", fast.chain()).start_from(canonical(0)),
        PluginRegistration::new("slow", slow_chain).start_from(canonical(4)),
    ];
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run_all(regs).await }
    });

    wait_until(|| {
        mgr.finished_height_for("fast") == Some(10) && mgr.finished_height_for("slow") == Some(8)
    })
    .await;
    assert_eq!(mgr.finished_height(), Some(8));
    assert!(mgr.checkpoint_for("slow").unwrap().updated_at > 0);

    chain.mine(3).unwrap();
    wait_until(|| mgr.finished_height() == Some(11)).await;
    assert_eq!(mgr.finished_height_for("fast"), Some(13));

    chain.close();
    task.await.unwrap().unwrap();
    // Checkpoints outlive the runs.
    assert_eq!(mgr.finished_height(), Some(11));
}

// ─── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_stops_every_run() {
    let chain = MemoryChain::new(1);
    chain.mine(3).unwrap();
    let mgr = manager(&chain);

    let regs = vec![
        PluginRegistration::new("a", Recorder::default().chain()),
        PluginRegistration::new("b", Recorder::default().chain()).start_from(canonical(1)),
    ];
    let task = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run_all(regs).await }
    });
    wait_until(|| mgr.running().len() == 2 && mgr.phase("b") == Some(PluginPhase::Live)).await;

    mgr.shutdown();
    task.await.unwrap().unwrap();

    assert!(mgr.running().is_empty());
    assert_eq!(mgr.phase("a"), Some(PluginPhase::Stopped));
    assert_eq!(mgr.finished_height_for("b"), Some(3));
}

#[tokio::test]
async fn per_run_token_cancels_only_that_run() {
    let chain = MemoryChain::new(1);
    let mgr = manager(&chain);
    let token = tokio_util::sync::CancellationToken::new();

    let cancelled = tokio::spawn({
        let mgr = mgr.clone();
        let token = token.clone();
        let reg = PluginRegistration::new("a", Recorder::default().chain());
        async move { mgr.run_with_cancellation(reg, token).await }
    });
    let other = tokio::spawn({
        let mgr = mgr.clone();
        let reg = PluginRegistration::new("b", Recorder::default().chain());
        async move { mgr.run(reg).await }
    });
    wait_until(|| {
        mgr.phase("a") == Some(PluginPhase::Live) && mgr.phase("b") == Some(PluginPhase::Live)
    })
    .await;

    token.cancel();
    cancelled.await.unwrap().unwrap();
    assert!(!mgr.is_running("a"));
    assert!(mgr.is_running("b"));

    chain.close();
    other.await.unwrap().unwrap();
}

#[tokio::test]
async fn lagged_subscriber_fails() {
    let chain = MemoryChain::with_capacity(1, 1);
    let mgr = manager(&chain);

    let task = tokio::spawn({
        let mgr = mgr.clone();
        let reg = PluginRegistration::new("slow", Recorder::default().chain());
        async move { mgr.run(reg).await }
    });
    wait_until(|| mgr.phase("slow") == Some(PluginPhase::Live)).await;

    // The run task cannot be polled in between, so the buffer overflows.
    for _ in 0..5 {
        chain.mine(1).unwrap();
    }

    let err = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    match err {
        PluginError::PluginFailed { id, source } => {
            assert_eq!(id, "slow");
            assert!(matches!(*source, PluginError::Lagged { skipped: 4 }), "{source}");
        }
        other => panic!("expected PluginFailed, got {other:?}"),
    }
    assert_eq!(mgr.phase("slow"), Some(PluginPhase::Failed));
}
