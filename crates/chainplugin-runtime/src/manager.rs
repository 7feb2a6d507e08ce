//! `PluginManager`: runs plugins against one notification source and tracks
//! how far each of them has got.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use chainplugin_core::error::PluginError;
use chainplugin_core::executor::PluginExecutor;
use chainplugin_core::middleware::PluginChain;
use chainplugin_core::source::{ContextFactory, NotificationSource};
use chainplugin_core::types::{BlockId, ChainTypes};

use crate::builder::ManagerBuilder;
use crate::config::{ManagerConfig, PluginPhase};
use crate::registration::PluginRegistration;
use crate::run_loop::PluginRun;

/// The last checkpoint a plugin reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCheckpoint {
    pub block: BlockId,
    /// Unix timestamp (seconds) of when the checkpoint was recorded.
    pub updated_at: i64,
}

// ─── Shared bookkeeping ──────────────────────────────────────────────────────

/// Per-manager bookkeeping. Each run loop only writes entries for its own id.
pub(crate) struct ManagerState<T: ChainTypes> {
    pub(crate) checkpoints: HashMap<String, PluginCheckpoint>,
    pub(crate) executors: HashMap<String, Arc<PluginExecutor<T>>>,
    pub(crate) running: HashSet<String>,
    pub(crate) phases: HashMap<String, PluginPhase>,
}

impl<T: ChainTypes> ManagerState<T> {
    fn new() -> Self {
        Self {
            checkpoints: HashMap::new(),
            executors: HashMap::new(),
            running: HashSet::new(),
            phases: HashMap::new(),
        }
    }
}

pub(crate) struct SharedState<T: ChainTypes>(Arc<RwLock<ManagerState<T>>>);

impl<T: ChainTypes> Clone for SharedState<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ChainTypes> SharedState<T> {
    fn new() -> Self {
        Self(Arc::new(RwLock::new(ManagerState::new())))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ManagerState<T>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ManagerState<T>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_phase(&self, id: &str, phase: PluginPhase) {
        self.write().phases.insert(id.to_string(), phase);
    }

    pub(crate) fn record_checkpoint(&self, id: &str, block: BlockId) {
        let checkpoint = PluginCheckpoint {
            block,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.write().checkpoints.insert(id.to_string(), checkpoint);
    }
}

/// Holds a plugin id in the running set; releases it when dropped, including
/// when the run future is dropped before completing.
///
/// The final phase is written under the same lock that releases the id, so a
/// new run claiming the id never has its phase overwritten.
pub(crate) struct RunningGuard<T: ChainTypes> {
    state: SharedState<T>,
    id: String,
    failed: bool,
}

impl<T: ChainTypes> RunningGuard<T> {
    fn claim(state: &SharedState<T>, id: &str) -> Result<Self, PluginError> {
        let mut guard = state.write();
        if !guard.running.insert(id.to_string()) {
            return Err(PluginError::DuplicatePlugin { id: id.to_string() });
        }
        Ok(Self {
            state: state.clone(),
            id: id.to_string(),
            failed: false,
        })
    }

    /// Release as `Failed` instead of `Stopped`.
    fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl<T: ChainTypes> Drop for RunningGuard<T> {
    fn drop(&mut self) {
        let mut state = self.state.write();
        state.running.remove(&self.id);
        state.executors.remove(&self.id);
        if self.failed {
            state.phases.insert(self.id.clone(), PluginPhase::Failed);
        } else if let Some(phase) = state.phases.get_mut(&self.id) {
            if phase.is_active() {
                *phase = PluginPhase::Stopped;
            }
        }
    }
}

// ─── PluginManager ───────────────────────────────────────────────────────────

/// Drives any number of plugins against one notification source.
///
/// Each plugin gets its own run loop: optional backfill up to the head seen at
/// start, then the live feed, one notification at a time. The manager records
/// every plugin's latest checkpoint and derives the finished height from them.
///
/// Clones share bookkeeping and the shutdown signal.
pub struct PluginManager<T: ChainTypes> {
    source: Arc<dyn NotificationSource<T>>,
    factory: Arc<dyn ContextFactory<T>>,
    config: ManagerConfig,
    state: SharedState<T>,
    shutdown: CancellationToken,
}

impl<T: ChainTypes> Clone for PluginManager<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            factory: Arc::clone(&self.factory),
            config: self.config.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: ChainTypes> PluginManager<T> {
    /// Manager with the default [`ManagerConfig`].
    pub fn new(
        source: impl NotificationSource<T> + 'static,
        factory: impl ContextFactory<T> + 'static,
    ) -> Self {
        Self::with_config(Arc::new(source), Arc::new(factory), ManagerConfig::default())
    }

    pub fn builder() -> ManagerBuilder<T> {
        ManagerBuilder::new()
    }

    pub(crate) fn with_config(
        source: Arc<dyn NotificationSource<T>>,
        factory: Arc<dyn ContextFactory<T>>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            source,
            factory,
            config,
            state: SharedState::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ─── Running ─────────────────────────────────────────────────────────────

    /// Run one plugin until its source ends, the manager shuts down, or it
    /// fails. Errors name the failing plugin (`PluginError::PluginFailed`).
    pub async fn run(&self, registration: PluginRegistration<T>) -> Result<(), PluginError> {
        self.run_with_cancellation(registration, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but also stops when `cancel` fires.
    ///
    /// Cancellation is observed between notifications: a notification whose
    /// `execute()` has started always finishes.
    pub async fn run_with_cancellation(
        &self,
        registration: PluginRegistration<T>,
        cancel: CancellationToken,
    ) -> Result<(), PluginError> {
        let id = registration.id.clone();
        match self.drive(registration, cancel).await {
            Ok(()) => {
                tracing::info!(plugin = %id, "Plugin stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(plugin = %id, error = %e, "Plugin failed");
                Err(e.for_plugin(id))
            }
        }
    }

    async fn drive(
        &self,
        registration: PluginRegistration<T>,
        cancel: CancellationToken,
    ) -> Result<(), PluginError> {
        let PluginRegistration {
            id,
            chain,
            start_from,
        } = registration;

        // A rejected duplicate holds no guard and leaves the running plugin's
        // phase alone.
        let mut running = RunningGuard::claim(&self.state, &id)?;
        let result = self.drive_claimed(&id, chain, start_from, cancel).await;
        if result.is_err() {
            running.mark_failed();
        }
        result
    }

    async fn drive_claimed(
        &self,
        id: &str,
        chain: PluginChain<T>,
        start_from: Option<BlockId>,
        cancel: CancellationToken,
    ) -> Result<(), PluginError> {
        // Subscribe before capturing the head: anything committed after the
        // snapshot is already buffered in the live stream.
        let live = self.source.subscribe().await?;
        let snapshot = self.factory.snapshot().await?;
        if let Some(start) = &start_from {
            if start.number > snapshot.head.number && self.config.reject_start_ahead_of_head {
                return Err(PluginError::StartAheadOfHead {
                    id: id.to_string(),
                    start: start.clone(),
                    head: snapshot.head,
                });
            }
        }

        tracing::info!(
            plugin = %id,
            chain = %self.config.chain,
            head = snapshot.head.number,
            start_from = ?start_from.as_ref().map(|b| b.number),
            layers = chain.depth(),
            "Starting plugin"
        );

        let head = snapshot.head.clone();
        let executor = Arc::new(PluginExecutor::new(id.to_string(), chain, snapshot));
        self.state
            .write()
            .executors
            .insert(id.to_string(), Arc::clone(&executor));

        PluginRun {
            id,
            executor: &executor,
            source: self.source.as_ref(),
            config: &self.config,
            state: &self.state,
            cancel: &cancel,
            shutdown: &self.shutdown,
        }
        .run(live, head, start_from)
        .await
    }

    /// Run every registration concurrently on the current task.
    ///
    /// Returns once all runs return. The first failure is returned and the
    /// remaining runs are dropped, which releases their ids.
    pub async fn run_all(
        &self,
        registrations: impl IntoIterator<Item = PluginRegistration<T>>,
    ) -> Result<(), PluginError> {
        let runs = registrations
            .into_iter()
            .map(|registration| self.run(registration));
        futures::future::try_join_all(runs).await.map(|_| ())
    }

    /// Stop every run loop at its next notification boundary.
    pub fn shutdown(&self) {
        tracing::info!(chain = %self.config.chain, "Shutting down plugin manager");
        self.shutdown.cancel();
    }

    /// The manager-wide shutdown token; cancelling it equals [`shutdown`](Self::shutdown).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    /// Lowest checkpointed block number across every plugin that has
    /// checkpointed at least once. Nothing below it is still needed by any of
    /// them.
    pub fn finished_height(&self) -> Option<u64> {
        self.state
            .read()
            .checkpoints
            .values()
            .map(|c| c.block.number)
            .min()
    }

    pub fn finished_height_for(&self, id: &str) -> Option<u64> {
        self.state.read().checkpoints.get(id).map(|c| c.block.number)
    }

    pub fn checkpoint_for(&self, id: &str) -> Option<PluginCheckpoint> {
        self.state.read().checkpoints.get(id).cloned()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state.read().running.contains(id)
    }

    /// Ids of every plugin currently running, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.read().running.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn phase(&self, id: &str) -> Option<PluginPhase> {
        self.state.read().phases.get(id).copied()
    }

    /// The executor bound to a running plugin.
    pub fn executor(&self, id: &str) -> Option<Arc<PluginExecutor<T>>> {
        self.state.read().executors.get(id).cloned()
    }
}

impl<T: ChainTypes> std::fmt::Debug for PluginManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}
