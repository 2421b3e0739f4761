//! SceneMirror - the public face of the crate.
//!
//! Owns the store, the progress reporter, the cancellation token and the queues of the
//! current build. `build` is `&self` so a mirror shared through an `Arc` can be rebuilt,
//! cancelled, paused or promoted from other tasks while a build runs.
//!
//! Each build gets fresh queues. A superseded build keeps draining its own until it
//! notices it is stale, and never touches the queues of the build that replaced it.

use crate::cancel::{CancellationToken, Generation};
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::events::BuildEvent;
use crate::limiter::ConcurrencyLimiter;
use crate::progress::ProgressReporter;
use crate::remote::{RemoteInvoker, SceneApi};
use crate::scheduler::LoadingScheduler;
use crate::snapshot::TreeSnapshot;
use crate::store::SceneStore;
use crate::traversal::TraversalEngine;
use crate::types::{FetchKind, Handle, LoadItem};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

/// Result of a build that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub build_id: Uuid,
    pub generation: u64,
    pub root: Handle,
    pub top_level: usize,
    pub node_count: usize,
    pub failures: usize,
    pub elapsed_ms: u64,
}

/// Work queues belonging to one build.
#[derive(Debug, Default)]
struct BuildQueues {
    children: LoadingScheduler,
    attributes: LoadingScheduler,
}

pub struct SceneMirror {
    config: MirrorConfig,
    api: SceneApi,
    store: SceneStore,
    queues: Mutex<Arc<BuildQueues>>,
    reporter: ProgressReporter,
    token: CancellationToken,
}

impl SceneMirror {
    /// Mirror over `invoker`, with every remote call bounded by `config.concurrency`.
    pub fn new(invoker: Arc<dyn RemoteInvoker>, config: MirrorConfig) -> Self {
        let limiter = ConcurrencyLimiter::new(config.concurrency);
        Self {
            api: SceneApi::new(invoker, limiter),
            config,
            store: SceneStore::new(),
            queues: Mutex::new(Arc::new(BuildQueues::default())),
            reporter: ProgressReporter::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// The registry and forest of the current build.
    pub fn store(&self) -> &SceneStore {
        &self.store
    }

    fn queues(&self) -> Arc<BuildQueues> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install fresh queues, carrying the paused flag over, and return them.
    fn replace_queues(&self) -> Arc<BuildQueues> {
        let fresh = Arc::new(BuildQueues::default());
        let previous = {
            let mut current = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, fresh.clone())
        };
        if previous.children.is_paused() {
            fresh.children.pause();
        }
        // A build parked on the old queues must wake up to see it is stale.
        previous.children.interrupt();
        previous.attributes.interrupt();
        fresh
    }

    /// Receive every event from now on, tagged with its build generation.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BuildEvent> {
        self.reporter.subscribe()
    }

    /// Generation of the most recent build (or cancellation).
    pub fn generation(&self) -> u64 {
        self.token.current()
    }

    // ── Build lifecycle ──

    /// Mirror the remote scene from scratch.
    ///
    /// Starting a build supersedes any build still running: the older one unwinds with
    /// [`MirrorError::Cancelled`] and emits nothing further.
    pub async fn build(&self) -> Result<BuildSummary> {
        let build_id = Uuid::now_v7();
        let started = Instant::now();
        let generation = self.reporter.begin(&self.token);
        let queues = self.replace_queues();
        self.store.clear();

        let span = tracing::info_span!(
            "build",
            %build_id,
            generation = generation.id(),
            strategy = ?self.config.strategy
        );
        self.run_build(build_id, generation, &queues, started)
            .instrument(span)
            .await
    }

    async fn run_build(
        &self,
        build_id: Uuid,
        generation: Generation,
        queues: &BuildQueues,
        started: Instant,
    ) -> Result<BuildSummary> {
        tracing::info!(concurrency = self.config.concurrency, "build started");
        let engine = TraversalEngine::new(
            &self.api,
            &self.store,
            &queues.children,
            &self.reporter,
            &self.config,
            generation.clone(),
        );

        let outcome = match engine.run().await.and_then(|o| generation.check().map(|_| o)) {
            Ok(outcome) => outcome,
            Err(MirrorError::Cancelled) => {
                tracing::debug!("build superseded");
                self.reporter.finish(&generation);
                return Err(MirrorError::Cancelled);
            }
            Err(e) => {
                tracing::error!(error = %e, "build failed");
                self.reporter.finish(&generation);
                return Err(e);
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let node_count = self.store.len();
        self.reporter.complete(&generation, node_count, elapsed_ms);
        tracing::info!(
            node_count,
            top_level = outcome.top_level,
            failures = outcome.failures,
            elapsed_ms,
            "build complete"
        );

        Ok(BuildSummary {
            build_id,
            generation: generation.id(),
            root: outcome.root,
            top_level: outcome.top_level,
            node_count,
            failures: outcome.failures,
            elapsed_ms,
        })
    }

    /// Stop the running build. Emits `build-cancelled` only if a build was running; a
    /// later `build` starts fresh either way.
    pub fn cancel(&self) {
        let was_running = self.reporter.cancel(&self.token);
        let queues = self.queues();
        queues.children.interrupt();
        queues.attributes.interrupt();
        tracing::debug!(generation = self.token.current(), was_running, "build cancelled");
    }

    /// Whether a build has started and not yet completed, failed or been cancelled.
    pub fn is_building(&self) -> bool {
        self.reporter.is_running()
    }

    // ── Scheduling hints ──

    /// Load the children of `handles` ahead of background work. Returns how many were
    /// newly placed at the front.
    pub fn promote(&self, handles: &[Handle]) -> usize {
        let placed = self
            .queues()
            .children
            .prioritize(handles, FetchKind::Children);
        tracing::debug!(requested = handles.len(), placed, "promoted");
        placed
    }

    /// Hold background loading. Promoted work still runs.
    pub fn pause(&self) {
        self.queues().children.pause();
    }

    /// Let background loading continue.
    pub fn resume(&self) {
        self.queues().children.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.queues().children.is_paused()
    }

    /// Pause background loading while the consumer scrolls, if `pause_on_scroll` is set.
    pub fn scroll_started(&self) {
        if self.config.pause_on_scroll {
            self.pause();
        }
    }

    /// Counterpart of [`scroll_started`](Self::scroll_started).
    pub fn scroll_ended(&self) {
        if self.config.pause_on_scroll {
            self.resume();
        }
    }

    /// Queued and in-flight children loads of the current build.
    pub fn pending(&self) -> usize {
        let queues = self.queues();
        queues.children.pending() + queues.children.in_flight()
    }

    // ── On-demand work ──

    /// Fetch attribute payloads for committed nodes, at most once per node per build.
    ///
    /// Each node that receives attributes is re-announced with `node-updated`. Returns how
    /// many nodes were updated by this call.
    pub async fn load_attributes(&self, handles: &[Handle]) -> Result<usize> {
        let generation = self.token.generation();
        let queues = self.queues();
        let attributes = &queues.attributes;
        attributes.prioritize(handles, FetchKind::Attributes);

        let mut updated = 0;
        loop {
            generation.check()?;
            let batch = attributes.next_batch(self.api.limiter().limit());
            if batch.is_empty() {
                break;
            }
            let results = self
                .api
                .limiter()
                .run_settled(
                    batch
                        .into_iter()
                        .map(|item| self.load_item_attributes(attributes, item, &generation)),
                )
                .await;
            for result in results {
                if result? {
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn load_item_attributes(
        &self,
        queue: &LoadingScheduler,
        item: LoadItem,
        generation: &Generation,
    ) -> Result<bool> {
        let handle = item.handle;
        match self.store.get(handle) {
            None => {
                queue.mark_failed(handle);
                return Ok(false);
            }
            Some(node) if node.attributes.is_some() => {
                queue.mark_loaded(handle);
                return Ok(false);
            }
            Some(_) => {}
        }

        match self.api.attributes(handle).await {
            Ok(attributes) => {
                queue.mark_loaded(handle);
                let updated = self.store.update_current(handle, generation, |n| {
                    n.attributes = Some(attributes)
                })?;
                let Some(node) = updated else {
                    return Ok(false);
                };
                self.reporter.node_updated(generation, node);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(handle, error = %e, "attributes unavailable");
                queue.mark_failed(handle);
                Ok(false)
            }
        }
    }

    /// Drop a node and whatever only it kept reachable. Returns the removed handles.
    pub fn delete(&self, handle: Handle) -> Vec<Handle> {
        let removed = self.store.remove(handle);
        if !removed.is_empty() {
            tracing::info!(handle, removed = removed.len(), "node deleted");
        }
        removed
    }

    /// Owned view of what is mirrored right now.
    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot::capture(&self.store, self.token.current())
    }
}
