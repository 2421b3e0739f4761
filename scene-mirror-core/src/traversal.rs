//! TraversalEngine - walks the remote graph for one build.
//!
//! Both strategies share two primitives:
//!
//! - `materialize` turns a discovered handle into a committed skeleton node. The store's
//!   reservation decides who fetches, so each handle is fetched at most once per build.
//!   The node is committed right after its own detail fetch, before anything below it is
//!   touched, so a discoverer waiting on a reservation never waits on its own ancestors.
//! - `load_children` materializes a parent's immediate children, in remote order, with
//!   bounded fan-out. Per-child failures drop that child and nothing else.
//!
//! Only the discoverer that materialized a node goes on to expand it. A handle reached
//! again (shared child, cycle) is linked but not descended into, which is what ends the
//! walk on cyclic graphs. `max_depth` is a ceiling on top of that.
//!
//! ```text
//! Eager:   root ─► top level ─► descend(A) ─► descend(A.1) ...  (depth-first per item)
//! Staged:  root ─► top level ─► scheduler ─► batch ─► expand ─► enqueue children ─┐
//!                                   ▲                                             │
//!                                   └─────────────────────────────────────────────┘
//! ```

use crate::cancel::Generation;
use crate::config::{MirrorConfig, Strategy};
use crate::error::{MirrorError, Result};
use crate::events::BuildStage;
use crate::progress::ProgressReporter;
use crate::remote::SceneApi;
use crate::scheduler::LoadingScheduler;
use crate::store::{Reservation, SceneStore};
use crate::types::{
    ChildSlot, FetchKind, Handle, ItemKind, LoadItem, LoadState, PinLink, Priority, SceneNode,
};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Percent reserved for resolving the root and the top level.
const SKELETON_DONE: u8 = 10;
/// Upper end of the children stage; the final step to 100 belongs to completion.
const CHILDREN_DONE: u8 = 95;

/// A child as seen from the parent that listed it.
#[derive(Debug, Clone)]
struct Child {
    slot: ChildSlot,
    node: SceneNode,
    /// Set only for the discovery that materialized the node.
    is_new: bool,
}

impl Child {
    /// The handle to expand next, if this discovery owns the expansion.
    fn expandable(&self) -> Option<Handle> {
        match self.node.kind {
            ItemKind::Graph | ItemKind::Node if self.is_new => self.node.handle,
            _ => None,
        }
    }
}

/// What a finished traversal reports back to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalOutcome {
    pub root: Handle,
    pub top_level: usize,
    /// Items or branches omitted because a fetch failed.
    pub failures: usize,
}

/// One build's walk over the remote graph.
pub struct TraversalEngine<'a> {
    api: &'a SceneApi,
    store: &'a SceneStore,
    scheduler: &'a LoadingScheduler,
    reporter: &'a ProgressReporter,
    config: &'a MirrorConfig,
    generation: Generation,
    processed: AtomicUsize,
    failures: AtomicUsize,
}

impl<'a> TraversalEngine<'a> {
    pub fn new(
        api: &'a SceneApi,
        store: &'a SceneStore,
        scheduler: &'a LoadingScheduler,
        reporter: &'a ProgressReporter,
        config: &'a MirrorConfig,
        generation: Generation,
    ) -> Self {
        Self {
            api,
            store,
            scheduler,
            reporter,
            config,
            generation,
            processed: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Resolve the root, materialize the top level, then walk the rest with the configured
    /// strategy.
    pub async fn run(&self) -> Result<TraversalOutcome> {
        let gen = &self.generation;
        self.reporter
            .progress(gen, BuildStage::Resolving, 0, "resolving root item");

        let root = self.resolve_root().await?;
        let root_handle = root.handle.unwrap_or_default();
        self.reporter
            .progress(gen, BuildStage::Resolving, 5, format!("root is {}", root.name));

        // Each top-level item is placed and announced as soon as every item before it has
        // resolved. Listing the root's items is as fatal as resolving the root itself.
        let top = self
            .load_children(&root, |child| {
                if self.store.push_root_current(child.slot.clone(), gen).is_ok() {
                    self.announce(child);
                }
            })
            .await
            .map_err(|e| match e {
                MirrorError::Fetch { source, .. } => MirrorError::RootUnavailable(source),
                other => other,
            })?;
        self.store
            .set_roots_current(top.iter().map(|c| c.slot.clone()).collect(), gen)?;
        self.reporter.progress(
            gen,
            BuildStage::Skeleton,
            SKELETON_DONE,
            format!("{} top-level items", top.len()),
        );
        tracing::debug!(root = root_handle, top_level = top.len(), "top level materialized");

        match self.config.strategy {
            Strategy::Eager => self.run_eager(&top).await?,
            Strategy::Staged => self.run_staged(&top).await?,
        }

        Ok(TraversalOutcome {
            root: root_handle,
            top_level: top.len(),
            failures: self.failures.load(Ordering::SeqCst),
        })
    }

    async fn resolve_root(&self) -> Result<SceneNode> {
        let handle = self
            .api
            .root_graph()
            .await
            .map_err(MirrorError::RootUnavailable)?;
        self.generation.check()?;

        let details = self
            .api
            .item_details(handle)
            .await
            .map_err(MirrorError::RootUnavailable)?;
        self.generation.check()?;

        let kind = if details.is_graph {
            ItemKind::Graph
        } else {
            ItemKind::Node
        };
        // The root itself is not mirrored; its items are level 1.
        Ok(SceneNode::skeleton(
            handle,
            details.name,
            details.type_tag,
            kind,
            0,
        ))
    }

    // ── Strategies ──

    async fn run_eager(&self, top: &[Child]) -> Result<()> {
        let roots: Vec<SceneNode> = top
            .iter()
            .filter(|c| c.expandable().is_some())
            .map(|c| c.node.clone())
            .collect();
        let total = roots.len();
        let done = AtomicUsize::new(0);

        let results = self
            .api
            .limiter()
            .run_settled(roots.into_iter().map(|node| {
                let done = &done;
                async move {
                    let name = node.name.clone();
                    let result = self.descend(node).await;
                    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                    self.reporter.progress_between(
                        &self.generation,
                        BuildStage::Children,
                        (SKELETON_DONE, CHILDREN_DONE),
                        finished,
                        total,
                        format!("loaded {name}"),
                    );
                    result
                }
            }))
            .await;
        self.settle(results)
    }

    /// Expand `node`, then every child it materialized, before returning.
    fn descend(&self, node: SceneNode) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(children) = self.expand(&node).await? else {
                return Ok(());
            };
            let fresh: Vec<SceneNode> = children
                .into_iter()
                .filter(|c| c.expandable().is_some())
                .map(|c| c.node)
                .collect();
            let results = self
                .api
                .limiter()
                .run_settled(fresh.into_iter().map(|child| self.descend(child)))
                .await;
            self.settle(results)
        })
    }

    async fn run_staged(&self, top: &[Child]) -> Result<()> {
        let fresh: Vec<Handle> = top.iter().filter_map(Child::expandable).collect();
        let visible = self.config.visible_batch_size.min(fresh.len());
        self.scheduler
            .enqueue(&fresh[..visible], FetchKind::Children, Priority::High);
        self.scheduler
            .enqueue(&fresh[visible..], FetchKind::Children, Priority::Normal);

        let batch_size = self.api.limiter().limit();
        let mut expanded = 0usize;
        loop {
            self.generation.check()?;
            let batch = self.scheduler.next_batch(batch_size);
            if batch.is_empty() {
                let pending = self.scheduler.pending();
                if pending == 0 {
                    break;
                }
                tracing::debug!(pending, "background loading paused");
                self.scheduler
                    .wait_for_work(|| self.generation.is_current())
                    .await;
                continue;
            }

            expanded += batch.len();
            let results = self
                .api
                .limiter()
                .run_settled(batch.into_iter().map(|item| self.process(item)))
                .await;
            results.into_iter().collect::<Result<Vec<()>>>()?;

            let remaining = self.scheduler.pending();
            self.reporter.progress_between(
                &self.generation,
                BuildStage::Children,
                (SKELETON_DONE, CHILDREN_DONE),
                expanded,
                expanded + remaining,
                format!("{expanded} items expanded, {remaining} queued"),
            );
        }
        Ok(())
    }

    /// Expand one queued item and queue whatever it materialized.
    async fn process(&self, item: LoadItem) -> Result<()> {
        let handle = item.handle;
        let Some(node) = self.store.get(handle) else {
            // Promoted before discovery, or deleted while queued.
            tracing::debug!(handle, "queued item is not in the store");
            self.scheduler.mark_failed(handle);
            return Ok(());
        };

        match self.expand(&node).await {
            Ok(Some(children)) => {
                self.scheduler.mark_loaded(handle);
                self.generation.check()?;
                let next: Vec<Handle> = children.iter().filter_map(Child::expandable).collect();
                self.scheduler
                    .enqueue(&next, FetchKind::Children, Priority::Normal);
                Ok(())
            }
            Ok(None) => {
                self.scheduler.mark_failed(handle);
                Ok(())
            }
            Err(e) => {
                self.scheduler.mark_failed(handle);
                Err(e)
            }
        }
    }

    // ── Shared primitives ──

    /// Load a committed node's children, record them and announce them.
    ///
    /// Returns `None` when the children are unavailable: the node is marked as errored and
    /// the build goes on without that branch.
    async fn expand(&self, node: &SceneNode) -> Result<Option<Vec<Child>>> {
        let Some(handle) = node.handle else {
            return Ok(Some(Vec::new()));
        };
        if node.level >= self.config.max_depth {
            tracing::debug!(handle, level = node.level, "depth ceiling reached");
            return Ok(Some(Vec::new()));
        }

        self.store
            .update_current(handle, &self.generation, |n| n.state = LoadState::Loading)?;
        match self.load_children(node, |child| self.announce(child)).await {
            Ok(children) => {
                let slots: Vec<ChildSlot> = children.iter().map(|c| c.slot.clone()).collect();
                self.store.update_current(handle, &self.generation, |n| {
                    n.children = slots;
                    n.state = LoadState::Loaded;
                })?;
                self.reporter.children_loaded(
                    &self.generation,
                    handle,
                    children.iter().map(|c| c.node.clone()).collect(),
                );
                Ok(Some(children))
            }
            Err(MirrorError::Cancelled) => Err(MirrorError::Cancelled),
            Err(e) => {
                tracing::warn!(handle, error = %e, "children unavailable, branch omitted");
                self.failures.fetch_add(1, Ordering::SeqCst);
                let updated = self
                    .store
                    .update_current(handle, &self.generation, |n| n.state = LoadState::Error)?;
                if let Some(updated) = updated {
                    self.reporter.node_updated(&self.generation, updated);
                }
                Ok(None)
            }
        }
    }

    /// Materialize the immediate children of `parent`, in remote order.
    ///
    /// `on_child` sees each child in that order as soon as all earlier siblings are
    /// settled. Fails only when the parent's own listing call fails (or on cancellation);
    /// a child whose fetch fails is logged and left out.
    async fn load_children<C>(&self, parent: &SceneNode, mut on_child: C) -> Result<Vec<Child>>
    where
        C: FnMut(&Child) + Send,
    {
        let mut on_ready = |_: usize, result: &Result<Child>| {
            if let Ok(child) = result {
                on_child(child);
            }
        };
        let Some(handle) = parent.handle else {
            return Ok(Vec::new());
        };
        let level = parent.level + 1;
        let limiter = self.api.limiter();

        let results = match parent.kind {
            ItemKind::Graph => {
                let owned = self
                    .api
                    .owned_items(handle)
                    .await
                    .map_err(MirrorError::fetch(handle))?;
                self.generation.check()?;
                limiter
                    .run_settled_with(
                        owned
                            .into_iter()
                            .map(|child| self.materialize(child, level, None)),
                        &mut on_ready,
                    )
                    .await
            }
            ItemKind::Node => {
                let pins = self
                    .api
                    .pin_count(handle)
                    .await
                    .map_err(MirrorError::fetch(handle))?;
                self.generation.check()?;
                limiter
                    .run_settled_with(
                        (0..pins).map(|index| self.materialize_pin(handle, index, level)),
                        &mut on_ready,
                    )
                    .await
            }
            ItemKind::Unconnected => return Ok(Vec::new()),
        };

        let mut children = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(child) => children.push(child),
                Err(MirrorError::Cancelled) => return Err(MirrorError::Cancelled),
                Err(e) => {
                    tracing::warn!(parent = handle, error = %e, "child omitted");
                    self.failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        Ok(children)
    }

    /// Resolve one pin of `parent`: its connected item, or an unconnected placeholder.
    async fn materialize_pin(&self, parent: Handle, index: u32, level: u32) -> Result<Child> {
        let (target, details) = futures::try_join!(
            self.api.connected_item(parent, index),
            self.api.pin_details(parent, index),
        )
        .map_err(MirrorError::fetch(parent))?;
        let link = details.link(parent, index);

        match target {
            Some(handle) => self.materialize(handle, level, Some(link)).await,
            None => {
                let node = SceneNode::unconnected(link, level);
                Ok(Child {
                    slot: ChildSlot::Unconnected {
                        node: Box::new(node.clone()),
                    },
                    node,
                    is_new: false,
                })
            }
        }
    }

    /// Turn a discovered handle into a committed node, fetching only if nobody has.
    ///
    /// A reservation released by its holder (failed fetch, superseded build) sends the
    /// waiter round again: it either finds the node committed or takes the fetch itself.
    async fn materialize(
        &self,
        handle: Handle,
        level: u32,
        pin: Option<PinLink>,
    ) -> Result<Child> {
        let (node, is_new) = loop {
            self.generation.check()?;
            match self.store.reserve_or_reuse(handle, pin.clone()) {
                Reservation::New(guard) => {
                    let details = self
                        .api
                        .item_details(handle)
                        .await
                        .map_err(MirrorError::fetch(handle))?;
                    let kind = if details.is_graph {
                        ItemKind::Graph
                    } else {
                        ItemKind::Node
                    };
                    let mut node =
                        SceneNode::skeleton(handle, details.name, details.type_tag, kind, level);
                    node.pin = pin;
                    if !self.config.lazy_attributes {
                        node.attributes = self.fetch_attributes(handle).await;
                    }
                    break (guard.commit_current(node, &self.generation)?, true);
                }
                Reservation::InFlight(waiter) => {
                    let Ok(node) = waiter.await else {
                        continue;
                    };
                    let node = match &pin {
                        Some(link) => self
                            .store
                            .update_current(handle, &self.generation, |n| {
                                n.pin = Some(link.clone())
                            })?
                            .unwrap_or(node),
                        None => node,
                    };
                    break (node, false);
                }
                Reservation::Existing(node) => break (node, false),
            }
        };

        self.tick().await?;
        Ok(Child {
            slot: ChildSlot::linked(handle),
            node,
            is_new,
        })
    }

    async fn fetch_attributes(&self, handle: Handle) -> Option<Value> {
        match self.api.attributes(handle).await {
            Ok(attributes) => Some(attributes),
            Err(e) => {
                tracing::warn!(handle, error = %e, "attributes unavailable");
                None
            }
        }
    }

    /// Emit `node-added` for a child this discovery materialized.
    fn announce(&self, child: &Child) {
        if child.is_new {
            let level = child.node.level.saturating_sub(1);
            self.reporter
                .node_added(&self.generation, child.node.clone(), level);
        }
    }

    /// Count one processed item, yielding to the runtime every `yield_every` items.
    async fn tick(&self) -> Result<()> {
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.config.yield_every;
        if every > 0 && processed % every == 0 {
            tokio::task::yield_now().await;
        }
        self.generation.check()
    }

    /// Fold sibling subtree results: cancellation propagates, anything else was already
    /// logged where it happened and only counts as a failure.
    fn settle(&self, results: Vec<Result<()>>) -> Result<()> {
        for result in results {
            match result {
                Ok(()) => {}
                Err(MirrorError::Cancelled) => return Err(MirrorError::Cancelled),
                Err(e) => {
                    tracing::warn!(error = %e, "subtree omitted");
                    self.failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }
}
