//! ProgressReporter - fans build events out to subscribers.
//!
//! Events are side effects only; nothing in the mirror reads them back. Every emission
//! re-checks the build generation under the reporter's lock, and new generations are
//! started under the same lock, so once a newer build has emitted anything, no event from
//! an older build can follow it. Percentages are clamped to never decrease within a build.

use crate::cancel::{CancellationToken, Generation};
use crate::events::{BuildEvent, BuildStage, SceneEvent};
use crate::types::{Handle, SceneNode};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct ReporterState {
    subscribers: Vec<mpsc::UnboundedSender<BuildEvent>>,
    generation: u64,
    percent: u8,
    /// Set from `begin` until the build completes, fails or is cancelled.
    running: bool,
}

#[derive(Debug, Default)]
pub struct ProgressReporter {
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BuildEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Start a new build generation and reset its progress.
    pub fn begin(&self, token: &CancellationToken) -> Generation {
        let mut state = self.lock();
        let generation = token.begin();
        state.generation = generation.id();
        state.percent = 0;
        state.running = true;
        generation
    }

    /// Invalidate the current generation. `build-cancelled` is announced only when a build
    /// was still running; returns whether one was.
    pub fn cancel(&self, token: &CancellationToken) -> bool {
        let mut state = self.lock();
        token.cancel();
        if !std::mem::take(&mut state.running) {
            return false;
        }
        let cancelled = state.generation;
        Self::send(&mut state, cancelled, SceneEvent::BuildCancelled {});
        true
    }

    /// Mark `generation` as no longer running without announcing anything.
    pub fn finish(&self, generation: &Generation) {
        let mut state = self.lock();
        if state.generation == generation.id() {
            state.running = false;
        }
    }

    /// Whether the latest build is still in progress.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    fn send(state: &mut ReporterState, generation: u64, event: SceneEvent) {
        let event = BuildEvent { generation, event };
        // Drop subscribers whose receiver is gone.
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Emit on behalf of `generation`; dropped silently if it is stale.
    fn emit(&self, generation: &Generation, event: SceneEvent) -> bool {
        let mut state = self.lock();
        if !generation.is_current() {
            return false;
        }
        Self::send(&mut state, generation.id(), event);
        true
    }

    // ── Fine-grained events ──

    /// `node-added`; `level` is 0 for top-level items.
    pub fn node_added(&self, generation: &Generation, node: SceneNode, level: u32) {
        self.emit(generation, SceneEvent::NodeAdded { node, level });
    }

    pub fn children_loaded(
        &self,
        generation: &Generation,
        parent: Handle,
        children: Vec<SceneNode>,
    ) {
        self.emit(generation, SceneEvent::ChildrenLoaded { parent, children });
    }

    pub fn node_updated(&self, generation: &Generation, node: SceneNode) {
        self.emit(generation, SceneEvent::NodeUpdated { node });
    }

    // ── Coarse progress ──

    /// Coarse stage and percent. The percent is clamped so it never decreases.
    pub fn progress(
        &self,
        generation: &Generation,
        stage: BuildStage,
        percent: u8,
        message: impl Into<String>,
    ) {
        let mut state = self.lock();
        if !generation.is_current() {
            return;
        }
        let percent = percent.min(100).max(state.percent);
        state.percent = percent;
        let message = message.into();
        tracing::debug!(generation = generation.id(), ?stage, percent, %message, "build progress");
        Self::send(
            &mut state,
            generation.id(),
            SceneEvent::BuildProgress {
                stage,
                percent,
                message,
            },
        );
    }

    /// Progress as a fraction of `done / total` mapped into `[from, to]`.
    pub fn progress_between(
        &self,
        generation: &Generation,
        stage: BuildStage,
        (from, to): (u8, u8),
        done: usize,
        total: usize,
        message: impl Into<String>,
    ) {
        let span = to.saturating_sub(from) as usize;
        let step = if total == 0 { span } else { span * done.min(total) / total };
        self.progress(generation, stage, from + step as u8, message);
    }

    /// Announce completion. Both events and the end of the running state happen under one
    /// lock, so a racing `cancel` either precedes them or announces nothing.
    pub fn complete(&self, generation: &Generation, node_count: usize, elapsed_ms: u64) {
        let mut state = self.lock();
        if !generation.is_current() {
            return;
        }
        state.percent = 100;
        state.running = false;
        let id = generation.id();
        Self::send(
            &mut state,
            id,
            SceneEvent::BuildProgress {
                stage: BuildStage::Complete,
                percent: 100,
                message: "build complete".to_string(),
            },
        );
        Self::send(
            &mut state,
            id,
            SceneEvent::BuildComplete {
                node_count,
                elapsed_ms,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemKind;

    fn drain(rx: &mut mpsc::UnboundedReceiver<BuildEvent>) -> Vec<BuildEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_percent_never_decreases() {
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        let gen = reporter.begin(&token);

        reporter.progress(&gen, BuildStage::Skeleton, 20, "a");
        reporter.progress(&gen, BuildStage::Children, 10, "b");
        reporter.progress(&gen, BuildStage::Children, 150, "c");

        let percents: Vec<u8> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e.event {
                SceneEvent::BuildProgress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![20, 20, 100]);
    }

    #[test]
    fn test_stale_generation_is_silent() {
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();

        let old = reporter.begin(&token);
        let new = reporter.begin(&token);
        let node = SceneNode::skeleton(1, "a".into(), "t".into(), ItemKind::Node, 1);
        reporter.node_added(&old, node.clone(), 0);
        reporter.node_added(&new, node, 0);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].generation, new.id());
    }

    #[test]
    fn test_cancel_announces_and_silences() {
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        let gen = reporter.begin(&token);

        reporter.cancel(&token);
        reporter.complete(&gen, 1, 1);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, SceneEvent::BuildCancelled {});
        assert_eq!(events[0].generation, gen.id());
    }

    #[test]
    fn test_cancel_after_completion_is_silent() {
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        let gen = reporter.begin(&token);
        reporter.complete(&gen, 3, 1);
        assert!(!reporter.is_running());
        drain(&mut rx);

        assert!(!reporter.cancel(&token));
        assert!(drain(&mut rx).is_empty());
        assert!(!gen.is_current());
    }

    #[test]
    fn test_finish_ignores_other_generations() {
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new();
        let old = reporter.begin(&token);
        let _new = reporter.begin(&token);

        reporter.finish(&old);
        assert!(reporter.is_running());
        assert!(reporter.cancel(&token));
        assert!(!reporter.cancel(&token));
    }

    #[test]
    fn test_progress_between() {
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        let gen = reporter.begin(&token);

        reporter.progress_between(&gen, BuildStage::Skeleton, (10, 30), 1, 2, "half");
        match &drain(&mut rx)[0].event {
            SceneEvent::BuildProgress { percent, .. } => assert_eq!(*percent, 20),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new();
        drop(reporter.subscribe());
        let gen = reporter.begin(&token);
        reporter.progress(&gen, BuildStage::Resolving, 1, "x");
        assert!(reporter.lock().subscribers.is_empty());
    }
}
