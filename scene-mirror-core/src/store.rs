//! SceneStore - canonical registry plus the visible tree forest.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  tree: [ChildSlot]          ordered level-1 items             │
//! │  map:  Handle -> StoreEntry                                   │
//! │          Reserved { waiters }   fetch in flight               │
//! │          Complete(SceneNode)    canonical node                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A handle is reserved before its first fetch and committed after it. Anyone who
//! discovers the handle in between receives the committed node through a waiter instead
//! of fetching again, so a duplicate fetch is not reachable. A reservation that is never
//! committed (fetch failed, build cancelled, future dropped) is released by its
//! [`ReservationGuard`].

use crate::cancel::Generation;
use crate::error::MirrorError;
use crate::types::{ChildSlot, Handle, PinLink, SceneNode};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// One registry slot.
#[derive(Debug)]
pub enum StoreEntry {
    Reserved {
        /// Identifies the guard that owns this placeholder.
        ticket: u64,
        waiters: Vec<oneshot::Sender<SceneNode>>,
    },
    Complete(SceneNode),
}

/// Outcome of [`SceneStore::reserve_or_reuse`].
#[derive(Debug)]
pub enum Reservation<'a> {
    /// First sighting. The holder fetches and then commits through the guard.
    New(ReservationGuard<'a>),
    /// Another discoverer is fetching; the receiver yields the committed node, or an
    /// error if the reservation is released instead.
    InFlight(oneshot::Receiver<SceneNode>),
    /// Already committed; reuse as-is.
    Existing(SceneNode),
}

impl Reservation<'_> {
    /// Whether this discovery must fetch the item itself.
    pub fn is_new(&self) -> bool {
        matches!(self, Reservation::New(_))
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    tree: Vec<ChildSlot>,
    map: HashMap<Handle, StoreEntry>,
    next_ticket: u64,
}

#[derive(Debug, Default)]
pub struct SceneStore {
    inner: Mutex<StoreInner>,
}

impl SceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Identity & reservation ──

    /// Reserve `handle` for fetching, or reuse whatever is already registered.
    ///
    /// On reuse of a committed node only the volatile pin link is refreshed.
    pub fn reserve_or_reuse(&self, handle: Handle, pin: Option<PinLink>) -> Reservation<'_> {
        let mut inner = self.lock();
        inner.next_ticket += 1;
        let ticket = inner.next_ticket;
        match inner.map.entry(handle) {
            Entry::Vacant(slot) => {
                slot.insert(StoreEntry::Reserved {
                    ticket,
                    waiters: Vec::new(),
                });
                Reservation::New(ReservationGuard {
                    store: self,
                    handle,
                    ticket,
                    armed: true,
                })
            }
            Entry::Occupied(mut slot) => match slot.get_mut() {
                StoreEntry::Reserved { waiters, .. } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Reservation::InFlight(rx)
                }
                StoreEntry::Complete(node) => {
                    if pin.is_some() {
                        node.pin = pin;
                    }
                    Reservation::Existing(node.clone())
                }
            },
        }
    }

    /// Replace the placeholder with `node` and hand it to every waiter.
    ///
    /// If the handle is already committed the existing node stays canonical and is
    /// returned unchanged.
    pub fn commit(&self, handle: Handle, node: SceneNode) -> SceneNode {
        let mut inner = self.lock();
        Self::commit_locked(&mut inner, handle, node)
    }

    /// Like [`commit`](Self::commit), but discards the node when `generation` is stale.
    ///
    /// The staleness check and the insert happen under one lock, so a superseded build
    /// cannot slip a late result in after a newer build has started.
    pub fn commit_current(
        &self,
        handle: Handle,
        node: SceneNode,
        generation: &Generation,
    ) -> Result<SceneNode, MirrorError> {
        let mut inner = self.lock();
        generation.check()?;
        Ok(Self::commit_locked(&mut inner, handle, node))
    }

    fn commit_locked(inner: &mut StoreInner, handle: Handle, node: SceneNode) -> SceneNode {
        if let Some(StoreEntry::Complete(existing)) = inner.map.get(&handle) {
            return existing.clone();
        }

        let previous = inner
            .map
            .insert(handle, StoreEntry::Complete(node.clone()));
        if let Some(StoreEntry::Reserved { waiters, .. }) = previous {
            for waiter in waiters {
                // A waiter that went away no longer needs the node.
                let _ = waiter.send(node.clone());
            }
        }
        node
    }

    /// Drop a placeholder without committing. Waiters see their channel close.
    ///
    /// Committed entries are left alone.
    pub fn release(&self, handle: Handle) -> bool {
        let mut inner = self.lock();
        if matches!(inner.map.get(&handle), Some(StoreEntry::Reserved { .. })) {
            inner.map.remove(&handle);
            true
        } else {
            false
        }
    }

    /// Release only the placeholder created for `ticket`. A store cleared and re-reserved
    /// since then keeps the newer placeholder.
    fn release_ticket(&self, handle: Handle, ticket: u64) -> bool {
        let mut inner = self.lock();
        match inner.map.get(&handle) {
            Some(StoreEntry::Reserved { ticket: owner, .. }) if *owner == ticket => {
                inner.map.remove(&handle);
                true
            }
            _ => false,
        }
    }

    // ── Node access ──

    /// Committed node for `handle`. Reserved handles read as absent.
    pub fn get(&self, handle: Handle) -> Option<SceneNode> {
        match self.lock().map.get(&handle) {
            Some(StoreEntry::Complete(node)) => Some(node.clone()),
            _ => None,
        }
    }

    /// Whether `handle` is committed.
    pub fn contains(&self, handle: Handle) -> bool {
        matches!(self.lock().map.get(&handle), Some(StoreEntry::Complete(_)))
    }

    /// Whether a fetch for `handle` is still in flight.
    pub fn is_reserved(&self, handle: Handle) -> bool {
        matches!(
            self.lock().map.get(&handle),
            Some(StoreEntry::Reserved { .. })
        )
    }

    /// Mutate a committed node in place on behalf of `generation` and return the updated
    /// copy. Nothing is written when `generation` is stale.
    pub fn update_current<F>(
        &self,
        handle: Handle,
        generation: &Generation,
        f: F,
    ) -> Result<Option<SceneNode>, MirrorError>
    where
        F: FnOnce(&mut SceneNode),
    {
        let mut inner = self.lock();
        generation.check()?;
        Ok(match inner.map.get_mut(&handle) {
            Some(StoreEntry::Complete(node)) => {
                f(node);
                Some(node.clone())
            }
            _ => None,
        })
    }

    // ── Tree ──

    /// Append a top-level slot unless its handle is already at the top level.
    pub fn push_root(&self, slot: ChildSlot) {
        Self::push_root_locked(&mut self.lock(), slot);
    }

    fn push_root_locked(inner: &mut StoreInner, slot: ChildSlot) {
        if let Some(handle) = slot.handle() {
            if inner.tree.iter().any(|s| s.handle() == Some(handle)) {
                return;
            }
        }
        inner.tree.push(slot);
    }

    /// Append a top-level slot on behalf of `generation`. Nothing is written when it is
    /// stale.
    pub fn push_root_current(
        &self,
        slot: ChildSlot,
        generation: &Generation,
    ) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        generation.check()?;
        Self::push_root_locked(&mut inner, slot);
        Ok(())
    }

    /// Replace the top level, dropping repeated handles. Nothing is written when
    /// `generation` is stale.
    pub fn set_roots_current(
        &self,
        roots: Vec<ChildSlot>,
        generation: &Generation,
    ) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        generation.check()?;
        inner.tree.clear();
        for slot in roots {
            Self::push_root_locked(&mut inner, slot);
        }
        Ok(())
    }

    /// Top-level slots in remote order.
    pub fn tree(&self) -> Vec<ChildSlot> {
        self.lock().tree.clone()
    }

    /// Number of committed nodes.
    pub fn len(&self) -> usize {
        self.lock()
            .map
            .values()
            .filter(|e| matches!(e, StoreEntry::Complete(_)))
            .count()
    }

    /// True when nothing is committed. Outstanding reservations do not count.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reservations not yet committed or released.
    pub fn reserved_count(&self) -> usize {
        self.lock()
            .map
            .values()
            .filter(|e| matches!(e, StoreEntry::Reserved { .. }))
            .count()
    }

    /// Committed handles, unordered.
    pub fn handles(&self) -> Vec<Handle> {
        self.lock()
            .map
            .iter()
            .filter_map(|(h, e)| matches!(e, StoreEntry::Complete(_)).then_some(*h))
            .collect()
    }

    // ── Deletion ──

    /// Remove a committed node, unlink it everywhere, and drop any of its descendants
    /// that are no longer reachable from the tree. Returns every removed handle.
    pub fn remove(&self, handle: Handle) -> Vec<Handle> {
        let mut inner = self.lock();
        if !matches!(inner.map.get(&handle), Some(StoreEntry::Complete(_))) {
            return Vec::new();
        }

        let descendants = Self::descendants_locked(&inner, handle);

        inner.map.remove(&handle);
        inner.tree.retain(|slot| slot.handle() != Some(handle));
        for entry in inner.map.values_mut() {
            if let StoreEntry::Complete(node) = entry {
                node.children.retain(|slot| slot.handle() != Some(handle));
                if node.pin.as_ref().is_some_and(|p| p.parent == handle) {
                    node.pin = None;
                }
            }
        }

        let reachable = Self::reachable_locked(&inner);
        let mut removed = vec![handle];
        for h in descendants {
            if h != handle && !reachable.contains(&h) {
                inner.map.remove(&h);
                removed.push(h);
            }
        }
        removed
    }

    fn descendants_locked(inner: &StoreInner, start: Handle) -> HashSet<Handle> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(h) = queue.pop_front() {
            if !seen.insert(h) {
                continue;
            }
            if let Some(StoreEntry::Complete(node)) = inner.map.get(&h) {
                queue.extend(node.child_handles());
            }
        }
        seen
    }

    fn reachable_locked(inner: &StoreInner) -> HashSet<Handle> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Handle> = inner.tree.iter().filter_map(ChildSlot::handle).collect();
        while let Some(h) = queue.pop_front() {
            if !seen.insert(h) {
                continue;
            }
            if let Some(StoreEntry::Complete(node)) = inner.map.get(&h) {
                queue.extend(node.child_handles());
            }
        }
        seen
    }

    /// Forget everything, including reservations.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.tree.clear();
        inner.map.clear();
    }
}

/// Exclusive right to fetch one reserved handle.
///
/// Dropping the guard without committing releases the reservation, so a failed or
/// cancelled fetch never leaves a placeholder behind.
#[derive(Debug)]
pub struct ReservationGuard<'a> {
    store: &'a SceneStore,
    handle: Handle,
    ticket: u64,
    armed: bool,
}

impl ReservationGuard<'_> {
    /// The reserved handle.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Commit unconditionally and disarm the guard.
    pub fn commit(mut self, node: SceneNode) -> SceneNode {
        self.armed = false;
        self.store.commit(self.handle, node)
    }

    /// Commit only if `generation` is still current; otherwise release.
    pub fn commit_current(
        mut self,
        node: SceneNode,
        generation: &Generation,
    ) -> Result<SceneNode, MirrorError> {
        let committed = self.store.commit_current(self.handle, node, generation)?;
        self.armed = false;
        Ok(committed)
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.release_ticket(self.handle, self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::types::{ItemKind, LoadState};

    fn node(handle: Handle, name: &str) -> SceneNode {
        SceneNode::skeleton(handle, name.into(), "node".into(), ItemKind::Node, 1)
    }

    #[test]
    fn test_reserve_then_commit() {
        let store = SceneStore::new();
        let Reservation::New(guard) = store.reserve_or_reuse(5, None) else {
            panic!("first sighting must be new");
        };
        assert!(store.is_reserved(5));
        assert!(store.get(5).is_none());

        guard.commit(node(5, "five"));
        assert!(!store.is_reserved(5));
        assert_eq!(store.get(5).unwrap().name, "five");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_discoverer_waits_instead_of_fetching() {
        let store = SceneStore::new();
        let first = store.reserve_or_reuse(9, None);
        assert!(first.is_new());

        let second = store.reserve_or_reuse(9, None);
        let Reservation::InFlight(rx) = second else {
            panic!("second sighting must wait");
        };

        if let Reservation::New(guard) = first {
            guard.commit(node(9, "nine"));
        }
        let received = rx.await.unwrap();
        assert_eq!(received.handle, Some(9));
        assert_eq!(received.name, "nine");
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_and_wakes_waiters() {
        let store = SceneStore::new();
        let guard = store.reserve_or_reuse(3, None);
        let Reservation::InFlight(rx) = store.reserve_or_reuse(3, None) else {
            panic!("expected waiter");
        };

        drop(guard);
        assert!(!store.is_reserved(3));
        assert!(rx.await.is_err());
        // Not permanently blocked: the next discoverer fetches.
        assert!(store.reserve_or_reuse(3, None).is_new());
    }

    #[test]
    fn test_existing_refreshes_pin_link_only() {
        let store = SceneStore::new();
        store.commit(7, node(7, "seven"));

        let pin = PinLink {
            parent: 1,
            index: 0,
            label: "Input".into(),
            id: 11,
        };
        let Reservation::Existing(existing) = store.reserve_or_reuse(7, Some(pin.clone())) else {
            panic!("committed handle must be reused");
        };
        assert_eq!(existing.name, "seven");
        assert_eq!(existing.pin, Some(pin));
    }

    #[test]
    fn test_first_commit_is_canonical() {
        let store = SceneStore::new();
        store.commit(1, node(1, "first"));
        let kept = store.commit(1, node(1, "second"));
        assert_eq!(kept.name, "first");
        assert_eq!(store.get(1).unwrap().name, "first");
    }

    #[test]
    fn test_stale_commit_is_discarded_and_released() {
        let store = SceneStore::new();
        let token = CancellationToken::new();
        let gen = token.begin();

        let Reservation::New(guard) = store.reserve_or_reuse(4, None) else {
            panic!("expected new");
        };
        token.begin();

        let result = guard.commit_current(node(4, "late"), &gen);
        assert!(matches!(result, Err(MirrorError::Cancelled)));
        assert!(store.get(4).is_none());
        assert_eq!(store.reserved_count(), 0);
    }

    #[test]
    fn test_release_ignores_committed() {
        let store = SceneStore::new();
        store.commit(2, node(2, "two"));
        assert!(!store.release(2));
        assert!(store.contains(2));
    }

    #[test]
    fn test_remove_cascades_to_unreachable_descendants() {
        let store = SceneStore::new();
        // 1 -> 2 -> 3, 4 -> 3 ; roots 1 and 4
        let mut n1 = node(1, "a");
        n1.children = vec![ChildSlot::linked(2)];
        let mut n2 = node(2, "b");
        n2.children = vec![ChildSlot::linked(3)];
        let mut n4 = node(4, "d");
        n4.children = vec![ChildSlot::linked(3)];
        store.commit(1, n1);
        store.commit(2, n2);
        store.commit(3, node(3, "c"));
        store.commit(4, n4);
        store.push_root(ChildSlot::linked(1));
        store.push_root(ChildSlot::linked(4));

        let mut removed = store.remove(1);
        removed.sort();
        assert_eq!(removed, vec![1, 2]);
        // 3 is still reachable through 4.
        assert!(store.contains(3));
        assert_eq!(store.tree(), vec![ChildSlot::linked(4)]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove_unlinks_from_parents() {
        let store = SceneStore::new();
        let mut parent = node(1, "p");
        parent.children = vec![ChildSlot::linked(2)];
        store.commit(1, parent);
        store.commit(2, node(2, "c"));
        store.push_root(ChildSlot::linked(1));

        store.remove(2);
        assert!(store.get(1).unwrap().children.is_empty());
    }

    #[test]
    fn test_stale_guard_keeps_newer_reservation() {
        let store = SceneStore::new();
        let stale = store.reserve_or_reuse(6, None);
        store.clear();
        let fresh = store.reserve_or_reuse(6, None);
        assert!(fresh.is_new());

        drop(stale);
        assert!(store.is_reserved(6));
        drop(fresh);
        assert_eq!(store.reserved_count(), 0);
    }

    #[test]
    fn test_stale_updates_are_dropped() {
        let store = SceneStore::new();
        let token = CancellationToken::new();
        let gen = token.begin();
        store.commit(1, node(1, "one"));
        store
            .set_roots_current(vec![ChildSlot::linked(1), ChildSlot::linked(1)], &gen)
            .unwrap();
        assert_eq!(store.tree().len(), 1);

        token.begin();
        let stale = store.update_current(1, &gen, |n| n.state = LoadState::Error);
        assert!(matches!(stale, Err(MirrorError::Cancelled)));
        assert_eq!(store.get(1).unwrap().state, LoadState::Skeleton);
        assert!(store.set_roots_current(Vec::new(), &gen).is_err());
        assert_eq!(store.tree().len(), 1);
    }

    #[test]
    fn test_push_root_dedups_handles() {
        let store = SceneStore::new();
        store.push_root(ChildSlot::linked(1));
        store.push_root(ChildSlot::linked(1));
        assert_eq!(store.tree().len(), 1);
    }
}
