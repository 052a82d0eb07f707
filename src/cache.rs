//! Cache scopes and their entries.
//!
//! A [`CacheScope`] owns every entry for the keys loaded through it. An
//! entry is created pending on the first request for a key, transitions to
//! resolved exactly once, and is never mutated after that. Resetting a scope
//! swaps in a fresh generation of entries wholesale; fetches still in flight
//! finish against the generation they started in, so their waiters are not
//! disturbed.

use std::{
    fmt::{self, Debug, Formatter},
    hash::Hash,
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::Waker,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use dashmap::{mapref::entry::Entry, DashMap};

use crate::{outcome::Outcome, wakerset::WakerSet};

/// The shared state of one pending key. Every future waiting on the key
/// holds the cell, so they all observe the same outcome even if the entry is
/// later cleared from its scope.
pub(crate) struct PendingCell<Value> {
    state: Mutex<CellState<Value>>,
}

pub(crate) struct CellState<Value> {
    /// Whether some fetch cycle has claimed this key.
    pub dispatched: bool,
    pub wakers: WakerSet,
    pub outcome: Option<Outcome<Value>>,
}

impl<Value> PendingCell<Value> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                dispatched: false,
                wakers: WakerSet::default(),
                outcome: None,
            }),
        }
    }

    // Locks are only held for the duration of a poll or a state transition,
    // never across an await. A panic while holding one can't leave the state
    // half-written, so a poisoned lock is safe to keep using.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CellState<Value>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim this key for a fetch cycle. Returns false if another cycle
    /// already has it or it is already resolved.
    pub(crate) fn claim(&self) -> bool {
        let mut state = self.lock();
        if state.dispatched || state.outcome.is_some() {
            false
        } else {
            state.dispatched = true;
            true
        }
    }

    /// Give up a claim without resolving, and wake every waiter so one of
    /// them can claim the key again.
    pub(crate) fn release(&self) {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return;
        }

        state.dispatched = false;
        let wakers = state.wakers.snapshot();
        drop(state);

        wakers.into_iter().for_each(Waker::wake);
    }

    /// Store the outcome and wake every waiter. Returns false if the cell
    /// had already been completed.
    pub(crate) fn complete(&self, outcome: Outcome<Value>) -> bool {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return false;
        }

        state.outcome = Some(outcome);
        let wakers = mem::take(&mut state.wakers);
        drop(state);

        wakers.wake_all();
        true
    }
}

impl<Value> Debug for PendingCell<Value> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("PendingCell")
            .field("dispatched", &state.dispatched)
            .field("waiters", &state.wakers.len())
            .field("resolved", &state.outcome.is_some())
            .finish()
    }
}

pub(crate) enum Slot<Value> {
    Pending(Arc<PendingCell<Value>>),
    Resolved(Outcome<Value>),
}

impl<Value> Slot<Value> {
    fn holds(&self, cell: &Arc<PendingCell<Value>>) -> bool {
        matches!(self, Slot::Pending(stored) if Arc::ptr_eq(stored, cell))
    }
}

/// What registering interest in a key found.
pub(crate) enum Registered<Value> {
    /// The key was already resolved in this scope.
    Resolved(Outcome<Value>),
    /// Another request already created a pending entry.
    Joined(Arc<PendingCell<Value>>),
    /// This request created the pending entry, and must queue the key.
    Created(Arc<PendingCell<Value>>),
}

/// One generation of a scope's entries.
pub(crate) struct Generation<Key, Value> {
    entries: DashMap<Key, Slot<Value>>,
    started: Instant,
}

impl<Key: Eq + Hash, Value: Clone> Generation<Key, Value> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            started: Instant::now(),
        }
    }

    pub(crate) fn register(&self, key: &Key) -> Registered<Value>
    where
        Key: Clone,
    {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Resolved(outcome) => Registered::Resolved(outcome.clone()),
                Slot::Pending(cell) => Registered::Joined(Arc::clone(cell)),
            },
            Entry::Vacant(entry) => {
                let cell = Arc::new(PendingCell::new());
                entry.insert(Slot::Pending(Arc::clone(&cell)));
                Registered::Created(cell)
            }
        }
    }

    /// Record the outcome of `cell` in the entry map. If the outcome isn't
    /// memoized the entry is removed, so the next request fetches again.
    /// Entries that no longer hold `cell` are left alone.
    pub(crate) fn settle(
        &self,
        key: &Key,
        cell: &Arc<PendingCell<Value>>,
        outcome: Outcome<Value>,
        memoize: bool,
    ) {
        if memoize {
            if let Some(mut slot) = self.entries.get_mut(key) {
                if slot.holds(cell) {
                    *slot = Slot::Resolved(outcome);
                }
            }
        } else {
            self.entries.remove_if(key, |_, slot| slot.holds(cell));
        }
    }

    fn resolved(&self, key: &Key) -> Option<Outcome<Value>> {
        match self.entries.get(key)?.value() {
            Slot::Resolved(outcome) => Some(outcome.clone()),
            Slot::Pending(..) => None,
        }
    }

    fn prime(&self, key: Key, outcome: Outcome<Value>) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(..) => false,
            Entry::Vacant(entry) => {
                entry.insert(Slot::Resolved(outcome));
                true
            }
        }
    }

    fn clear(&self, key: &Key) -> bool {
        self.entries
            .remove_if(key, |_, slot| matches!(slot, Slot::Resolved(..)))
            .is_some()
    }

    fn counts(&self) -> (usize, usize) {
        self.entries
            .iter()
            .fold((0, 0), |(resolved, pending), slot| match slot.value() {
                Slot::Resolved(..) => (resolved + 1, pending),
                Slot::Pending(..) => (resolved, pending + 1),
            })
    }
}

/// The owner of cached entries for one resolution pass, or for longer when a
/// scope is shared between loaders.
///
/// A loader creates its own scope by default, which makes it request
/// scoped: drop the loader at the end of the pass and its entries go with
/// it. To share a cache across passes, create a scope explicitly, hand it to
/// each loader with [`Loader::with_scope`](crate::Loader::with_scope), and
/// either [`reset`](CacheScope::reset) it yourself or give it a time-to-live.
pub struct CacheScope<Key, Value> {
    current: ArcSwap<Generation<Key, Value>>,
    ttl: Option<Duration>,
}

impl<Key: Eq + Hash, Value: Clone> CacheScope<Key, Value> {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Generation::new()),
            ttl: None,
        }
    }

    /// Create a scope whose entries are replaced wholesale once `ttl` has
    /// passed since the current generation started. Expiry is checked when
    /// the scope is next accessed.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::new()
        }
    }

    #[inline]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Drop every entry by swapping in an empty generation. Fetches in flight
    /// still deliver to the futures already waiting on them, but their
    /// results are not visible through this scope afterwards.
    pub fn reset(&self) {
        self.current.store(Arc::new(Generation::new()));
    }

    /// The current generation, replacing it first if it has expired.
    pub(crate) fn generation(&self) -> Arc<Generation<Key, Value>> {
        if let Some(ttl) = self.ttl {
            self.current.rcu(|current| {
                if current.started.elapsed() >= ttl {
                    Arc::new(Generation::new())
                } else {
                    Arc::clone(current)
                }
            });
        }

        self.current.load_full()
    }

    /// Peek at a resolved outcome without triggering a fetch.
    pub fn get(&self, key: &Key) -> Option<Outcome<Value>> {
        self.generation().resolved(key)
    }

    /// Seed a resolved entry. Returns false, and changes nothing, if the key
    /// already has an entry.
    pub fn prime(&self, key: Key, outcome: Outcome<Value>) -> bool {
        self.generation().prime(key, outcome)
    }

    /// Forget a resolved entry. Pending entries can't be cleared; returns
    /// whether an entry was removed.
    pub fn clear(&self, key: &Key) -> bool {
        self.generation().clear(key)
    }

    /// Number of resolved entries.
    pub fn len(&self) -> usize {
        self.generation().counts().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries still waiting on a fetch.
    pub fn pending_len(&self) -> usize {
        self.generation().counts().1
    }
}

impl<Key: Eq + Hash, Value: Clone> Default for CacheScope<Key, Value> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Key: Eq + Hash, Value> Debug for CacheScope<Key, Value> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let generation = self.current.load();
        f.debug_struct("CacheScope")
            .field("entries", &generation.entries.len())
            .field("age", &generation.started.elapsed())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FetchError;
    use futures::task::{waker, ArcWake};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread::sleep,
    };

    #[test]
    fn register_creates_then_joins() {
        let scope: CacheScope<u32, String> = CacheScope::new();
        let generation = scope.generation();

        let cell = match generation.register(&1) {
            Registered::Created(cell) => cell,
            _ => panic!("first registration should create the entry"),
        };

        match generation.register(&1) {
            Registered::Joined(joined) => assert!(Arc::ptr_eq(&cell, &joined)),
            _ => panic!("second registration should join the pending entry"),
        }

        assert_eq!(scope.pending_len(), 1);
        assert!(scope.get(&1).is_none());

        assert!(cell.claim());
        assert!(!cell.claim());
        assert!(cell.complete(Outcome::Value("one".to_string())));
        generation.settle(&1, &cell, Outcome::Value("one".to_string()), true);

        assert_eq!(scope.get(&1), Some(Outcome::Value("one".to_string())));
        assert_eq!(scope.len(), 1);
        assert_eq!(scope.pending_len(), 0);

        match generation.register(&1) {
            Registered::Resolved(outcome) => assert_eq!(outcome, Outcome::Value("one".into())),
            _ => panic!("resolved entries answer without a new fetch"),
        }
    }

    #[test]
    fn unmemoized_outcomes_are_removed() {
        let scope: CacheScope<u32, u32> = CacheScope::new();
        let generation = scope.generation();

        let Registered::Created(cell) = generation.register(&7) else {
            panic!("expected a new entry");
        };

        let cancelled = Outcome::Error(FetchError::Cancelled);
        cell.complete(cancelled.clone());
        generation.settle(&7, &cell, cancelled, false);

        assert!(scope.is_empty());
        assert_eq!(scope.pending_len(), 0);
        assert!(matches!(generation.register(&7), Registered::Created(..)));
    }

    #[test]
    fn released_cells_can_be_claimed_again() {
        let scope: CacheScope<u32, u32> = CacheScope::new();
        let Registered::Created(cell) = scope.generation().register(&3) else {
            panic!("expected a new entry");
        };

        assert!(cell.claim());
        cell.release();
        assert!(cell.claim());

        assert!(cell.complete(Outcome::Absent));
        assert!(!cell.complete(Outcome::Value(3)));
        cell.release();
        assert!(!cell.claim());
    }

    #[derive(Default)]
    struct WakeCount(AtomicUsize);

    impl ArcWake for WakeCount {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_wakes_waiters_and_keeps_them_registered() {
        let scope: CacheScope<u32, u32> = CacheScope::new();
        let Registered::Created(cell) = scope.generation().register(&9) else {
            panic!("expected a new entry");
        };

        let count = Arc::new(WakeCount::default());
        let _token = cell.lock().wakers.add_waker(waker(Arc::clone(&count)));

        assert!(cell.claim());
        cell.release();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert_eq!(cell.lock().wakers.len(), 1);

        // Releasing a resolved cell wakes nobody
        assert!(cell.claim());
        assert!(cell.complete(Outcome::Value(9)));
        assert_eq!(count.0.load(Ordering::SeqCst), 2);
        cell.release();
        assert_eq!(count.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prime_and_clear() {
        let scope: CacheScope<&str, u32> = CacheScope::default();

        assert!(scope.prime("lot-1", Outcome::Value(5)));
        assert!(!scope.prime("lot-1", Outcome::Value(6)));
        assert_eq!(scope.get(&"lot-1"), Some(Outcome::Value(5)));

        assert!(scope.clear(&"lot-1"));
        assert!(!scope.clear(&"lot-1"));
        assert!(scope.get(&"lot-1").is_none());
    }

    #[test]
    fn pending_entries_are_not_cleared() {
        let scope: CacheScope<u32, u32> = CacheScope::new();
        let _registered = scope.generation().register(&1);

        assert!(!scope.clear(&1));
        assert_eq!(scope.pending_len(), 1);
    }

    #[test]
    fn reset_replaces_the_generation() {
        let scope: CacheScope<u32, u32> = CacheScope::new();
        scope.prime(1, Outcome::Value(1));

        let before = scope.generation();
        scope.reset();

        assert!(scope.get(&1).is_none());
        assert!(!Arc::ptr_eq(&before, &scope.generation()));

        // The old generation is untouched
        assert_eq!(before.resolved(&1), Some(Outcome::Value(1)));
    }

    #[test]
    fn ttl_expires_the_generation() {
        let scope: CacheScope<u32, u32> = CacheScope::with_ttl(Duration::from_millis(20));
        scope.prime(1, Outcome::Value(1));
        assert_eq!(scope.get(&1), Some(Outcome::Value(1)));

        sleep(Duration::from_millis(40));
        assert!(scope.get(&1).is_none());
        assert!(scope.prime(1, Outcome::Value(2)));
        assert_eq!(scope.get(&1), Some(Outcome::Value(2)));
    }
}
