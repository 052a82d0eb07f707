use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use futures::{
    future::{self, poll_fn, Either},
    pin_mut,
};
use futures_timer::Delay;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{
    cache::{CacheScope, Generation, PendingCell, Registered},
    config::LoaderConfig,
    distribute::distribute,
    execute::execute,
    fetch::BatchLoad,
    group::{group, BatchGroup},
    outcome::{FetchError, Outcome},
    wakerset::Token as WakerToken,
};

/// A key with a pending entry, plus everything needed to resolve it.
pub(crate) struct Ticket<Key, Value> {
    key: Key,
    cell: Arc<PendingCell<Value>>,
    generation: Arc<Generation<Key, Value>>,
}

impl<Key: Clone, Value> Clone for Ticket<Key, Value> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            cell: Arc::clone(&self.cell),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<Key: Eq + Hash, Value: Clone> Ticket<Key, Value> {
    /// Settle the entry in its generation, then hand the outcome to every
    /// waiter.
    fn resolve(&self, outcome: Outcome<Value>, memoize: bool) {
        self.generation
            .settle(&self.key, &self.cell, outcome.clone(), memoize);
        self.cell.complete(outcome);
    }

    /// Resolve the key as cancelled, unless a fetch cycle has already
    /// claimed it, in which case that cycle resolves it.
    fn cancel(&self) {
        if self.cell.claim() {
            self.resolve(Outcome::Error(FetchError::Cancelled), false);
        }
    }
}

/// The keys claimed by one fetch cycle. If the cycle is dropped before it
/// resolves them (because the future driving it was dropped), the claims
/// are released and every waiter on those keys is woken, so that one of
/// them can claim the keys and drive a new fetch.
struct Cycle<Key, Value> {
    tickets: Vec<Ticket<Key, Value>>,
}

impl<Key, Value> Drop for Cycle<Key, Value> {
    fn drop(&mut self) {
        if !self.tickets.is_empty() {
            tracing::debug!(
                keys = self.tickets.len(),
                "fetch cycle dropped before completion, releasing its keys"
            );
            self.tickets.iter().for_each(|ticket| ticket.cell.release());
        }
    }
}

/// Summary of one fetch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Distinct keys dispatched.
    pub keys: usize,
    /// Downstream calls issued.
    pub groups: usize,
    /// Calls that failed, including timeouts and panics. "No content" counts
    /// as a failed call here even though its keys resolve as absent.
    pub failed_groups: usize,
    pub cancelled_groups: usize,
}

/// A loader is the entry point for loading keys. It owns a batching strategy
/// (a [`BatchLoad`]), a [`CacheScope`], a queue of keys waiting for the next
/// fetch cycle, and the cancellation token for its resolution pass.
///
/// Each time you call [`Loader::load`], the key is looked up in the scope:
///
/// - a resolved key returns immediately;
/// - a pending key attaches to the fetch already on its way;
/// - a new key is queued, and after the configured window the queue is
///   flushed as one fetch cycle.
///
/// A loader can be shared by reference between many concurrent tasks (even
/// on different threads). No background tasks are spawned; the future that
/// flushes a cycle drives it to completion.
pub struct Loader<L: BatchLoad> {
    batcher: L,
    config: LoaderConfig,
    scope: Arc<CacheScope<L::Key, L::Value>>,
    queue: Mutex<Vec<Ticket<L::Key, L::Value>>>,
    cancel: CancellationToken,
}

impl<L: BatchLoad> Loader<L> {
    pub fn new(batcher: L) -> Self {
        Self::with_config(batcher, LoaderConfig::default())
    }

    pub fn with_config(batcher: L, config: LoaderConfig) -> Self {
        Self {
            batcher,
            config,
            scope: Arc::new(CacheScope::new()),
            queue: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Use a shared cache scope instead of this loader's private one.
    pub fn with_scope(mut self, scope: Arc<CacheScope<L::Key, L::Value>>) -> Self {
        self.scope = scope;
        self
    }

    /// Tie this loader to the cancellation token of its resolution pass.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[inline]
    pub fn batcher(&self) -> &L {
        &self.batcher
    }

    #[inline]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    #[inline]
    pub fn scope(&self) -> &Arc<CacheScope<L::Key, L::Value>> {
        &self.scope
    }

    #[inline]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Number of keys waiting for the next flush.
    pub fn queued_len(&self) -> usize {
        self.lock_queue().len()
    }

    fn lock_queue(&self) -> MutexGuard<'_, Vec<Ticket<L::Key, L::Value>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look the key up in the scope, queueing it if it is new. Also reports
    /// whether the queue has reached `max_keys`.
    fn register(&self, key: L::Key) -> (LoadFuture<L::Key, L::Value>, bool) {
        if self.cancel.is_cancelled() {
            self.drain_cancelled();
            return (
                LoadFuture::ready(Outcome::Error(FetchError::Cancelled)),
                false,
            );
        }

        let generation = self.scope.generation();

        match generation.register(&key) {
            Registered::Resolved(outcome) => (LoadFuture::ready(outcome), false),
            Registered::Joined(cell) => {
                let ticket = Ticket {
                    key,
                    cell,
                    generation,
                };
                let full = self.config.is_full(self.lock_queue().len());
                (LoadFuture::waiting(ticket, self.cancel.clone()), full)
            }
            Registered::Created(cell) => {
                let ticket = Ticket {
                    key,
                    cell,
                    generation,
                };

                let mut queue = self.lock_queue();
                queue.push(ticket.clone());
                let full = self.config.is_full(queue.len());
                drop(queue);

                (LoadFuture::waiting(ticket, self.cancel.clone()), full)
            }
        }
    }

    /// Register interest in a key without dispatching anything. The returned
    /// future completes once some flush (yours, or a concurrent `load`'s)
    /// resolves the key.
    pub fn enqueue(&self, key: L::Key) -> LoadFuture<L::Key, L::Value> {
        self.register(key).0
    }

    /// Load a single key. Concurrent loads within the batching window share
    /// one fetch cycle, and concurrent loads of the same key share one fetch.
    pub async fn load(&self, key: L::Key) -> Outcome<L::Value> {
        let (mut waiter, full) = self.register(key);

        if waiter.is_pending() {
            if !full {
                // Another flush may resolve the key before the window ends
                let window = self.window();
                pin_mut!(window);

                if let Either::Right((outcome, _window)) =
                    future::select(window, &mut waiter).await
                {
                    return outcome;
                }
            }
            let mut tickets = self.take_queue();
            tickets.extend(waiter.unclaimed());
            self.run_cycle(tickets).await;
        }

        self.settle(waiter).await
    }

    /// Load many keys at once. New keys are flushed immediately, without
    /// waiting for the window, in one cycle together with any requested key
    /// that is pending but unclaimed. The result has exactly one entry per
    /// distinct requested key.
    pub async fn load_many<I>(&self, keys: I) -> HashMap<L::Key, Outcome<L::Value>>
    where
        I: IntoIterator<Item = L::Key>,
    {
        let waiters: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let (waiter, _full) = self.register(key.clone());
                (key, waiter)
            })
            .collect();

        if waiters.iter().any(|(_key, waiter)| waiter.is_pending()) {
            let mut tickets = self.take_queue();
            tickets.extend(waiters.iter().filter_map(|(_key, waiter)| waiter.unclaimed()));
            self.run_cycle(tickets).await;
        }

        future::join_all(
            waiters
                .into_iter()
                .map(|(key, waiter)| async move { (key, self.settle(waiter).await) }),
        )
        .await
        .into_iter()
        .collect()
    }

    /// Run one fetch cycle over every queued key. Flushing an empty queue is
    /// a no-op.
    pub async fn flush(&self) -> FlushReport {
        let tickets = self.take_queue();
        self.run_cycle(tickets).await
    }

    fn take_queue(&self) -> Vec<Ticket<L::Key, L::Value>> {
        mem::take(&mut *self.lock_queue())
    }

    /// Seed the scope with an outcome for `key`. Returns false if the key
    /// already has an entry.
    pub fn prime(&self, key: L::Key, outcome: Outcome<L::Value>) -> bool {
        self.scope.prime(key, outcome)
    }

    /// Forget a resolved key so the next load fetches it again.
    pub fn clear(&self, key: &L::Key) -> bool {
        self.scope.clear(key)
    }

    /// Cancel this loader's resolution pass. In-flight fetches are aborted
    /// and their keys, along with every queued key, resolve as cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.drain_cancelled();
    }

    /// Resolve every queued key as cancelled. The token may have been
    /// cancelled from outside, so later calls pick up whatever is left.
    fn drain_cancelled(&self) {
        let tickets = self.take_queue();
        if tickets.is_empty() {
            return;
        }

        tracing::debug!(queued = tickets.len(), "resolving queued keys as cancelled");
        for ticket in tickets {
            ticket.cancel();
        }
    }

    async fn window(&self) {
        match self.config.window {
            Some(window) => Delay::new(window).await,
            None => YieldNow::default().await,
        }
    }

    /// Wait for a key's outcome. If the key turns out to be unclaimed (its
    /// driver was dropped, or it was queued by another loader sharing this
    /// scope) this future claims it and drives the fetch itself.
    async fn settle(&self, mut waiter: LoadFuture<L::Key, L::Value>) -> Outcome<L::Value> {
        loop {
            match poll_fn(|cx| waiter.poll_settle(cx, true)).await {
                Settled::Resolved(outcome) => return outcome,
                Settled::Unclaimed(ticket) => {
                    tracing::trace!(key = ?ticket.key, "claiming unclaimed key");
                    self.run_cycle(vec![ticket]).await;
                }
            }
        }
    }

    async fn run_cycle(&self, tickets: Vec<Ticket<L::Key, L::Value>>) -> FlushReport {
        let mut cycle = Cycle {
            tickets: tickets
                .into_iter()
                .filter(|ticket| ticket.cell.claim())
                .collect(),
        };

        if cycle.tickets.is_empty() {
            return FlushReport::default();
        }

        let groups = group(
            &self.batcher,
            cycle.tickets.iter().map(|ticket| ticket.key.clone()),
        );

        let mut report = FlushReport {
            keys: groups.iter().map(BatchGroup::len).sum(),
            groups: groups.len(),
            ..FlushReport::default()
        };

        tracing::debug!(
            keys = report.keys,
            groups = report.groups,
            "dispatching fetch cycle"
        );

        let executed = execute(
            &self.batcher,
            groups,
            &self.cancel,
            self.config.exec_limits(),
        )
        .await;

        for (_group, raw) in &executed {
            if raw.is_failed() {
                report.failed_groups += 1;
            } else if raw.is_cancelled() {
                report.cancelled_groups += 1;
            }
        }

        let outcomes = distribute(&self.batcher, executed);

        for ticket in mem::take(&mut cycle.tickets) {
            let outcome = match outcomes.get(&ticket.key) {
                Some(outcome) => outcome.clone(),
                None => {
                    tracing::error!(key = ?ticket.key, "no outcome was distributed for key");
                    Outcome::Error(FetchError::malformed(
                        "no outcome was distributed for this key",
                    ))
                }
            };

            let memoize = outcome.is_memoizable(self.config.memoize_errors);
            ticket.resolve(outcome, memoize);
        }

        tracing::debug!(
            keys = report.keys,
            failed_groups = report.failed_groups,
            cancelled_groups = report.cancelled_groups,
            "fetch cycle complete"
        );

        report
    }
}

impl<L: BatchLoad> Debug for Loader<L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("batcher", &"<batcher>")
            .field("config", &self.config)
            .field("scope", &self.scope)
            .field("queued", &self.queued_len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

pub(crate) enum Settled<Key, Value> {
    Resolved(Outcome<Value>),
    Unclaimed(Ticket<Key, Value>),
}

/// A request for a single key. It completes with the key's outcome once the
/// fetch cycle that claimed the key resolves it, or immediately if the key
/// was already resolved in the loader's scope.
///
/// Dropping a `LoadFuture` withdraws its interest, but doesn't remove the
/// key from the fetch it is part of.
pub struct LoadFuture<Key, Value> {
    ready: Option<Outcome<Value>>,
    ticket: Option<Ticket<Key, Value>>,
    waker_token: Option<WakerToken>,
    cancel: Option<CancellationToken>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

// Nothing in a LoadFuture is structurally pinned.
impl<Key, Value> Unpin for LoadFuture<Key, Value> {}

impl<Key: Clone + Eq + Hash, Value: Clone> LoadFuture<Key, Value> {
    fn ready(outcome: Outcome<Value>) -> Self {
        Self {
            ready: Some(outcome),
            ticket: None,
            waker_token: None,
            cancel: None,
            cancelled: None,
        }
    }

    fn waiting(ticket: Ticket<Key, Value>, cancel: CancellationToken) -> Self {
        Self {
            ready: None,
            ticket: Some(ticket),
            waker_token: None,
            cancel: Some(cancel),
            cancelled: None,
        }
    }

    /// Whether this future is still waiting on a fetch. False for keys that
    /// were already resolved when requested, and for completed futures.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.ticket.is_some()
    }

    /// This future's ticket, if its key is pending and no fetch cycle has
    /// claimed it.
    fn unclaimed(&self) -> Option<Ticket<Key, Value>> {
        let ticket = self.ticket.as_ref()?;
        let state = ticket.cell.lock();
        let unclaimed = !state.dispatched && state.outcome.is_none();
        drop(state);

        unclaimed.then(|| ticket.clone())
    }

    /// The key this future waits on, while it is pending.
    pub fn key(&self) -> Option<&Key> {
        self.ticket.as_ref().map(|ticket| &ticket.key)
    }

    fn poll_cancelled(&mut self, ctx: &mut Context<'_>) -> bool {
        let cancel = match self.cancel.as_ref() {
            Some(cancel) => cancel,
            None => return false,
        };

        if cancel.is_cancelled() {
            return true;
        }

        self.cancelled
            .get_or_insert_with(|| Box::pin(cancel.clone().cancelled_owned()))
            .as_mut()
            .poll(ctx)
            .is_ready()
    }

    /// Poll the key's entry. With `claim` set, an entry that no fetch cycle
    /// has claimed is reported as `Unclaimed` so the caller can drive it;
    /// without it, such an entry just keeps waiting.
    pub(crate) fn poll_settle(
        &mut self,
        ctx: &mut Context<'_>,
        claim: bool,
    ) -> Poll<Settled<Key, Value>> {
        if let Some(outcome) = self.ready.take() {
            return Poll::Ready(Settled::Resolved(outcome));
        }

        let ticket = match self.ticket.take() {
            Some(ticket) => ticket,
            None => panic!("LoadFuture polled after completion"),
        };

        let mut state = ticket.cell.lock();

        if let Some(outcome) = state.outcome.clone() {
            if let Some(token) = self.waker_token.take() {
                state.wakers.discard_waker(token);
            }
            return Poll::Ready(Settled::Resolved(outcome));
        }

        match self.waker_token.as_ref() {
            Some(token) => state.wakers.replace_waker(token, ctx.waker()),
            None => self.waker_token = Some(state.wakers.add_waker(ctx.waker().clone())),
        }

        let dispatched = state.dispatched;
        drop(state);

        if self.poll_cancelled(ctx) {
            if let Some(token) = self.waker_token.take() {
                ticket.cell.lock().wakers.discard_waker(token);
            }
            // Resolve the entry too, so other waiters on it don't hang
            ticket.cancel();
            return Poll::Ready(Settled::Resolved(Outcome::Error(FetchError::Cancelled)));
        }

        if claim && !dispatched {
            let unclaimed = ticket.clone();
            self.ticket = Some(ticket);
            return Poll::Ready(Settled::Unclaimed(unclaimed));
        }

        self.ticket = Some(ticket);
        Poll::Pending
    }
}

impl<Key: Clone + Eq + Hash, Value: Clone> Future for LoadFuture<Key, Value> {
    type Output = Outcome<Value>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().poll_settle(ctx, false) {
            Poll::Ready(Settled::Resolved(outcome)) => Poll::Ready(outcome),
            // Without `claim`, poll_settle never reports Unclaimed; the waker
            // is registered either way.
            Poll::Ready(Settled::Unclaimed(..)) | Poll::Pending => Poll::Pending,
        }
    }
}

impl<Key, Value> Drop for LoadFuture<Key, Value> {
    fn drop(&mut self) {
        // Deregister from the entry's WakerSet. Other waiters are unaffected;
        // the fetch itself is owned by whichever cycle claimed the key.
        if let (Some(ticket), Some(token)) = (self.ticket.as_ref(), self.waker_token.take()) {
            ticket.cell.lock().wakers.discard_waker(token);
        }
    }
}

impl<Key: Debug, Value> Debug for LoadFuture<Key, Value> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadFuture")
            .field("key", &self.ticket.as_ref().map(|ticket| &ticket.key))
            .field("ready", &self.ready.is_some())
            .field("cell", &self.ticket.as_ref().map(|ticket| &ticket.cell))
            .finish()
    }
}

/// Yields to the executor exactly once.
#[derive(Debug, Default)]
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            ctx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
