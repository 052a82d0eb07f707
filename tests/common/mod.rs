//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use batchfetch::{
    CancellationToken, ErrorDescriptor, Fetcher, GroupedLoader, KeyedEntry, Loader, LoaderConfig,
};
use cooked_waker::{IntoWaker, ViaRawPointer, Wake, WakeRef};
use futures::{future, FutureExt};
use futures_timer::Delay;
use std::{
    future::Future,
    num::NonZeroUsize,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Once,
    },
    task::{Context, Poll, Waker},
    time::Duration,
};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test-writer subscriber if RUST_LOG is set.
pub fn init_tracing() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        }
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: u32,
    pub value: Option<String>,
}

impl KeyedEntry<u32> for Entry {
    type Value = String;

    fn entry_key(&self) -> &u32 {
        &self.id
    }

    fn entry_value(&self) -> Option<String> {
        self.value.clone()
    }
}

/// A fake downstream service whose behavior is picked by the call's
/// parameters:
///
/// - `"down"` fails with a 503
/// - `"empty"` reports no content
/// - `"broken"` returns every item with a null value
/// - `"panic"` panics
/// - `"stuck"` never completes
/// - `"paged"` accepts at most 2 ids per call
/// - anything else returns `"{params}:{id}"` for every id below 1000
///
/// Every call is recorded before it does anything else. A call then waits
/// out `delay`, and returns pending `skips` times, before answering.
#[derive(Debug, Default)]
pub struct Catalog {
    calls: Mutex<Vec<(&'static str, Vec<u32>)>>,
    pub delay: Option<Duration>,
    pub skips: usize,
}

impl Catalog {
    pub fn with_delay(delay: Duration) -> Self {
        Catalog {
            delay: Some(delay),
            ..Catalog::default()
        }
    }

    pub fn with_skips(skips: usize) -> Self {
        Catalog {
            skips,
            ..Catalog::default()
        }
    }

    pub fn calls(&self) -> Vec<(&'static str, Vec<u32>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Fetcher for Catalog {
    type Params = &'static str;
    type ItemKey = u32;
    type Item = Entry;

    fn batch_limit(&self, params: &&'static str) -> Option<NonZeroUsize> {
        match *params {
            "paged" => NonZeroUsize::new(2),
            _ => None,
        }
    }

    async fn fetch_batch(
        &self,
        params: &&'static str,
        ids: &[u32],
        _cancel: &CancellationToken,
    ) -> Result<Vec<Entry>, ErrorDescriptor> {
        self.calls.lock().unwrap().push((*params, ids.to_vec()));

        if let Some(delay) = self.delay {
            Delay::new(delay).await;
        }
        Skipper::new(self.skips).await;

        match *params {
            "down" => Err(ErrorDescriptor::failure(503, "catalog unavailable")),
            "empty" => Err(ErrorDescriptor::no_content()),
            "panic" => panic!("catalog client bug"),
            "stuck" => future::pending().await,
            "broken" => Ok(ids.iter().map(|&id| Entry { id, value: None }).collect()),
            params => Ok(ids
                .iter()
                .filter(|&&id| id < 1000)
                .map(|&id| Entry {
                    id,
                    value: Some(format!("{}:{}", params, id)),
                })
                .collect()),
        }
    }
}

pub type CatalogKey = (&'static str, u32);
pub type CatalogLoader = Loader<GroupedLoader<Catalog, CatalogKey>>;

pub fn catalog_loader() -> CatalogLoader {
    init_tracing();
    Loader::grouped(Catalog::default())
}

pub fn catalog_loader_with(catalog: Catalog, config: LoaderConfig) -> CatalogLoader {
    init_tracing();
    Loader::with_config(GroupedLoader::new(catalog), config)
}

/// A waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

unsafe impl ViaRawPointer for NoOpWaker {
    type Target = ();

    fn into_raw(self) -> *mut () {
        std::ptr::null_mut()
    }

    unsafe fn from_raw(_ptr: *mut ()) -> Self {
        NoOpWaker
    }
}

/// A waker that stores true if it has been awoken
#[derive(Debug, Clone, Default)]
pub struct BoolWaker {
    cell: Arc<AtomicBool>,
}

impl BoolWaker {
    pub fn reset(&self) {
        self.cell.store(false, Ordering::SeqCst)
    }

    pub fn is_signaled(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }
}

impl WakeRef for BoolWaker {
    fn wake_by_ref(&self) {
        self.cell.store(true, Ordering::SeqCst)
    }
}

impl Wake for BoolWaker {}

unsafe impl ViaRawPointer for BoolWaker {
    type Target = AtomicBool;

    fn into_raw(self) -> *mut AtomicBool {
        Arc::into_raw(self.cell) as *mut AtomicBool
    }

    unsafe fn from_raw(ptr: *mut AtomicBool) -> Self {
        BoolWaker {
            cell: Arc::from_raw(ptr as *const AtomicBool),
        }
    }
}

/// A future that returns pending the first N times it is polled, then
/// returns Ready. It wakes its task every time it returns pending.
#[derive(Debug, Clone)]
pub struct Skipper {
    remaining_skips: usize,
}

impl Skipper {
    pub fn new(count: usize) -> Self {
        Skipper {
            remaining_skips: count,
        }
    }
}

impl Future for Skipper {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.get_mut().remaining_skips {
            0 => Poll::Ready(()),
            skips => {
                *skips -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// A manually polled future, with a waker that records whether it was
/// signaled since the last poll.
pub struct Task<F: Future + Unpin> {
    pub fut: F,
    signal: BoolWaker,
    waker: Waker,
}

impl<F: Future + Unpin> Task<F> {
    pub fn new(fut: F) -> Self {
        let signal = BoolWaker::default();

        Task {
            fut,
            waker: signal.clone().into_waker(),
            signal,
        }
    }

    pub fn poll(&mut self) -> Poll<F::Output> {
        self.signal.reset();
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    pub fn is_signaled(&self) -> bool {
        self.signal.is_signaled()
    }
}
