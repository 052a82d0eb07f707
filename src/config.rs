use std::{num::NonZeroUsize, time::Duration};

use crate::execute::ExecLimits;

/// A set of configuration rules for a [`Loader`](crate::Loader).
///
/// - `window` is the duration [`load`](crate::Loader::load) waits before
///   flushing, during which other requests can come in and join the same
///   fetch cycle. With no window, `load` yields once to the executor, which
///   is enough to collect every request issued in the same scheduling tick
///   (for instance, all the futures in one `join_all`).
/// - `max_keys` is an optional maximum number of queued keys. Once the queue
///   reaches it, the next `load` flushes immediately instead of waiting out
///   the window.
/// - `max_concurrency` caps how many group calls of one cycle are in
///   flight at once.
/// - `fetch_timeout` is a deadline for each group call; a call past it fails
///   that group with a timeout.
/// - `memoize_errors` controls whether downstream and malformed-response
///   errors are cached for the rest of the scope. Cancellations are never
///   cached.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct LoaderConfig {
    pub window: Option<Duration>,
    pub max_keys: Option<NonZeroUsize>,
    pub max_concurrency: Option<NonZeroUsize>,
    pub fetch_timeout: Option<Duration>,
    pub memoize_errors: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            window: None,
            max_keys: None,
            max_concurrency: None,
            fetch_timeout: None,
            memoize_errors: true,
        }
    }
}

impl LoaderConfig {
    pub(crate) fn exec_limits(&self) -> ExecLimits {
        ExecLimits {
            max_concurrency: self.max_concurrency,
            fetch_timeout: self.fetch_timeout,
        }
    }

    /// Whether a queue of `len` keys should be flushed without waiting.
    pub(crate) fn is_full(&self, len: usize) -> bool {
        matches!(self.max_keys, Some(max) if len >= max.get())
    }
}
