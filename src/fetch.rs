//! The contracts this crate consumes from downstream services, and the
//! contract a loader implements to plug a downstream call into the batch
//! pipeline.

use std::{
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    hash::Hash,
    num::NonZeroUsize,
};

use tokio_util::sync::CancellationToken;

use crate::group::BatchGroup;

/// Status classification attached to a downstream error. The only
/// distinction this crate acts on is "no content" versus everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The downstream service had nothing for the request. This is not a
    /// failure; keys resolve as absent.
    NoContent,
    /// The downstream call (or the fetcher's own deadline) timed out.
    Timeout,
    /// A protocol status code, usually HTTP.
    Code(u16),
    /// A failure with no useful status, such as a transport error.
    Other,
}

impl Status {
    /// Classify an HTTP status code.
    pub fn from_http(code: u16) -> Self {
        match code {
            204 => Status::NoContent,
            408 | 504 => Status::Timeout,
            code => Status::Code(code),
        }
    }

    #[inline]
    pub fn is_no_content(&self) -> bool {
        matches!(self, Status::NoContent)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Status::NoContent => f.write_str("no content"),
            Status::Timeout => f.write_str("timeout"),
            Status::Code(code) => write!(f, "status {}", code),
            Status::Other => f.write_str("error"),
        }
    }
}

/// A batch-level error reported by a downstream call. It applies to every
/// key in the batch that produced it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Hash)]
#[error("{status}: {message}")]
pub struct ErrorDescriptor {
    pub status: Status,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn no_content() -> Self {
        Self::new(Status::NoContent, "no content")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Status::Timeout, message)
    }

    pub fn failure(code: u16, message: impl Into<String>) -> Self {
        Self::new(Status::from_http(code), message)
    }

    #[inline]
    pub fn is_no_content(&self) -> bool {
        self.status.is_no_content()
    }
}

/// An item in a downstream response that can be paired back to the item key
/// that requested it.
///
/// `entry_value` returns `None` when the item is present but has no usable
/// value (a null where one was expected). The distributor reports that as a
/// malformed response for the matching key, never as absence.
pub trait KeyedEntry<Id: ?Sized> {
    type Value;

    fn entry_key(&self) -> &Id;

    fn entry_value(&self) -> Option<Self::Value>;
}

/// A downstream service that accepts one set of call parameters plus a list
/// of item keys, and returns the items it found.
///
/// Methods use RPITIT (`-> impl Future + Send`), so implementations can be
/// written as plain `async fn`.
pub trait Fetcher: Send + Sync + 'static {
    /// The parameters one downstream call is made with. Keys sharing
    /// parameters are batched into the same call.
    type Params: Clone + Ord + Hash + Debug + Send + Sync + 'static;

    /// Identifies one item within a call.
    type ItemKey: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    type Item: KeyedEntry<Self::ItemKey> + Send + Sync + 'static;

    /// Maximum number of item keys one call with these parameters accepts.
    fn batch_limit(&self, _params: &Self::Params) -> Option<NonZeroUsize> {
        None
    }

    fn fetch_batch(
        &self,
        params: &Self::Params,
        item_keys: &[Self::ItemKey],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Self::Item>, ErrorDescriptor>> + Send;
}

/// The result of looking up one key in a successful downstream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located<T> {
    /// A well-formed item matched the key.
    Found(T),
    /// The payload legitimately contains nothing for the key.
    Missing,
    /// An item matched the key but was structurally invalid.
    Malformed(String),
}

impl<T> Located<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Located<U> {
        match self {
            Located::Found(value) => Located::Found(f(value)),
            Located::Missing => Located::Missing,
            Located::Malformed(reason) => Located::Malformed(reason),
        }
    }
}

/// A complete batching strategy: how keys are grouped, how one group is
/// fetched, and how a group's payload is split back into per-key values.
///
/// This is the seam every loader variant in this crate implements. The
/// pipeline calls `group_of` on each key to build groups, `fetch` once per
/// group (concurrently), then `locate` once per key against its group's
/// payload.
pub trait BatchLoad: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Projection of a key onto the parameters its downstream call is made
    /// with.
    type Group: Clone + Ord + Hash + Debug + Send + Sync + 'static;

    /// The raw response of one group's downstream call.
    type Payload: Send + Sync + 'static;

    type Value: Clone + Send + Sync + 'static;

    fn group_of(&self, key: &Self::Key) -> Self::Group;

    /// Maximum number of keys one call for `group` may carry. Larger groups
    /// are split into ordered sub-batches.
    fn batch_limit(&self, _group: &Self::Group) -> Option<NonZeroUsize> {
        None
    }

    fn fetch(
        &self,
        batch: &BatchGroup<Self::Group, Self::Key>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Self::Payload, ErrorDescriptor>> + Send;

    fn locate(&self, key: &Self::Key, payload: &Self::Payload) -> Located<Self::Value>;
}
