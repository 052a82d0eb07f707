//! Loading keys that a downstream service can only fetch one at a time.
//!
//! A [`SingleLoad`] still benefits from the loader: concurrent requests for
//! the same key are coalesced into one call, every call in a cycle runs
//! concurrently, and outcomes are cached in the loader's scope.

use std::{fmt::Debug, future::Future, hash::Hash, num::NonZeroUsize};

use tokio_util::sync::CancellationToken;

use crate::{
    fetch::{BatchLoad, ErrorDescriptor, Located},
    group::BatchGroup,
    loader::Loader,
};

pub trait SingleLoad: Send + Sync + 'static {
    type Key: Clone + Ord + Hash + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    fn fetch_one(
        &self,
        key: &Self::Key,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Located<Self::Value>, ErrorDescriptor>> + Send;
}

/// Adapts a [`SingleLoad`] into a [`BatchLoad`] whose every group is a
/// single key.
#[derive(Debug, Clone, Default)]
pub struct PerKey<S>(pub S);

impl<S: SingleLoad> BatchLoad for PerKey<S> {
    type Key = S::Key;
    type Group = S::Key;
    type Payload = Located<S::Value>;
    type Value = S::Value;

    fn group_of(&self, key: &S::Key) -> S::Key {
        key.clone()
    }

    fn batch_limit(&self, _group: &S::Key) -> Option<NonZeroUsize> {
        Some(NonZeroUsize::MIN)
    }

    async fn fetch(
        &self,
        batch: &BatchGroup<S::Key, S::Key>,
        cancel: &CancellationToken,
    ) -> Result<Located<S::Value>, ErrorDescriptor> {
        self.0.fetch_one(batch.params(), cancel).await
    }

    fn locate(&self, _key: &S::Key, payload: &Located<S::Value>) -> Located<S::Value> {
        payload.clone()
    }
}

impl<S: SingleLoad> Loader<PerKey<S>> {
    /// Create a loader that fetches each key with its own call.
    pub fn single(source: S) -> Self {
        Loader::new(PerKey(source))
    }
}
