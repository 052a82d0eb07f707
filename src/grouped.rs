//! The general loader: composite keys grouped by their call parameters, one
//! [`Fetcher`] call per group.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    num::NonZeroUsize,
};

use tokio_util::sync::CancellationToken;

use crate::{
    fetch::{BatchLoad, ErrorDescriptor, Fetcher, KeyedEntry, Located},
    group::BatchGroup,
    key::CompositeKey,
    loader::Loader,
};

type EntryValue<F> = <<F as Fetcher>::Item as KeyedEntry<<F as Fetcher>::ItemKey>>::Value;

/// A [`BatchLoad`] over keys of type `K`, which project onto the fetcher's
/// call parameters and item keys.
///
/// Items in a response are matched back to keys by their
/// [`entry_key`](KeyedEntry::entry_key). If a response carries the same item
/// twice, the first one wins. An item with no value is malformed; a key
/// with no matching item is absent.
pub struct GroupedLoader<F, K> {
    fetcher: F,
    key: PhantomData<fn() -> K>,
}

impl<F, K> GroupedLoader<F, K> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            key: PhantomData,
        }
    }

    #[inline]
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }
}

impl<F: Debug, K> Debug for GroupedLoader<F, K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupedLoader")
            .field("fetcher", &self.fetcher)
            .finish()
    }
}

impl<F, K> BatchLoad for GroupedLoader<F, K>
where
    F: Fetcher,
    K: CompositeKey<Group = F::Params, Item = F::ItemKey>,
    EntryValue<F>: Clone + Send + Sync + 'static,
{
    type Key = K;
    type Group = F::Params;
    type Payload = HashMap<F::ItemKey, F::Item>;
    type Value = EntryValue<F>;

    fn group_of(&self, key: &K) -> F::Params {
        key.group()
    }

    fn batch_limit(&self, params: &F::Params) -> Option<NonZeroUsize> {
        self.fetcher.batch_limit(params)
    }

    async fn fetch(
        &self,
        batch: &BatchGroup<F::Params, K>,
        cancel: &CancellationToken,
    ) -> Result<Self::Payload, ErrorDescriptor> {
        let item_keys = batch.collect(|key| key.item());
        let items = self
            .fetcher
            .fetch_batch(batch.params(), &item_keys, cancel)
            .await?;

        let mut payload = HashMap::with_capacity(items.len());

        for item in items {
            match payload.entry(item.entry_key().clone()) {
                Entry::Occupied(entry) => tracing::warn!(
                    params = ?batch.params(),
                    item = ?entry.key(),
                    "duplicate item in downstream response, keeping the first"
                ),
                Entry::Vacant(entry) => {
                    entry.insert(item);
                }
            }
        }

        Ok(payload)
    }

    fn locate(&self, key: &K, payload: &Self::Payload) -> Located<Self::Value> {
        let item_key = key.item();

        match payload.get(&item_key) {
            None => Located::Missing,
            Some(item) => match item.entry_value() {
                Some(value) => Located::Found(value),
                None => Located::Malformed(format!("item {:?} has no value", item_key)),
            },
        }
    }
}

impl<F, K> Loader<GroupedLoader<F, K>>
where
    F: Fetcher,
    K: CompositeKey<Group = F::Params, Item = F::ItemKey>,
    EntryValue<F>: Clone + Send + Sync + 'static,
{
    /// Create a loader that batches keys per call parameters.
    pub fn grouped(fetcher: F) -> Self {
        Loader::new(GroupedLoader::new(fetcher))
    }
}
