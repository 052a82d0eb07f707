//! Partitioning keys into batches that each map to one downstream call.

use std::{
    collections::{BTreeMap, HashSet},
    hash::Hash,
    num::NonZeroUsize,
};

use crate::{data::KeySet, fetch::BatchLoad};

/// A set of keys that share one set of downstream call parameters. The
/// `ordinal` distinguishes the sub-batches of a group that had to be split
/// to respect a batch limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchGroup<Group, Key> {
    params: Group,
    ordinal: usize,
    keys: KeySet<Key>,
}

impl<Group, Key> BatchGroup<Group, Key> {
    pub fn new(params: Group, ordinal: usize, keys: KeySet<Key>) -> Self {
        Self {
            params,
            ordinal,
            keys,
        }
    }

    /// The parameters the downstream call for this batch is made with.
    #[inline]
    pub fn params(&self) -> &Group {
        &self.params
    }

    #[inline]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    #[inline]
    pub fn keys(&self) -> &[Key] {
        self.keys.keys()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Collect a per-key field out of every key in this batch, in key order.
    /// This is what a fetcher passes downstream as the batch's item list.
    pub fn collect<T>(&self, f: impl FnMut(&Key) -> T) -> Vec<T> {
        self.keys.iter().map(f).collect()
    }

    pub fn into_parts(self) -> (Group, KeySet<Key>) {
        (self.params, self.keys)
    }
}

/// Partition `keys` by `project`. Groups come back ordered by their
/// parameters; keys within a group keep the order they were first requested
/// in, and duplicates are dropped. A group larger than `limit` allows is
/// split into consecutive sub-batches of at most that size.
pub fn group_keys<Group, Key>(
    keys: impl IntoIterator<Item = Key>,
    mut project: impl FnMut(&Key) -> Group,
    mut limit: impl FnMut(&Group) -> Option<NonZeroUsize>,
) -> Vec<BatchGroup<Group, Key>>
where
    Group: Clone + Ord,
    Key: Clone + Eq + Hash,
{
    let mut seen = HashSet::new();
    let mut buckets: BTreeMap<Group, Vec<Key>> = BTreeMap::new();

    for key in keys {
        if seen.insert(key.clone()) {
            buckets.entry(project(&key)).or_default().push(key);
        }
    }

    let mut groups = Vec::with_capacity(buckets.len());

    for (params, keys) in buckets {
        let mut rest = KeySet::from_unique(keys);

        let size = match limit(&params) {
            Some(size) => size.get(),
            None => rest.len(),
        };

        let mut ordinal = 0;
        while rest.len() > size {
            let tail = rest.split_off(size);
            groups.push(BatchGroup::new(params.clone(), ordinal, rest));
            rest = tail;
            ordinal += 1;
        }

        groups.push(BatchGroup::new(params, ordinal, rest));
    }

    groups
}

/// Group keys using a loader's projection and batch limits.
pub fn group<L: BatchLoad>(
    loader: &L,
    keys: impl IntoIterator<Item = L::Key>,
) -> Vec<BatchGroup<L::Group, L::Key>> {
    group_keys(
        keys,
        |key| loader.group_of(key),
        |group| loader.batch_limit(group),
    )
}
