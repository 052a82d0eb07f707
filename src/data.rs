//! Data structures for passing keys into, and outcomes out of, one batch.

use std::{collections::HashSet, hash::Hash, slice, vec};

use crate::outcome::Outcome;

/// The keys of one batch. Use the `keys` method to get the keys, all of
/// which are unique and in first-request order, so that you can execute your
/// request.
///
/// A `KeySet` is the only way to create an [`OutcomeSet`]; each of the
/// methods that does so produces exactly one outcome per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySet<Key> {
    keys: Vec<Key>,
}

impl<Key> Default for KeySet<Key> {
    fn default() -> Self {
        Self { keys: Vec::new() }
    }
}

impl<Key: Clone + Eq + Hash> KeySet<Key> {
    /// Build a keyset from an iterator, dropping duplicates after their first
    /// occurrence.
    pub fn from_keys(keys: impl IntoIterator<Item = Key>) -> Self {
        let mut seen = HashSet::new();
        let keys = keys
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect();

        Self { keys }
    }
}

impl<Key> KeySet<Key> {
    /// Wrap keys the caller already knows to be unique.
    pub(crate) fn from_unique(keys: Vec<Key>) -> Self {
        Self { keys }
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn iter(&self) -> slice::Iter<'_, Key> {
        self.keys.iter()
    }

    /// Split off the keys after the first `at`, preserving order.
    pub(crate) fn split_off(&mut self, at: usize) -> Self {
        Self {
            keys: self.keys.split_off(at),
        }
    }

    /// Pair every key with an outcome. This is how a batch's results are
    /// handed back to the cache.
    pub fn resolve_with<Value>(
        self,
        mut get_outcome: impl FnMut(&Key) -> Outcome<Value>,
    ) -> OutcomeSet<Key, Value> {
        let entries = self
            .keys
            .into_iter()
            .map(|key| {
                let outcome = get_outcome(&key);
                (key, outcome)
            })
            .collect();

        OutcomeSet { entries }
    }

    /// Give every key the same outcome; used when a whole batch fails.
    pub fn resolve_all<Value: Clone>(self, outcome: Outcome<Value>) -> OutcomeSet<Key, Value> {
        self.resolve_with(move |_key| outcome.clone())
    }
}

impl<'a, Key> IntoIterator for &'a KeySet<Key> {
    type Item = &'a Key;
    type IntoIter = slice::Iter<'a, Key>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The outcomes of one batch, exactly one per key of the [`KeySet`] it was
/// created from.
#[derive(Debug)]
pub struct OutcomeSet<Key, Value> {
    entries: Vec<(Key, Outcome<Value>)>,
}

impl<Key, Value> OutcomeSet<Key, Value> {
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<Key, Value> IntoIterator for OutcomeSet<Key, Value> {
    type Item = (Key, Outcome<Value>);
    type IntoIter = vec::IntoIter<(Key, Outcome<Value>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
