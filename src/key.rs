//! Composite keys and their projections.

use std::{fmt::Debug, hash::Hash};

/// A key made of some fields the downstream call is parameterized on (the
/// group) and some fields that identify one item within that call.
///
/// Tuples implement this with the trailing element as the item: `(A, B)`
/// groups by `A`, `(A, B, C)` groups by `(A, B)`.
pub trait CompositeKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    type Group: Clone + Ord + Hash + Debug + Send + Sync + 'static;
    type Item: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn group(&self) -> Self::Group;

    fn item(&self) -> Self::Item;
}

impl<A, B> CompositeKey for (A, B)
where
    A: Clone + Ord + Hash + Debug + Send + Sync + 'static,
    B: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    type Group = A;
    type Item = B;

    fn group(&self) -> A {
        self.0.clone()
    }

    fn item(&self) -> B {
        self.1.clone()
    }
}

impl<A, B, C> CompositeKey for (A, B, C)
where
    A: Clone + Ord + Hash + Debug + Send + Sync + 'static,
    B: Clone + Ord + Hash + Debug + Send + Sync + 'static,
    C: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    type Group = (A, B);
    type Item = C;

    fn group(&self) -> (A, B) {
        (self.0.clone(), self.1.clone())
    }

    fn item(&self) -> C {
        self.2.clone()
    }
}
