//! Turning each group's raw outcome into one outcome per key.
//!
//! This is the only place the three-way error model is decided: a "no
//! content" group is absence, any other group failure is a downstream
//! failure for all of its keys, and a successful payload is searched per key
//! with [`BatchLoad::locate`].

use std::collections::HashMap;

use crate::{
    data::OutcomeSet,
    execute::{Executed, RawOutcome},
    fetch::BatchLoad,
    outcome::{FetchError, Outcome},
};

/// Distribute a single group's outcome onto its keys.
pub fn distribute_group<L: BatchLoad>(
    loader: &L,
    (group, raw): Executed<L>,
) -> OutcomeSet<L::Key, L::Value> {
    let (_params, keys) = group.into_parts();

    match raw {
        RawOutcome::Payload(payload) => {
            keys.resolve_with(|key| Outcome::from(loader.locate(key, &payload)))
        }
        RawOutcome::Failed(descriptor) => keys.resolve_all(Outcome::from_descriptor(&descriptor)),
        RawOutcome::Cancelled => keys.resolve_all(Outcome::Error(FetchError::Cancelled)),
    }
}

/// Distribute every executed group. Groups partition their keys, so every
/// key handed in appears exactly once in the result.
pub fn distribute<L: BatchLoad>(
    loader: &L,
    executed: Vec<Executed<L>>,
) -> HashMap<L::Key, Outcome<L::Value>> {
    let capacity = executed.iter().map(|(group, _)| group.len()).sum();
    let mut outcomes = HashMap::with_capacity(capacity);

    for entry in executed {
        outcomes.extend(distribute_group(loader, entry));
    }

    outcomes
}
