//! Lookups that are batched per discriminant: a key asks for a record either
//! by id or by path, and each kind goes to its own downstream operation with
//! its own batch ceiling.

use std::{
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    hash::Hash,
    num::NonZeroUsize,
};

use tokio_util::sync::CancellationToken;

use crate::{
    fetch::{ErrorDescriptor, Fetcher, KeyedEntry},
    grouped::GroupedLoader,
    key::CompositeKey,
    loader::Loader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LookupKind {
    ById,
    ByPath,
}

impl Display for LookupKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LookupKind::ById => "by id",
            LookupKind::ByPath => "by path",
        })
    }
}

/// A lookup of `target` (an id or a path, depending on `kind`) within the
/// records of `owner`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey<Owner> {
    pub owner: Owner,
    pub kind: LookupKind,
    pub target: String,
}

impl<Owner> LookupKey<Owner> {
    pub fn by_id(owner: Owner, id: impl Into<String>) -> Self {
        Self {
            owner,
            kind: LookupKind::ById,
            target: id.into(),
        }
    }

    pub fn by_path(owner: Owner, path: impl Into<String>) -> Self {
        Self {
            owner,
            kind: LookupKind::ByPath,
            target: path.into(),
        }
    }
}

impl<Owner> CompositeKey for LookupKey<Owner>
where
    Owner: Clone + Ord + Hash + Debug + Send + Sync + 'static,
{
    type Group = (LookupKind, Owner);
    type Item = String;

    fn group(&self) -> (LookupKind, Owner) {
        (self.kind, self.owner.clone())
    }

    fn item(&self) -> String {
        self.target.clone()
    }
}

/// One entry of a lookup response: the requested target, and the record
/// the service returned for it. A `None` record is a malformed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Found<Record> {
    pub target: String,
    pub record: Option<Record>,
}

impl<Record> Found<Record> {
    pub fn new(target: impl Into<String>, record: Record) -> Self {
        Self {
            target: target.into(),
            record: Some(record),
        }
    }
}

impl<Record: Clone> KeyedEntry<String> for Found<Record> {
    type Value = Record;

    fn entry_key(&self) -> &String {
        &self.target
    }

    fn entry_value(&self) -> Option<Record> {
        self.record.clone()
    }
}

/// A downstream service with one lookup operation per [`LookupKind`].
pub trait LookupFetcher: Send + Sync + 'static {
    type Owner: Clone + Ord + Hash + Debug + Send + Sync + 'static;
    type Record: Clone + Send + Sync + 'static;

    fn id_batch_limit(&self) -> Option<NonZeroUsize> {
        None
    }

    fn path_batch_limit(&self) -> Option<NonZeroUsize> {
        None
    }

    fn fetch_by_ids(
        &self,
        owner: &Self::Owner,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Found<Self::Record>>, ErrorDescriptor>> + Send;

    fn fetch_by_paths(
        &self,
        owner: &Self::Owner,
        paths: &[String],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Found<Self::Record>>, ErrorDescriptor>> + Send;
}

/// Adapts a [`LookupFetcher`] into a [`Fetcher`] that routes each group to
/// the operation for its kind.
#[derive(Debug, Clone, Default)]
pub struct Dispatch<F>(pub F);

impl<F: LookupFetcher> Fetcher for Dispatch<F> {
    type Params = (LookupKind, F::Owner);
    type ItemKey = String;
    type Item = Found<F::Record>;

    fn batch_limit(&self, (kind, _owner): &Self::Params) -> Option<NonZeroUsize> {
        match kind {
            LookupKind::ById => self.0.id_batch_limit(),
            LookupKind::ByPath => self.0.path_batch_limit(),
        }
    }

    async fn fetch_batch(
        &self,
        params: &Self::Params,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Found<F::Record>>, ErrorDescriptor> {
        let (kind, owner) = params;

        match kind {
            LookupKind::ById => self.0.fetch_by_ids(owner, targets, cancel).await,
            LookupKind::ByPath => self.0.fetch_by_paths(owner, targets, cancel).await,
        }
    }
}

pub type DispatchLoader<F> = GroupedLoader<Dispatch<F>, LookupKey<<F as LookupFetcher>::Owner>>;

impl<F: LookupFetcher> Loader<DispatchLoader<F>> {
    /// Create a loader that batches lookups per kind and owner.
    pub fn dispatch(fetcher: F) -> Self {
        Loader::new(GroupedLoader::new(Dispatch(fetcher)))
    }
}
