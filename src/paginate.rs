//! Paged queries over several partitions, answered as one globally sorted
//! window.
//!
//! Each key is a [`PageQuery`]: a set of partitions, a filter, a sort order
//! and a `skip`/`take` window over the merged result. For every partition
//! the loader fetches pages sequentially (never more than `skip + take`
//! items) alongside a total count. The candidates of all partitions are
//! sorted together, then windowed. A failure in any partition fails the
//! whole key.

use std::{
    cmp::Ordering,
    collections::BTreeSet,
    fmt::Debug,
    future::Future,
    hash::Hash,
    num::NonZeroUsize,
};

use futures::future;
use tokio_util::sync::CancellationToken;

use crate::{
    fetch::{ErrorDescriptor, Located},
    loader::Loader,
    single::{PerKey, SingleLoad},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageQuery<Partition, Filter> {
    pub partitions: BTreeSet<Partition>,
    pub filter: Filter,
    pub order: SortOrder,
    pub skip: usize,
    pub take: usize,
}

impl<Partition: Ord, Filter> PageQuery<Partition, Filter> {
    pub fn new(partitions: impl IntoIterator<Item = Partition>, filter: Filter) -> Self {
        Self {
            partitions: partitions.into_iter().collect(),
            filter,
            order: SortOrder::default(),
            skip: 0,
            take: usize::MAX,
        }
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn window(mut self, skip: usize, take: usize) -> Self {
        self.skip = skip;
        self.take = take;
        self
    }
}

/// One window of a paged query, and the number of matching items across
/// every partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

pub trait PagedFetcher: Send + Sync + 'static {
    type Partition: Clone + Ord + Hash + Debug + Send + Sync + 'static;
    type Filter: Clone + Ord + Hash + Debug + Send + Sync + 'static;
    type Item: Clone + Send + Sync + 'static;
    type SortKey: Ord;

    /// The largest page one `fetch_page` call may ask for.
    fn page_size(&self) -> NonZeroUsize;

    fn sort_key(&self, item: &Self::Item) -> Self::SortKey;

    /// Fetch up to `limit` items of a partition starting at `offset`, sorted
    /// by `order`. A page shorter than `limit` ends the partition.
    fn fetch_page(
        &self,
        partition: &Self::Partition,
        filter: &Self::Filter,
        order: SortOrder,
        offset: usize,
        limit: usize,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Self::Item>, ErrorDescriptor>> + Send;

    fn fetch_count(
        &self,
        partition: &Self::Partition,
        filter: &Self::Filter,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<usize, ErrorDescriptor>> + Send;
}

/// Adapts a [`PagedFetcher`] into a [`SingleLoad`] over [`PageQuery`] keys.
#[derive(Debug, Clone, Default)]
pub struct Paginate<F>(pub F);

/// What was fetched from one partition.
struct Partial<T> {
    items: Vec<T>,
    count: usize,
}

/// "No content" from a partition means it has nothing, not that it failed.
fn or_empty<T: Default>(result: Result<T, ErrorDescriptor>) -> Result<T, ErrorDescriptor> {
    match result {
        Err(err) if err.is_no_content() => Ok(T::default()),
        result => result,
    }
}

impl<F: PagedFetcher> Paginate<F> {
    async fn fetch_partition(
        &self,
        partition: &F::Partition,
        query: &PageQuery<F::Partition, F::Filter>,
        wanted: usize,
        cancel: &CancellationToken,
    ) -> Result<Partial<F::Item>, ErrorDescriptor> {
        let page_size = self.0.page_size().get();

        let pages = async {
            let mut items = Vec::new();

            while items.len() < wanted {
                let limit = page_size.min(wanted - items.len());
                let page = or_empty(
                    self.0
                        .fetch_page(
                            partition,
                            &query.filter,
                            query.order,
                            items.len(),
                            limit,
                            cancel,
                        )
                        .await,
                )?;

                let last = page.len() < limit;
                items.extend(page);
                if last {
                    break;
                }
            }

            Ok::<_, ErrorDescriptor>(items)
        };

        let count = async { or_empty(self.0.fetch_count(partition, &query.filter, cancel).await) };

        let (items, count) = future::try_join(pages, count).await?;
        tracing::trace!(
            partition = ?partition,
            fetched = items.len(),
            count,
            "fetched partition"
        );

        Ok(Partial { items, count })
    }
}

impl<F: PagedFetcher> SingleLoad for Paginate<F> {
    type Key = PageQuery<F::Partition, F::Filter>;
    type Value = Page<F::Item>;

    async fn fetch_one(
        &self,
        query: &Self::Key,
        cancel: &CancellationToken,
    ) -> Result<Located<Page<F::Item>>, ErrorDescriptor> {
        let wanted = query.skip.saturating_add(query.take);

        let partials = future::try_join_all(
            query
                .partitions
                .iter()
                .map(|partition| self.fetch_partition(partition, query, wanted, cancel)),
        )
        .await?;

        let mut total = 0;
        let mut candidates = Vec::new();

        for (partition, partial) in query.partitions.iter().zip(partials) {
            if partial.count < partial.items.len() {
                return Ok(Located::Malformed(format!(
                    "partition {:?} counted {} items but returned {}",
                    partition,
                    partial.count,
                    partial.items.len()
                )));
            }

            total += partial.count;
            candidates.extend(partial.items);
        }

        candidates.sort_by(|a, b| {
            query
                .order
                .apply(self.0.sort_key(a).cmp(&self.0.sort_key(b)))
        });

        let items = candidates
            .into_iter()
            .skip(query.skip)
            .take(query.take)
            .collect();

        Ok(Located::Found(Page { items, total }))
    }
}

impl<F: PagedFetcher> Loader<PerKey<Paginate<F>>> {
    /// Create a loader that answers paged queries across partitions.
    pub fn paginate(fetcher: F) -> Self {
        Loader::single(Paginate(fetcher))
    }
}
