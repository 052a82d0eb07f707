//! Loading time series by range. Every range requested for one entity in a
//! cycle is merged into a minimal covering set, fetched with one call, and
//! filtered back to each key's exact range.

use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    hash::Hash,
};

use tokio_util::sync::CancellationToken;

use crate::{
    fetch::{BatchLoad, ErrorDescriptor, Located},
    group::BatchGroup,
    loader::Loader,
};

/// An inclusive range of timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: i64,
    pub end: i64,
}

impl Span {
    /// Create a span. The bounds are swapped if given out of order.
    pub fn new(start: i64, end: i64) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    #[inline]
    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    /// Whether `next`, which starts no earlier than `self`, overlaps or
    /// directly follows `self`.
    fn reaches(&self, next: &Span) -> bool {
        next.start <= self.end.saturating_add(1)
    }
}

impl PartialOrd for Span {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Span {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.start, self.end).cmp(&(other.start, other.end))
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Merge spans into the minimal sorted set of disjoint spans covering the
/// same timestamps. Overlapping and adjacent spans are joined.
pub fn merge_spans(spans: impl IntoIterator<Item = Span>) -> Vec<Span> {
    let mut spans: Vec<Span> = spans.into_iter().collect();
    spans.sort_unstable();

    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());

    for span in spans {
        match merged.last_mut() {
            Some(last) if last.reaches(&span) => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }

    merged
}

/// A request for one entity's points within a span.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeKey<Entity> {
    pub entity: Entity,
    pub span: Span,
}

impl<Entity> RangeKey<Entity> {
    pub fn new(entity: Entity, start: i64, end: i64) -> Self {
        Self {
            entity,
            span: Span::new(start, end),
        }
    }
}

/// A point in a time series.
pub trait Timestamped {
    fn timestamp(&self) -> i64;

    /// Whether this point is structurally valid. A key whose range includes
    /// an invalid point resolves as a malformed response.
    fn is_well_formed(&self) -> bool {
        true
    }
}

/// A downstream service that returns an entity's points over a set of
/// disjoint spans in one call.
pub trait SeriesFetcher: Send + Sync + 'static {
    type Entity: Clone + Ord + Hash + Debug + Send + Sync + 'static;
    type Point: Timestamped + Clone + Send + Sync + 'static;

    fn fetch_series(
        &self,
        entity: &Self::Entity,
        spans: &[Span],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Self::Point>, ErrorDescriptor>> + Send;
}

#[derive(Debug, Clone)]
pub struct IntervalLoader<F> {
    fetcher: F,
}

impl<F> IntervalLoader<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    #[inline]
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }
}

impl<F: SeriesFetcher> BatchLoad for IntervalLoader<F> {
    type Key = RangeKey<F::Entity>;
    type Group = F::Entity;
    /// Every point of the group's merged spans, sorted by timestamp.
    type Payload = Vec<F::Point>;
    type Value = Vec<F::Point>;

    fn group_of(&self, key: &Self::Key) -> F::Entity {
        key.entity.clone()
    }

    async fn fetch(
        &self,
        batch: &BatchGroup<F::Entity, Self::Key>,
        cancel: &CancellationToken,
    ) -> Result<Vec<F::Point>, ErrorDescriptor> {
        let spans = merge_spans(batch.collect(|key| key.span));
        tracing::trace!(
            entity = ?batch.params(),
            requested = batch.len(),
            merged = spans.len(),
            "fetching merged spans"
        );

        let mut points = self
            .fetcher
            .fetch_series(batch.params(), &spans, cancel)
            .await?;
        points.sort_by_key(Timestamped::timestamp);

        Ok(points)
    }

    fn locate(&self, key: &Self::Key, points: &Vec<F::Point>) -> Located<Vec<F::Point>> {
        let from = points.partition_point(|point| point.timestamp() < key.span.start);
        let to = points.partition_point(|point| point.timestamp() <= key.span.end);
        let window = &points[from..to];

        if window.is_empty() {
            return Located::Missing;
        }

        match window.iter().find(|point| !point.is_well_formed()) {
            Some(bad) => Located::Malformed(format!(
                "malformed point at {} in {}",
                bad.timestamp(),
                key.span
            )),
            None => Located::Found(window.to_vec()),
        }
    }
}

impl<F: SeriesFetcher> Loader<IntervalLoader<F>> {
    /// Create a loader that merges requested ranges per entity.
    pub fn interval(fetcher: F) -> Self {
        Loader::new(IntervalLoader::new(fetcher))
    }
}
