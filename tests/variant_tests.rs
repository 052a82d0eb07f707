//! These tests cover the specialized loaders: interval merging, per-kind
//! dispatch, and accumulating pagination.

mod common;

use batchfetch::{
    CancellationToken, ErrorDescriptor, ErrorKind, Found, Loader, LookupFetcher, LookupKey,
    LookupKind, Outcome, Page, PageQuery, PagedFetcher, RangeKey, SeriesFetcher, SortOrder, Span,
    Timestamped,
};
use common::init_tracing;
use futures::executor;
use std::{num::NonZeroUsize, sync::Mutex};

// Interval merging

#[derive(Debug, Clone, PartialEq)]
struct Reading {
    at: i64,
    value: Option<f64>,
}

impl Timestamped for Reading {
    fn timestamp(&self) -> i64 {
        self.at
    }

    fn is_well_formed(&self) -> bool {
        self.value.is_some()
    }
}

/// Every meter has one reading per timestamp in 0..=20, returned newest
/// first. Meter "faulty" has a null reading at 13.
#[derive(Default)]
struct Meters {
    calls: Mutex<Vec<(&'static str, Vec<Span>)>>,
}

impl SeriesFetcher for Meters {
    type Entity = &'static str;
    type Point = Reading;

    async fn fetch_series(
        &self,
        meter: &&'static str,
        spans: &[Span],
        _cancel: &CancellationToken,
    ) -> Result<Vec<Reading>, ErrorDescriptor> {
        self.calls.lock().unwrap().push((*meter, spans.to_vec()));

        Ok((0..=20)
            .rev()
            .filter(|at| spans.iter().any(|span| span.contains(*at)))
            .map(|at| Reading {
                at,
                value: (*meter != "faulty" || at != 13).then(|| at as f64),
            })
            .collect())
    }
}

fn timestamps(outcome: &Outcome<Vec<Reading>>) -> Vec<i64> {
    outcome
        .value()
        .map(|readings| readings.iter().map(|r| r.at).collect())
        .unwrap_or_default()
}

#[test]
fn overlapping_ranges_share_one_covering_call() {
    init_tracing();
    let loader = Loader::interval(Meters::default());

    let early = RangeKey::new("m1", 0, 10);
    let late = RangeKey::new("m1", 5, 15);
    let results = executor::block_on(loader.load_many(vec![early.clone(), late.clone()]));

    assert_eq!(
        loader.batcher().fetcher().calls.lock().unwrap().clone(),
        vec![("m1", vec![Span::new(0, 15)])]
    );

    assert_eq!(timestamps(&results[&early]), (0..=10).collect::<Vec<_>>());
    assert_eq!(timestamps(&results[&late]), (5..=15).collect::<Vec<_>>());
}

#[test]
fn ranges_are_merged_per_entity() {
    init_tracing();
    let loader = Loader::interval(Meters::default());

    let results = executor::block_on(loader.load_many(vec![
        RangeKey::new("m1", 0, 2),
        RangeKey::new("m2", 4, 6),
        RangeKey::new("m1", 10, 12),
        RangeKey::new("m2", 30, 40),
    ]));

    assert_eq!(
        loader.batcher().fetcher().calls.lock().unwrap().clone(),
        vec![
            ("m1", vec![Span::new(0, 2), Span::new(10, 12)]),
            ("m2", vec![Span::new(4, 6), Span::new(30, 40)]),
        ]
    );

    // Nothing recorded in 30..=40
    assert_eq!(results[&RangeKey::new("m2", 30, 40)], Outcome::Absent);
    assert_eq!(timestamps(&results[&RangeKey::new("m2", 4, 6)]), [4, 5, 6]);
}

#[test]
fn malformed_points_fail_only_the_ranges_containing_them() {
    init_tracing();
    let loader = Loader::interval(Meters::default());

    let clean = RangeKey::new("faulty", 0, 10);
    let dirty = RangeKey::new("faulty", 5, 15);
    let results = executor::block_on(loader.load_many(vec![clean.clone(), dirty.clone()]));

    assert_eq!(timestamps(&results[&clean]).len(), 11);
    assert_eq!(
        results[&dirty].kind(),
        Some(ErrorKind::MalformedResponse)
    );
}

// Per-kind dispatch

#[derive(Default)]
struct Documents {
    calls: Mutex<Vec<(LookupKind, &'static str, Vec<String>)>>,
}

impl Documents {
    fn respond(
        &self,
        kind: LookupKind,
        owner: &'static str,
        targets: &[String],
    ) -> Result<Vec<Found<String>>, ErrorDescriptor> {
        self.calls
            .lock()
            .unwrap()
            .push((kind, owner, targets.to_vec()));

        if owner == "locked" {
            return Err(ErrorDescriptor::failure(403, "forbidden"));
        }

        Ok(targets
            .iter()
            .filter(|target| !target.starts_with("missing"))
            .map(|target| Found::new(target.clone(), format!("{} {}: {}", owner, kind, target)))
            .collect())
    }
}

impl LookupFetcher for Documents {
    type Owner = &'static str;
    type Record = String;

    fn id_batch_limit(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(2)
    }

    async fn fetch_by_ids(
        &self,
        owner: &&'static str,
        ids: &[String],
        _cancel: &CancellationToken,
    ) -> Result<Vec<Found<String>>, ErrorDescriptor> {
        self.respond(LookupKind::ById, *owner, ids)
    }

    async fn fetch_by_paths(
        &self,
        owner: &&'static str,
        paths: &[String],
        _cancel: &CancellationToken,
    ) -> Result<Vec<Found<String>>, ErrorDescriptor> {
        self.respond(LookupKind::ByPath, *owner, paths)
    }
}

#[test]
fn lookups_are_batched_per_kind_and_owner() {
    init_tracing();
    let loader = Loader::dispatch(Documents::default());

    let x = LookupKey::by_id("A", "x");
    let y = LookupKey::by_id("A", "y");
    let z = LookupKey::by_path("B", "z");
    let results = executor::block_on(loader.load_many(vec![x.clone(), y.clone(), z.clone()]));

    assert_eq!(
        loader.batcher().fetcher().0.calls.lock().unwrap().clone(),
        vec![
            (LookupKind::ById, "A", vec!["x".to_string(), "y".to_string()]),
            (LookupKind::ByPath, "B", vec!["z".to_string()]),
        ]
    );

    assert_eq!(results[&x], Outcome::Value("A by id: x".to_string()));
    assert_eq!(results[&z], Outcome::Value("B by path: z".to_string()));
}

#[test]
fn each_kind_has_its_own_ceiling() {
    init_tracing();
    let loader = Loader::dispatch(Documents::default());

    let keys: Vec<_> = ["a", "b", "c"]
        .iter()
        .flat_map(|t| [LookupKey::by_id("A", *t), LookupKey::by_path("A", *t)])
        .collect();
    executor::block_on(loader.load_many(keys));

    let calls: Vec<_> = loader
        .batcher()
        .fetcher()
        .0
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|(kind, _, targets)| (*kind, targets.len()))
        .collect();

    assert_eq!(
        calls,
        vec![
            (LookupKind::ById, 2),
            (LookupKind::ById, 1),
            (LookupKind::ByPath, 3),
        ]
    );
}

#[test]
fn dispatch_failures_stay_with_their_owner() {
    init_tracing();
    let loader = Loader::dispatch(Documents::default());

    let results = executor::block_on(loader.load_many(vec![
        LookupKey::by_id("locked", "x"),
        LookupKey::by_id("open", "x"),
        LookupKey::by_id("open", "missing-1"),
    ]));

    assert_eq!(
        results[&LookupKey::by_id("locked", "x")].kind(),
        Some(ErrorKind::DownstreamFailure)
    );
    assert!(results[&LookupKey::by_id("open", "x")].is_value());
    assert_eq!(
        results[&LookupKey::by_id("open", "missing-1")],
        Outcome::Absent
    );
}

// Accumulating pagination

/// Partitions hold sorted numbers. "down" fails, "void" reports no content,
/// and "liar" undercounts its items.
#[derive(Default)]
struct Tickets {
    pages: Mutex<Vec<(&'static str, usize, usize)>>,
}

impl Tickets {
    fn partition(name: &str) -> Vec<u32> {
        match name {
            "east" => vec![1, 4, 7, 10],
            "west" => vec![2, 3, 8],
            "liar" => vec![5, 6, 9],
            _ => Vec::new(),
        }
    }
}

impl PagedFetcher for Tickets {
    type Partition = &'static str;
    type Filter = ();
    type Item = u32;
    type SortKey = u32;

    fn page_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(2).unwrap()
    }

    fn sort_key(&self, item: &u32) -> u32 {
        *item
    }

    async fn fetch_page(
        &self,
        partition: &&'static str,
        _filter: &(),
        order: SortOrder,
        offset: usize,
        limit: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u32>, ErrorDescriptor> {
        self.pages.lock().unwrap().push((*partition, offset, limit));

        match *partition {
            "down" => return Err(ErrorDescriptor::failure(500, "ticket store down")),
            "void" => return Err(ErrorDescriptor::no_content()),
            _ => {}
        }

        let mut items = Self::partition(partition);
        if order == SortOrder::Descending {
            items.reverse();
        }

        Ok(items.into_iter().skip(offset).take(limit).collect())
    }

    async fn fetch_count(
        &self,
        partition: &&'static str,
        _filter: &(),
        _cancel: &CancellationToken,
    ) -> Result<usize, ErrorDescriptor> {
        match *partition {
            "down" => Err(ErrorDescriptor::failure(500, "ticket store down")),
            "void" => Err(ErrorDescriptor::no_content()),
            "liar" => Ok(1),
            partition => Ok(Self::partition(partition).len()),
        }
    }
}

#[test]
fn pages_are_sorted_and_windowed_globally() {
    init_tracing();
    let loader = Loader::paginate(Tickets::default());

    let query = PageQuery::new(["east", "west"], ()).window(1, 3);
    let outcome = executor::block_on(loader.load(query));

    assert_eq!(
        outcome,
        Outcome::Value(Page {
            items: vec![2, 3, 4],
            total: 7,
        })
    );

    // Each partition is read no further than skip + take
    let mut pages = loader.batcher().0 .0.pages.lock().unwrap().clone();
    pages.sort_unstable();
    assert_eq!(
        pages,
        vec![("east", 0, 2), ("east", 2, 2), ("west", 0, 2), ("west", 2, 2)]
    );
}

#[test]
fn descending_queries() {
    init_tracing();
    let loader = Loader::paginate(Tickets::default());

    let query = PageQuery::new(["east", "west", "void"], ())
        .order(SortOrder::Descending)
        .window(0, 2);

    assert_eq!(
        executor::block_on(loader.load(query)),
        Outcome::Value(Page {
            items: vec![10, 8],
            total: 7,
        })
    );
}

#[test]
fn one_failing_partition_fails_the_whole_query() {
    init_tracing();
    let loader = Loader::paginate(Tickets::default());

    let failing = PageQuery::new(["east", "down"], ());
    let healthy = PageQuery::new(["east"], ()).window(0, 2);
    let results = executor::block_on(loader.load_many(vec![failing.clone(), healthy.clone()]));

    assert_eq!(results[&failing].kind(), Some(ErrorKind::DownstreamFailure));
    assert_eq!(
        results[&healthy],
        Outcome::Value(Page {
            items: vec![1, 4],
            total: 4,
        })
    );
}

#[test]
fn counts_below_the_items_returned_are_malformed() {
    init_tracing();
    let loader = Loader::paginate(Tickets::default());

    let outcome = executor::block_on(loader.load(PageQuery::new(["liar"], ())));
    assert_eq!(outcome.kind(), Some(ErrorKind::MalformedResponse));
}
