//! Batchfetch is a batching, caching fetch layer in the style of the
//! [dataloader pattern](https://github.com/graphql/dataloader), built for
//! resolvers that fan out into many small downstream lookups. Individual key
//! requests are collected into fetch cycles, grouped by the parameters of the
//! downstream call that can answer them, fetched concurrently, and handed
//! back to each requester as a per-key [`Outcome`]. A failure in one group
//! degrades only that group's keys; every other key in the cycle still
//! resolves.
//!
//! ## Overview
//!
//! Suppose a downstream inventory service can only look up one SKU at a
//! time. Implement [`SingleLoad`] for it, and wrap it in a [`Loader`]:
//!
//! ```
//! use batchfetch::{CancellationToken, ErrorDescriptor, Loader, Located, Outcome, SingleLoad};
//! use futures::executor::block_on;
//!
//! struct Inventory;
//!
//! impl SingleLoad for Inventory {
//!     type Key = String;
//!     type Value = u32;
//!
//!     async fn fetch_one(
//!         &self,
//!         sku: &String,
//!         _cancel: &CancellationToken,
//!     ) -> Result<Located<u32>, ErrorDescriptor> {
//!         match sku.as_str() {
//!             "widget" => Ok(Located::Found(12)),
//!             "gadget" => Ok(Located::Missing),
//!             _ => Err(ErrorDescriptor::failure(503, "inventory unavailable")),
//!         }
//!     }
//! }
//!
//! let loader = Loader::single(Inventory);
//! let results = block_on(loader.load_many(["widget", "gadget", "gizmo"].map(String::from)));
//!
//! assert_eq!(results["widget"], Outcome::Value(12));
//! assert_eq!(results["gadget"], Outcome::Absent);
//! assert!(results["gizmo"].is_error());
//! ```
//!
//! Every key comes back with exactly one of three outcomes:
//!
//! - [`Outcome::Value`], the key's item;
//! - [`Outcome::Absent`], a successful "nothing here", either because the
//!   response had no item for the key or because the downstream call
//!   reported "no content";
//! - [`Outcome::Error`], carrying a [`FetchError`]: a downstream failure
//!   (with the original status and message), a malformed item, or a
//!   cancellation.
//!
//! Absence is never reported as an error, and a malformed item is never
//! reported as absence.
//!
//! ## Batching
//!
//! Most downstream services accept a list of items per call, as long as the
//! rest of the call's parameters are shared. Describe such a service with
//! [`Fetcher`], and give your keys a [`CompositeKey`] projection onto those
//! parameters (the group) and the item that identifies them within a call.
//! Tuples already implement `CompositeKey`, with the last element as the
//! item:
//!
//! ```
//! use batchfetch::{CancellationToken, ErrorDescriptor, Fetcher, GroupedLoader, KeyedEntry, Loader, Outcome};
//! use futures::executor::block_on;
//!
//! #[derive(Debug, Clone)]
//! struct Setting {
//!     name: String,
//!     value: Option<String>,
//! }
//!
//! impl KeyedEntry<String> for Setting {
//!     type Value = String;
//!
//!     fn entry_key(&self) -> &String {
//!         &self.name
//!     }
//!
//!     fn entry_value(&self) -> Option<String> {
//!         self.value.clone()
//!     }
//! }
//!
//! /// One call per site, with any number of setting names.
//! struct SettingsService;
//!
//! impl Fetcher for SettingsService {
//!     type Params = u32;
//!     type ItemKey = String;
//!     type Item = Setting;
//!
//!     async fn fetch_batch(
//!         &self,
//!         site: &u32,
//!         names: &[String],
//!         _cancel: &CancellationToken,
//!     ) -> Result<Vec<Setting>, ErrorDescriptor> {
//!         Ok(names
//!             .iter()
//!             .filter(|name| name.as_str() != "unset")
//!             .map(|name| Setting {
//!                 name: name.clone(),
//!                 value: Some(format!("{}@{}", name, site)),
//!             })
//!             .collect())
//!     }
//! }
//!
//! let loader: Loader<GroupedLoader<SettingsService, (u32, String)>> =
//!     Loader::grouped(SettingsService);
//!
//! let theme = (7, "theme".to_string());
//! let unset = (7, "unset".to_string());
//! let results = block_on(loader.load_many(vec![theme.clone(), unset.clone()]));
//!
//! assert_eq!(results[&theme], Outcome::Value("theme@7".to_string()));
//! assert_eq!(results[&unset], Outcome::Absent);
//! ```
//!
//! Both keys above were answered by a single `fetch_batch` call. Keys with
//! different parameters go to different calls, which run concurrently. A
//! [`Fetcher::batch_limit`] splits larger groups into ordered sub-batches.
//!
//! For strategies that don't fit the `Fetcher` shape, implement
//! [`BatchLoad`] directly. This crate ships three such strategies:
//!
//! - [`IntervalLoader`] merges the time ranges requested per entity into a
//!   minimal covering set, fetches them with one call, and filters the
//!   result back to each key's exact range.
//! - [`DispatchLoader`] batches lookups by kind (by id or by path) and owner,
//!   with a separate downstream operation and batch ceiling per kind.
//! - [`Paginate`] answers paged queries over several partitions with one
//!   globally sorted window.
//!
//! ## Fetch cycles
//!
//! [`Loader::load`] registers a key in the loader's [`CacheScope`]. A key
//! that is already resolved is answered immediately; a key that is already
//! pending joins the fetch on its way. A new key is queued, and `load`
//! waits out the configured [`LoaderConfig::window`] (or yields once, if no
//! window is set) before flushing the queue as one fetch cycle. Every `load`
//! issued in the meantime, from any task, joins the same cycle.
//! [`Loader::load_many`] flushes immediately. You can also drive cycles by
//! hand with [`Loader::enqueue`] and [`Loader::flush`].
//!
//! All of the asynchronous work is driven by the futures you poll. Nothing
//! is spawned in the background. If the future driving a cycle is dropped,
//! every future waiting on that cycle's keys is woken so that one of them
//! can take over.
//!
//! ## Caching and cancellation
//!
//! A loader's scope caches every outcome for its lifetime, so each distinct
//! key is fetched at most once. Create a loader per resolution pass for
//! request-scoped caching; share an `Arc<CacheScope>` between loaders with
//! [`Loader::with_scope`] for a longer-lived cache, resetting it with
//! [`CacheScope::reset`] or giving it a time-to-live.
//!
//! Each loader carries a [`CancellationToken`]. Cancelling it aborts every
//! downstream call in flight and resolves every pending key with
//! [`FetchError::Cancelled`]. Cancelled outcomes are delivered but never
//! cached.

mod cache;
mod config;
mod data;
mod dispatch;
mod distribute;
mod execute;
mod fetch;
mod group;
mod grouped;
mod interval;
mod key;
mod loader;
mod outcome;
mod paginate;
mod single;
mod wakerset;

pub use cache::CacheScope;
pub use config::LoaderConfig;
pub use data::{KeySet, OutcomeSet};
pub use dispatch::{Dispatch, DispatchLoader, Found, LookupFetcher, LookupKey, LookupKind};
pub use distribute::{distribute, distribute_group};
pub use execute::{execute, ExecLimits, Executed, RawOutcome};
pub use fetch::{BatchLoad, ErrorDescriptor, Fetcher, KeyedEntry, Located, Status};
pub use group::{group, group_keys, BatchGroup};
pub use grouped::GroupedLoader;
pub use interval::{merge_spans, IntervalLoader, RangeKey, SeriesFetcher, Span, Timestamped};
pub use key::CompositeKey;
pub use loader::{FlushReport, LoadFuture, Loader};
pub use outcome::{ErrorKind, FetchError, Outcome};
pub use paginate::{Page, PageQuery, PagedFetcher, Paginate, SortOrder};
pub use single::{PerKey, SingleLoad};
pub use tokio_util::sync::CancellationToken;
