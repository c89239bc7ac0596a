//! Client-side caching and coordination for asynchronous, parameterized
//! loads.
//!
//! Many independent consumers can ask for "the value identified by key `K`,
//! loaded with parameter `P`". This crate guarantees at most one in-flight
//! load per resolved cache entry, shares the loaded value and the
//! loading/error state between all consumers of the same entry, tracks
//! staleness so repeat access can skip or re-run the load, and layers
//! cursor-based sequential fetches on top of the same entries.
//!
//! ## Architecture
//!
//! - [`CacheKey`] and [`KeySpec`] canonicalize a base path plus an optional
//!   parameter into an ordered key. Structurally equal parameters always
//!   resolve to the same key.
//! - [`CacheStore`] is the table of entry state (data, error, in-flight
//!   flag, timestamps, pagination bookkeeping), active-consumer counts and
//!   registered loaders. It is an explicit object with a lifecycle of its
//!   own: construct one per process, or one per test for isolation.
//! - The internal load coordinator de-duplicates triggers per key. Its gate
//!   checks and claims the in-flight flag in one locked section, so any
//!   number of concurrent triggers for a key run the loader exactly once,
//!   and a fresh entry suppresses redundant loads until it goes stale.
//! - [`CacheStore::invalidate`] marks matching keys stale and immediately
//!   re-runs the loads that currently have active consumers.
//! - [`SequentialQuery`] adds cursor/has-more bookkeeping and replays all
//!   loaded pages when the entry reloads.
//! - [`Mutation`] runs one-shot write operations with their own state,
//!   independent of the cache.
//!
//! ## Loads are values
//!
//! A loader is a plain async function resolving to `Result<T, E>`. Both
//! outcomes are committed to the entry: data on success, the error value on
//! failure. A failed reload never discards previously loaded data, and a
//! failing key never affects any other key. Panics are a different matter:
//! a panicking query loader unwinds into its task (only the in-flight flag
//! is cleaned up), while [`Mutation`] catches the unwind and reports it as
//! an error value.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use requery::{CacheStore, Query};
//!
//! # async fn example() {
//! let store = Arc::new(CacheStore::new());
//!
//! let user_names = Query::new(&store, ["user", "name"], |id: u32| async move {
//!     if id == 0 {
//!         return Err("unknown user".to_owned());
//!     }
//!     Ok(format!("user-{id}"))
//! });
//!
//! let handle = user_names.fetch(7);
//! handle.settled().await;
//! assert_eq!(handle.data().as_deref(), Some(&"user-7".to_owned()));
//! # }
//! ```

#![warn(missing_docs)]

mod cache_key;
mod config;
mod coordinator;
mod invalidate;
mod mutation;
mod query;
mod sequential;
mod store;
mod utils;

#[cfg(any(feature = "test", test))]
#[allow(unused)]
pub mod test;

#[cfg(test)]
mod tests;

pub use cache_key::{CacheKey, KEY_SEPARATOR, KeySpec};
pub use config::QueryConfig;
pub use invalidate::InvalidateOptions;
pub use mutation::{Mutation, MutationError, MutationResult};
pub use query::{Query, QueryHandle};
pub use sequential::{Page, SequentialQuery, SequentialQueryHandle};
pub use store::{ActiveGuard, CacheStore};

#[cfg(any(test, feature = "test"))]
pub(crate) use tokio::time;

#[cfg(not(any(test, feature = "test")))]
pub(crate) use std::time;
