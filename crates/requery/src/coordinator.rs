//! De-duplicates and sequences loads per cache key.
//!
//! A trigger is split into a synchronous gate and an asynchronous drive
//! phase. The gate checks the in-flight flag and staleness and, when it
//! passes, flips the flag in the same locked section. That makes the gate
//! atomic: of any number of concurrent triggers for one key, exactly one ends
//! up owning the load. The drive phase awaits the caller's loader (the only
//! suspension point) and commits the outcome.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::cache_key::CacheKey;
use crate::store::{CacheStore, EntryState, ErasedValue};
use crate::time::Instant;
use crate::utils::defer::defer;

/// The mode a trigger runs in. Decides both the gate rule and, for
/// sequential queries, which pages the loader fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadMode {
    /// Mount-time load, also used by invalidation reloads. Suppressed while
    /// the entry is fresh. Sequential queries replay all loaded pages.
    Load,
    /// Explicit reload of a plain query. Same gate as [`LoadMode::Load`].
    Reload,
    /// Fetch one more page with the stored cursor (sequential only).
    More,
    /// Reset to the first page, discarding accumulated pages (sequential
    /// only).
    PageReset,
}

/// Outcome of one type-erased load: committed as `data` on success or as
/// `error` on failure.
pub(crate) type LoadOutcome = Result<ErasedValue, ErasedValue>;

/// The type-erased load step registered per key.
///
/// Captures the query's loader and the parameter of the first fetch; receives
/// the store and the mode at call time.
pub(crate) type RawLoader =
    Arc<dyn Fn(Arc<CacheStore>, LoadMode) -> BoxFuture<'static, LoadOutcome> + Send + Sync>;

/// Per-trigger tuning.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TriggerOptions {
    /// How long a successful load stays fresh. Zero means immediately stale.
    pub stale_time: Duration,
    /// Bypass the gate entirely. A forced trigger during an in-flight load
    /// races with it, last write wins; callers needing strict sequencing must
    /// serialize themselves.
    pub force: bool,
}

/// A key's loader together with the options of the query that registered it.
pub(crate) struct RegisteredLoader {
    pub raw: RawLoader,
    pub options: TriggerOptions,
}

fn is_blocked(entry: &EntryState, mode: LoadMode, now: Instant) -> bool {
    if entry.loading {
        return true;
    }
    match mode {
        LoadMode::Load | LoadMode::Reload => {
            entry.loaded_at.is_some() && entry.stale_at.is_none_or(|at| now < at)
        }
        LoadMode::More | LoadMode::PageReset => entry.has_more != Some(true),
    }
}

/// Applies the gate for `key` and claims the load when it passes.
///
/// Claiming clears the previous error and raises the in-flight flag in one
/// locked section, which is what collapses concurrent triggers into a single
/// load. Returns whether the caller now owns the load and must drive it via
/// [`run`].
pub(crate) fn try_begin(
    store: &CacheStore,
    key: &CacheKey,
    mode: LoadMode,
    options: TriggerOptions,
) -> bool {
    let now = Instant::now();
    store.with_entry(key, |entry| {
        if !options.force && is_blocked(entry, mode, now) {
            tracing::trace!(key = %key, ?mode, "load suppressed by gate");
            return false;
        }
        entry.error = None;
        entry.loading = true;
        entry.notify.notify_waiters();
        true
    })
}

/// Drives a claimed load to completion and commits the outcome.
///
/// Success commits the data and refreshes the load/stale timestamps; failure
/// commits the error and leaves previously loaded data untouched. The
/// in-flight flag is cleared on every exit path, including an unwinding
/// loader.
pub(crate) async fn run(
    store: Arc<CacheStore>,
    key: CacheKey,
    options: TriggerOptions,
    load: BoxFuture<'static, LoadOutcome>,
) {
    let _finish = defer({
        let store = Arc::clone(&store);
        let key = key.clone();
        move || {
            store.with_entry(&key, |entry| {
                entry.loading = false;
                entry.notify.notify_waiters();
            });
        }
    });

    tracing::debug!(key = %key, "load started");
    let outcome = load.await;

    let now = Instant::now();
    store.with_entry(&key, |entry| match outcome {
        Ok(data) => {
            entry.data = Some(data);
            entry.loaded_at = Some(now);
            entry.stale_at = now.checked_add(options.stale_time);
            tracing::debug!(key = %key, "load succeeded");
        }
        Err(error) => {
            entry.error = Some(error);
            tracing::debug!(key = %key, "load failed");
        }
    });
}

/// Applies the gate synchronously and drives a claimed load as a spawned
/// task.
///
/// Used where the trigger must not be awaited: consumer mounts and
/// invalidation reloads. The caller observes `loading` as soon as this
/// returns.
pub(crate) fn spawn_trigger(
    store: &Arc<CacheStore>,
    key: &CacheKey,
    mode: LoadMode,
    loader: &Arc<RegisteredLoader>,
) {
    if try_begin(store, key, mode, loader.options) {
        let load = (loader.raw)(Arc::clone(store), mode);
        tokio::spawn(run(Arc::clone(store), key.clone(), loader.options, load));
    }
}

/// Runs the full trigger algorithm: gate, then drive.
///
/// `make_load` is only invoked once the gate has passed, so suppressed
/// triggers never touch the loader.
pub(crate) async fn trigger<F>(
    store: Arc<CacheStore>,
    key: CacheKey,
    mode: LoadMode,
    options: TriggerOptions,
    make_load: F,
) where
    F: FnOnce() -> BoxFuture<'static, LoadOutcome>,
{
    if try_begin(&store, &key, mode, options) {
        run(store, key, options, make_load()).await;
    }
}
