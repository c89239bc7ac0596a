use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::cache_key::{CacheKey, KeySpec};
use crate::config::QueryConfig;
use crate::coordinator::{self, LoadMode, RawLoader, RegisteredLoader, TriggerOptions};
use crate::store::{ActiveGuard, CacheStore, ErasedValue};
use crate::time::Instant;

type LoadFn<P, T, E> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// A cached, de-duplicated query.
///
/// A query pairs a key derivation with an async loader. Calling
/// [`fetch`](Query::fetch) mounts one consumer: it resolves the cache key for
/// the parameter, marks the consumer active, and starts a load unless the
/// entry is fresh or already loading. All consumers of the same key share one
/// entry, one in-flight load and one registered loader.
///
/// When a consumer's parameter changes, fetch again with the new value and
/// drop the old handle; the activity registration moves to the new key while
/// the old entry stays cached.
pub struct Query<P, T, E> {
    store: Arc<CacheStore>,
    key: KeySpec<P>,
    load_fn: LoadFn<P, T, E>,
    config: QueryConfig,
    initial_data: Option<Arc<T>>,
}

impl<P, T, E> Query<P, T, E>
where
    P: Serialize + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a query over `store`.
    ///
    /// `key` is either a fixed segment list (a present parameter contributes
    /// one extra segment) or a [`KeySpec::from_fn`] derivation. The loader
    /// resolves to `Ok` data or an `Err` value; both are cached per key.
    pub fn new<K, F, Fut>(store: &Arc<CacheStore>, key: K, load_fn: F) -> Self
    where
        K: Into<KeySpec<P>>,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Query {
            store: Arc::clone(store),
            key: key.into(),
            load_fn: Arc::new(move |param| load_fn(param).boxed()),
            config: QueryConfig::default(),
            initial_data: None,
        }
    }

    /// Replaces the query configuration.
    pub fn config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how long a successful load stays fresh.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.config.stale_time = stale_time;
        self
    }

    /// Sets the value handles report before the first successful load.
    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(Arc::new(data));
        self
    }

    fn trigger_options(&self) -> TriggerOptions {
        TriggerOptions {
            stale_time: self.config.stale_time,
            force: false,
        }
    }

    /// Mounts a consumer for `param` and returns its handle.
    ///
    /// The first fetch for a distinct key registers the loader with the
    /// parameter closed over; reloads and invalidation reloads re-run that
    /// same logical request no matter which consumer triggers them. The gate
    /// is applied synchronously, so a handle of a stale or unloaded entry
    /// observes `loading` immediately.
    ///
    /// Must be called within a tokio runtime; the load itself runs as a
    /// spawned task.
    pub fn fetch(&self, param: P) -> QueryHandle<T, E> {
        let key = self.key.resolve(&param);
        let active = self.store.register_active(&key);
        let loader = self.store.register_loader(
            &key,
            Arc::new(RegisteredLoader {
                raw: raw_loader(Arc::clone(&self.load_fn), param),
                options: self.trigger_options(),
            }),
        );
        coordinator::spawn_trigger(&self.store, &key, LoadMode::Load, &loader);

        QueryHandle {
            store: Arc::clone(&self.store),
            key,
            loader,
            initial_data: self.initial_data.clone(),
            _active: active,
            _types: PhantomData,
        }
    }
}

/// The type-erased load step for a plain query: one loader call, one
/// committed value.
fn raw_loader<P, T, E>(load_fn: LoadFn<P, T, E>, param: P) -> RawLoader
where
    P: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    Arc::new(move |_store, _mode| {
        let load = load_fn(param.clone());
        async move {
            match load.await {
                Ok(data) => Ok(Arc::new(data) as ErasedValue),
                Err(error) => Err(Arc::new(error) as ErasedValue),
            }
        }
        .boxed()
    })
}

/// One consumer's view of a cached entry.
///
/// All accessors are independent snapshots of individual entry fields; a
/// consumer polling only [`loading`](QueryHandle::loading) is not affected by
/// data commits and vice versa. Dropping the handle releases the activity
/// registration while the entry stays cached.
pub struct QueryHandle<T, E> {
    store: Arc<CacheStore>,
    key: CacheKey,
    loader: Arc<RegisteredLoader>,
    initial_data: Option<Arc<T>>,
    _active: ActiveGuard,
    _types: PhantomData<fn() -> (T, E)>,
}

impl<T, E> QueryHandle<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// The resolved cache key this handle observes.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Whether a load for this entry is in flight.
    pub fn loading(&self) -> bool {
        self.store.loading(&self.key)
    }

    /// The last successfully loaded value, or the configured initial data
    /// before the first load.
    pub fn data(&self) -> Option<Arc<T>> {
        self.store
            .data(&self.key)
            .and_then(|value| value.downcast::<T>().ok())
            .or_else(|| self.initial_data.clone())
    }

    /// The error of the most recent failed load, if any.
    ///
    /// Independent of [`data`](QueryHandle::data): a failed reload keeps the
    /// previously loaded value available.
    pub fn error(&self) -> Option<Arc<E>> {
        self.store
            .error(&self.key)
            .and_then(|value| value.downcast::<E>().ok())
    }

    /// When the last successful load committed.
    pub fn loaded_at(&self) -> Option<Instant> {
        self.store.loaded_at(&self.key)
    }

    /// When the entry turns stale.
    pub fn stale_at(&self) -> Option<Instant> {
        self.store.stale_at(&self.key)
    }

    /// Triggers the entry's load again and waits for it to settle.
    ///
    /// Suppressed while a load is already in flight or while the entry is
    /// still fresh, like any other trigger.
    pub async fn reload(&self) {
        let raw = Arc::clone(&self.loader.raw);
        let store = Arc::clone(&self.store);
        coordinator::trigger(
            Arc::clone(&self.store),
            self.key.clone(),
            LoadMode::Reload,
            self.loader.options,
            move || raw(store, LoadMode::Reload),
        )
        .await;
    }

    /// Waits until no load for this entry is in flight.
    pub async fn settled(&self) {
        self.store.await_settled(&self.key).await;
    }
}
