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

/// One page returned by a sequential loader.
pub struct Page<T, C> {
    /// The page's payload, appended to the accumulated data.
    pub data: T,
    /// Cursor for the next page, or `None` when this was the last one.
    pub cursor: Option<C>,
}

type SequentialLoadFn<P, T, C, E> =
    Arc<dyn Fn(P, Option<C>) -> BoxFuture<'static, Result<Page<T, C>, E>> + Send + Sync>;

/// A cached query over a cursor-paginated source.
///
/// The entry holds the ordered pages loaded so far. Three trigger shapes run
/// against the same key:
///
/// - the mount/invalidation load replays every previously loaded page from
///   page one, chaining each page on the cursor the previous page returned,
///   and rebuilds the accumulation from scratch;
/// - [`load_more`](SequentialQueryHandle::load_more) fetches exactly one page
///   with the stored cursor and appends it;
/// - [`reload`](SequentialQueryHandle::reload) starts over with page one.
///
/// The replay exists because the underlying source may have shifted between
/// pages; keeping old pages unvalidated would let a reload return a mix of
/// old and new data.
pub struct SequentialQuery<P, T, C, E> {
    store: Arc<CacheStore>,
    key: KeySpec<P>,
    load_fn: SequentialLoadFn<P, T, C, E>,
    config: QueryConfig,
    initial_data: Option<Arc<Vec<T>>>,
}

impl<P, T, C, E> SequentialQuery<P, T, C, E>
where
    P: Serialize + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a sequential query over `store`.
    ///
    /// The loader receives the parameter and the cursor to continue from
    /// (`None` for page one) and resolves to one [`Page`] or an error.
    pub fn new<K, F, Fut>(store: &Arc<CacheStore>, key: K, load_fn: F) -> Self
    where
        K: Into<KeySpec<P>>,
        F: Fn(P, Option<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Page<T, C>, E>> + Send + 'static,
    {
        SequentialQuery {
            store: Arc::clone(store),
            key: key.into(),
            load_fn: Arc::new(move |param, cursor| load_fn(param, cursor).boxed()),
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

    /// Sets the pages handles report before the first successful load.
    pub fn initial_data(mut self, pages: Vec<T>) -> Self {
        self.initial_data = Some(Arc::new(pages));
        self
    }

    /// Mounts a consumer for `param` and returns its handle.
    ///
    /// Same contract as [`Query::fetch`](crate::Query::fetch); the initial
    /// load replays any pages a previous mount of this key accumulated.
    pub fn fetch(&self, param: P) -> SequentialQueryHandle<T, C, E> {
        let key = self.key.resolve(&param);
        let active = self.store.register_active(&key);
        let loader = self.store.register_loader(
            &key,
            Arc::new(RegisteredLoader {
                raw: raw_loader(key.clone(), Arc::clone(&self.load_fn), param),
                options: TriggerOptions {
                    stale_time: self.config.stale_time,
                    force: false,
                },
            }),
        );
        coordinator::spawn_trigger(&self.store, &key, LoadMode::Load, &loader);

        SequentialQueryHandle {
            store: Arc::clone(&self.store),
            key,
            loader,
            initial_data: self.initial_data.clone(),
            _active: active,
            _types: PhantomData,
        }
    }
}

/// The type-erased load step for a sequential query. Dispatches on the
/// trigger mode: full replay, one appended page, or a first-page reset.
fn raw_loader<P, T, C, E>(
    key: CacheKey,
    load_fn: SequentialLoadFn<P, T, C, E>,
    param: P,
) -> RawLoader
where
    P: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    Arc::new(move |store, mode| {
        let key = key.clone();
        let load_fn = Arc::clone(&load_fn);
        let param = param.clone();
        async move {
            let outcome = match mode {
                LoadMode::Load => replay(&store, &key, &load_fn, &param).await,
                LoadMode::More => {
                    let pages = current_pages::<T>(&store, &key).unwrap_or_default();
                    page_step(&store, &key, &load_fn, &param, true, pages).await
                }
                LoadMode::Reload | LoadMode::PageReset => {
                    page_step(&store, &key, &load_fn, &param, false, Vec::new()).await
                }
            };
            outcome.map(|pages| Arc::new(pages) as ErasedValue)
        }
        .boxed()
    })
}

/// Loads one page and commits the grown accumulation.
///
/// Page one runs without a cursor; later pages continue from the cursor the
/// previous page committed.
async fn page_step<P, T, C, E>(
    store: &Arc<CacheStore>,
    key: &CacheKey,
    load_fn: &SequentialLoadFn<P, T, C, E>,
    param: &P,
    use_cursor: bool,
    mut pages: Vec<T>,
) -> Result<Vec<T>, ErasedValue>
where
    P: Clone,
    T: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let cursor = if use_cursor {
        stored_cursor::<C>(store, key)
    } else {
        None
    };

    match load_fn(param.clone(), cursor).await {
        Ok(page) => {
            pages.push(page.data);
            let data: ErasedValue = Arc::new(pages.clone());
            let cursor = page.cursor.map(|c| Arc::new(c) as ErasedValue);
            store.commit_page(key, data, cursor);
            Ok(pages)
        }
        Err(error) => Err(Arc::new(error) as ErasedValue),
    }
}

/// Re-requests every previously loaded page in order, rebuilding the
/// accumulation from scratch.
///
/// A failing page aborts the replay; the pages committed before it stay in
/// place, mirroring how a plain failed load keeps prior data.
async fn replay<P, T, C, E>(
    store: &Arc<CacheStore>,
    key: &CacheKey,
    load_fn: &SequentialLoadFn<P, T, C, E>,
    param: &P,
) -> Result<Vec<T>, ErasedValue>
where
    P: Clone,
    T: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let page_count = current_pages::<T>(store, key)
        .map(|pages| pages.len())
        .unwrap_or(1);

    let mut pages = Vec::new();
    for index in 0..page_count {
        pages = page_step(store, key, load_fn, param, index > 0, pages).await?;
    }
    Ok(pages)
}

fn current_pages<T>(store: &CacheStore, key: &CacheKey) -> Option<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    store
        .data(key)
        .and_then(|value| value.downcast::<Vec<T>>().ok())
        .map(|pages| (*pages).clone())
}

fn stored_cursor<C>(store: &CacheStore, key: &CacheKey) -> Option<C>
where
    C: Clone + Send + Sync + 'static,
{
    store
        .cursor(key)
        .and_then(|value| value.downcast::<C>().ok())
        .map(|cursor| (*cursor).clone())
}

/// One consumer's view of a sequential entry.
pub struct SequentialQueryHandle<T, C, E> {
    store: Arc<CacheStore>,
    key: CacheKey,
    loader: Arc<RegisteredLoader>,
    initial_data: Option<Arc<Vec<T>>>,
    _active: ActiveGuard,
    _types: PhantomData<fn() -> (T, C, E)>,
}

impl<T, C, E> SequentialQueryHandle<T, C, E>
where
    T: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
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

    /// The accumulated pages, or the configured initial pages before the
    /// first successful load.
    pub fn data(&self) -> Option<Arc<Vec<T>>> {
        self.store
            .data(&self.key)
            .and_then(|value| value.downcast::<Vec<T>>().ok())
            .or_else(|| self.initial_data.clone())
    }

    /// The error of the most recent failed load, if any.
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

    /// Whether another page is available.
    ///
    /// Indeterminate (`None`) while a load is in flight and before the first
    /// page has loaded; otherwise reflects whether the last page returned a
    /// cursor.
    pub fn has_more(&self) -> Option<bool> {
        if self.store.loading(&self.key) {
            None
        } else {
            self.store.has_more(&self.key)
        }
    }

    /// Fetches one more page and appends it to the accumulation.
    ///
    /// A no-op while a load is in flight or when no further page is
    /// available.
    pub async fn load_more(&self) {
        self.trigger(LoadMode::More).await;
    }

    /// Starts over with page one, discarding the accumulated pages.
    ///
    /// Gated like [`load_more`](SequentialQueryHandle::load_more).
    pub async fn reload(&self) {
        self.trigger(LoadMode::PageReset).await;
    }

    /// Waits until no load for this entry is in flight.
    pub async fn settled(&self) {
        self.store.await_settled(&self.key).await;
    }

    async fn trigger(&self, mode: LoadMode) {
        let raw = Arc::clone(&self.loader.raw);
        let store = Arc::clone(&self.store);
        coordinator::trigger(
            Arc::clone(&self.store),
            self.key.clone(),
            mode,
            self.loader.options,
            move || raw(store, mode),
        )
        .await;
    }
}
