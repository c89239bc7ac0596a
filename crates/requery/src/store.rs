use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use crate::cache_key::CacheKey;
use crate::coordinator::RegisteredLoader;
use crate::time::Instant;

/// A type-erased, shared value slot.
///
/// The store holds data, errors and cursors of arbitrary query types; the
/// typed handles downcast on access.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Per-key entry state.
///
/// Entries are created lazily when a key is first touched and stay cached
/// until the store is reset. All fields are mutated under the store lock,
/// never across a suspension point.
#[derive(Default)]
pub(crate) struct EntryState {
    /// Last successfully loaded value. A failed load leaves this untouched.
    pub data: Option<ErasedValue>,
    /// Error of the most recent failed load, cleared when a new load begins.
    pub error: Option<ErasedValue>,
    /// The mutual-exclusion gate: true while a load for this key is in
    /// flight.
    pub loading: bool,
    /// When the last successful load committed.
    pub loaded_at: Option<Instant>,
    /// When the entry turns stale. Unset means stale if never loaded, and
    /// fresh forever once loaded.
    pub stale_at: Option<Instant>,
    /// Cursor returned by the most recent page load (sequential queries).
    pub cursor: Option<ErasedValue>,
    /// Whether another page is available (sequential queries).
    pub has_more: Option<bool>,
    /// Number of consumers currently observing this key.
    pub active: usize,
    /// Wakes consumers waiting for this entry to settle.
    pub notify: Arc<Notify>,
}

/// Process-wide table of cache entries, active-consumer counts and registered
/// loaders.
///
/// The store is an explicit object rather than a hidden singleton: construct
/// one per process (or per test) and share it via [`Arc`]. All mutations are
/// synchronous sections under an internal lock, which keeps the
/// one-load-in-flight guarantee intact on multi-threaded runtimes.
pub struct CacheStore {
    entries: Mutex<FxHashMap<CacheKey, EntryState>>,
    loaders: Mutex<FxHashMap<CacheKey, Arc<RegisteredLoader>>>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock().unwrap().len();
        let loaders = self.loaders.lock().unwrap().len();
        f.debug_struct("CacheStore")
            .field("entries", &entries)
            .field("loaders", &loaders)
            .finish()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        CacheStore {
            entries: Mutex::new(FxHashMap::default()),
            loaders: Mutex::new(FxHashMap::default()),
        }
    }

    /// Drops every entry and registered loader.
    ///
    /// Intended for test isolation; consumers holding handles will observe
    /// empty state afterwards.
    pub fn reset(&self) {
        self.entries.lock().unwrap().clear();
        self.loaders.lock().unwrap().clear();
    }

    /// Runs `f` on the entry for `key`, creating it if needed.
    pub(crate) fn with_entry<R>(&self, key: &CacheKey, f: impl FnOnce(&mut EntryState) -> R) -> R {
        let mut entries = self.entries.lock().unwrap();
        f(entries.entry(key.clone()).or_default())
    }

    /// Runs `f` on the entry for `key` if it exists.
    fn read_entry<R>(&self, key: &CacheKey, f: impl FnOnce(&EntryState) -> R) -> Option<R> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).map(f)
    }

    /// Whether a load for `key` is currently in flight.
    pub fn loading(&self, key: &CacheKey) -> bool {
        self.read_entry(key, |entry| entry.loading).unwrap_or(false)
    }

    pub(crate) fn data(&self, key: &CacheKey) -> Option<ErasedValue> {
        self.read_entry(key, |entry| entry.data.clone()).flatten()
    }

    pub(crate) fn error(&self, key: &CacheKey) -> Option<ErasedValue> {
        self.read_entry(key, |entry| entry.error.clone()).flatten()
    }

    pub(crate) fn cursor(&self, key: &CacheKey) -> Option<ErasedValue> {
        self.read_entry(key, |entry| entry.cursor.clone()).flatten()
    }

    /// When the last successful load for `key` committed.
    pub fn loaded_at(&self, key: &CacheKey) -> Option<Instant> {
        self.read_entry(key, |entry| entry.loaded_at).flatten()
    }

    /// When the entry for `key` turns stale.
    pub fn stale_at(&self, key: &CacheKey) -> Option<Instant> {
        self.read_entry(key, |entry| entry.stale_at).flatten()
    }

    /// Raw has-more flag for `key`, regardless of loading state.
    pub(crate) fn has_more(&self, key: &CacheKey) -> Option<bool> {
        self.read_entry(key, |entry| entry.has_more).flatten()
    }

    /// Commits one page of a sequential load: the accumulated data so far,
    /// the cursor the page returned, and the derived has-more flag.
    pub(crate) fn commit_page(
        &self,
        key: &CacheKey,
        data: ErasedValue,
        cursor: Option<ErasedValue>,
    ) {
        self.with_entry(key, |entry| {
            entry.has_more = Some(cursor.is_some());
            entry.cursor = cursor;
            entry.data = Some(data);
            entry.notify.notify_waiters();
        });
    }

    /// Registers a consumer observing `key` and returns the guard that ends
    /// the observation when dropped.
    pub fn register_active(self: &Arc<Self>, key: &CacheKey) -> ActiveGuard {
        self.with_entry(key, |entry| entry.active += 1);
        ActiveGuard {
            store: Arc::clone(self),
            key: key.clone(),
        }
    }

    /// Number of consumers currently observing `key`.
    pub fn active_count(&self, key: &CacheKey) -> usize {
        self.read_entry(key, |entry| entry.active).unwrap_or(0)
    }

    pub(crate) fn release_active(&self, key: &CacheKey) {
        self.with_entry(key, |entry| entry.active = entry.active.saturating_sub(1));
    }

    /// Registers the loader for `key` unless one is already present, and
    /// returns the one that ends up registered.
    ///
    /// The first registration wins: every later trigger for this key, no
    /// matter which consumer issues it, re-runs the same logical request with
    /// the originally captured parameter.
    pub(crate) fn register_loader(
        &self,
        key: &CacheKey,
        loader: Arc<RegisteredLoader>,
    ) -> Arc<RegisteredLoader> {
        let mut loaders = self.loaders.lock().unwrap();
        Arc::clone(loaders.entry(key.clone()).or_insert(loader))
    }

    pub(crate) fn loader(&self, key: &CacheKey) -> Option<Arc<RegisteredLoader>> {
        self.loaders.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn entry_notify(&self, key: &CacheKey) -> Arc<Notify> {
        self.with_entry(key, |entry| Arc::clone(&entry.notify))
    }

    /// Waits until no load for `key` is in flight.
    ///
    /// Interest in the notification is registered before the loading flag is
    /// re-checked, so a settle between the two cannot be missed.
    pub(crate) async fn await_settled(&self, key: &CacheKey) {
        loop {
            let notify = self.entry_notify(key);
            let mut notified = std::pin::pin!(notify.notified());
            notified.as_mut().enable();
            if !self.loading(key) {
                return;
            }
            notified.await;
        }
    }

    /// Whether any key currently has a load in flight.
    pub fn is_loading(&self) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.values().any(|entry| entry.loading)
    }

    /// Keys with a load currently in flight.
    pub fn loading_keys(&self) -> Vec<CacheKey> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, entry)| entry.loading)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys with at least one active consumer.
    pub fn active_keys(&self) -> Vec<CacheKey> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, entry)| entry.active > 0)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys holding cached data.
    pub fn cached_keys(&self) -> Vec<CacheKey> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, entry)| entry.data.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Stored keys matching a segment prefix.
    pub(crate) fn matching_keys<S: AsRef<str>>(&self, prefix: &[S], exact: bool) -> Vec<CacheKey> {
        let entries = self.entries.lock().unwrap();
        entries
            .keys()
            .filter(|key| key.matches_prefix(prefix, exact))
            .cloned()
            .collect()
    }
}

/// Guard representing one active consumer of a key.
///
/// Dropping the guard decrements the key's active count; the count is
/// floor-clamped at zero. The cached entry itself stays alive.
pub struct ActiveGuard {
    store: Arc<CacheStore>,
    key: CacheKey,
}

impl fmt::Debug for ActiveGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveGuard").field("key", &self.key).finish()
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.store.release_active(&self.key);
    }
}
