use std::sync::Arc;

use crate::coordinator::{self, LoadMode};
use crate::store::CacheStore;
use crate::time::Instant;

/// Options for [`CacheStore::invalidate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidateOptions {
    /// Also clear the matching entries' data, error, in-flight flag and
    /// pagination bookkeeping right away, instead of only marking them
    /// stale.
    pub force: bool,
    /// Match only the exact key instead of every key under the prefix.
    pub exact: bool,
}

impl CacheStore {
    /// Marks matching keys stale and reloads the ones that are in use.
    ///
    /// Matching is segment-wise over the stored key sequences: the prefix
    /// `["a"]` covers `["a"]` and `["a", "b"]` but never `["ab"]`. Every
    /// matching key is marked stale regardless of its active count. Keys with
    /// at least one active consumer additionally get their registered loader
    /// run immediately (as a spawned task, de-duplicated through the usual
    /// gate); keys nobody observes stay stale and reload lazily on their next
    /// mount.
    ///
    /// Invalidating a prefix that matches nothing is a silent no-op.
    ///
    /// Must be called within a tokio runtime.
    pub fn invalidate<S: AsRef<str>>(self: &Arc<Self>, prefix: &[S], options: InvalidateOptions) {
        let now = Instant::now();
        let matching = self.matching_keys(prefix, options.exact);
        tracing::debug!(
            matches = matching.len(),
            force = options.force,
            exact = options.exact,
            "invalidating queries"
        );

        let mut to_reload = Vec::new();
        for key in &matching {
            self.with_entry(key, |entry| {
                entry.stale_at = Some(now);
                if options.force {
                    entry.loading = false;
                    entry.data = None;
                    entry.error = None;
                    entry.cursor = None;
                    entry.has_more = None;
                }
                entry.notify.notify_waiters();
                if entry.active > 0 {
                    to_reload.push(key.clone());
                }
            });
        }

        for key in to_reload {
            if let Some(loader) = self.loader(&key) {
                coordinator::spawn_trigger(self, &key, LoadMode::Load, &loader);
            }
        }
    }
}
