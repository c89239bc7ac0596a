//! Helpers for testing code built on the query cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - Loads run as spawned tasks. Prefer waiting on a handle's `settled()`
//!    over sleeping; for negative assertions ("this key did not reload"),
//!    [`drain`] gives pending tasks a chance to run first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use crate::CacheStore;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `requery`
///    crate and mutes everything else.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("requery=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates an isolated cache store.
pub fn fresh_store() -> Arc<CacheStore> {
    Arc::new(CacheStore::new())
}

/// Yields to the runtime a few times so spawned loads can run.
pub async fn drain() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// A barrier that holds loader futures in flight until opened.
///
/// Loads awaiting [`wait`](Gate::wait) stay pending, which keeps their
/// entries in the loading state; [`open`](Gate::open) releases all of them,
/// including ones that start waiting afterwards.
#[derive(Clone)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Gate { open: Arc::new(tx) }
    }

    /// Releases all current and future waiters.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Scripted loader outcomes with an invocation counter.
///
/// Each [`next`](Script::next) call consumes the front of the script.
///
/// # Panics
///
/// [`next`](Script::next) panics when the script is exhausted; give each test
/// exactly as many outcomes as it expects loads.
pub struct Script<T, E> {
    results: Mutex<VecDeque<Result<T, E>>>,
    calls: AtomicUsize,
}

impl<T, E> Script<T, E> {
    /// Creates a script from the given outcomes.
    pub fn new(results: impl IntoIterator<Item = Result<T, E>>) -> Self {
        Script {
            results: Mutex::new(results.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Consumes and returns the next outcome.
    pub fn next(&self) -> Result<T, E> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .expect("load script exhausted")
    }

    /// How many times the script has been consumed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}
