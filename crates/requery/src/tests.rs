use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::test::{Gate, Script, drain, fresh_store, setup};
use crate::time;
use crate::{
    CacheKey, CacheStore, InvalidateOptions, Page, Query, SequentialQuery, SequentialQueryHandle,
};

fn counting_query(
    store: &Arc<CacheStore>,
    key: Vec<String>,
    calls: &Arc<AtomicUsize>,
) -> Query<(), u32, String> {
    let calls = Arc::clone(calls);
    Query::new(store, key, move |_: ()| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(1)
        }
    })
}

fn segments(key: &[&str]) -> Vec<String> {
    key.iter().map(|s| (*s).to_owned()).collect()
}

fn pages(handle: &SequentialQueryHandle<String, u32, String>) -> Vec<String> {
    handle.data().map(|pages| (*pages).clone()).unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn reload_replaces_data_end_to_end() {
    setup();
    let store = fresh_store();
    let script = Arc::new(Script::new([Ok::<u32, String>(1), Ok(2)]));
    let query = Query::new(&store, ["x"], {
        let script = Arc::clone(&script);
        move |_: ()| {
            let script = Arc::clone(&script);
            async move { script.next() }
        }
    });

    let handle = query.fetch(());
    assert!(handle.loading());
    assert_eq!(handle.data(), None);

    handle.settled().await;
    assert!(!handle.loading());
    assert_eq!(handle.data().as_deref(), Some(&1));
    assert!(handle.error().is_none());

    handle.reload().await;
    assert!(!handle.loading());
    assert_eq!(handle.data().as_deref(), Some(&2));
    assert!(handle.error().is_none());
    assert_eq!(script.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_load_once() {
    setup();
    let store = fresh_store();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Gate::new();
    let query = Query::new(&store, ["things"], {
        let calls = Arc::clone(&calls);
        let gate = gate.clone();
        move |_: ()| {
            let calls = Arc::clone(&calls);
            let gate = gate.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                gate.wait().await;
                Ok::<_, String>(42u32)
            }
        }
    });

    let first = query.fetch(());
    let second = query.fetch(());
    futures::join!(first.reload(), second.reload(), first.reload());

    gate.open();
    first.settled().await;

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(first.data().as_deref(), Some(&42));
    assert_eq!(second.data().as_deref(), Some(&42));
}

#[tokio::test(start_paused = true)]
async fn staleness_gates_repeat_loads() {
    setup();
    let store = fresh_store();
    let script = Arc::new(Script::new([Ok::<u32, String>(1), Ok(2)]));
    let query = Query::new(&store, ["n"], {
        let script = Arc::clone(&script);
        move |_: ()| {
            let script = Arc::clone(&script);
            async move { script.next() }
        }
    })
    .stale_time(Duration::from_millis(100));

    let handle = query.fetch(());
    handle.settled().await;
    assert_eq!(script.calls(), 1);

    // One tick before stale: suppressed.
    time::advance(Duration::from_millis(99)).await;
    handle.reload().await;
    assert_eq!(script.calls(), 1);
    assert_eq!(handle.data().as_deref(), Some(&1));

    // Exactly at the stale timestamp: reloads.
    time::advance(Duration::from_millis(1)).await;
    handle.reload().await;
    assert_eq!(script.calls(), 2);
    assert_eq!(handle.data().as_deref(), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn failed_reload_keeps_data() {
    setup();
    let store = fresh_store();
    let script = Arc::new(Script::new([
        Ok(7u32),
        Err("boom".to_owned()),
        Ok(8),
    ]));
    let query = Query::new(&store, ["fragile"], {
        let script = Arc::clone(&script);
        move |_: ()| {
            let script = Arc::clone(&script);
            async move { script.next() }
        }
    });

    let handle = query.fetch(());
    handle.settled().await;
    assert_eq!(handle.data().as_deref(), Some(&7));

    handle.reload().await;
    assert_eq!(handle.data().as_deref(), Some(&7));
    assert_eq!(handle.error().as_deref(), Some(&"boom".to_owned()));
    assert!(!handle.loading());

    // The next load clears the error before it runs.
    handle.reload().await;
    assert!(handle.error().is_none());
    assert_eq!(handle.data().as_deref(), Some(&8));
}

#[tokio::test(start_paused = true)]
async fn invalidation_scope_is_segment_wise() {
    setup();
    let store = fresh_store();

    let calls_a_b = Arc::new(AtomicUsize::new(0));
    let calls_a = Arc::new(AtomicUsize::new(0));
    let calls_lookalike = Arc::new(AtomicUsize::new(0));

    let q_a_b = counting_query(&store, segments(&["a", "b"]), &calls_a_b);
    let q_a = counting_query(&store, segments(&["a"]), &calls_a);
    let q_lookalike = counting_query(&store, segments(&["ab"]), &calls_lookalike);

    let h_a_b = q_a_b.fetch(());
    let h_a = q_a.fetch(());
    let h_lookalike = q_lookalike.fetch(());
    h_a_b.settled().await;
    h_a.settled().await;
    h_lookalike.settled().await;

    store.invalidate(&["a"], InvalidateOptions::default());
    assert!(!h_lookalike.loading());
    h_a_b.settled().await;
    h_a.settled().await;
    drain().await;

    assert_eq!(calls_a_b.load(Ordering::Relaxed), 2);
    assert_eq!(calls_a.load(Ordering::Relaxed), 2);
    assert_eq!(calls_lookalike.load(Ordering::Relaxed), 1);

    // Exact matching only covers the identical key.
    store.invalidate(
        &["a"],
        InvalidateOptions {
            exact: true,
            ..Default::default()
        },
    );
    h_a.settled().await;
    drain().await;

    assert_eq!(calls_a.load(Ordering::Relaxed), 3);
    assert_eq!(calls_a_b.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn inactive_keys_reload_lazily() {
    setup();
    let store = fresh_store();
    let calls = Arc::new(AtomicUsize::new(0));
    let query =
        counting_query(&store, segments(&["idle"]), &calls).stale_time(Duration::from_secs(3600));

    let handle = query.fetch(());
    handle.settled().await;
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    drop(handle);

    // No active consumer: the key is only marked stale.
    store.invalidate(&["idle"], InvalidateOptions::default());
    assert!(!store.is_loading());
    drain().await;
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    // The next mount sees the stale entry and reloads despite the long
    // stale time.
    let handle = query.fetch(());
    handle.settled().await;
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn forced_invalidation_clears_state() {
    setup();
    let store = fresh_store();
    let script = Arc::new(Script::new([Ok::<u32, String>(1), Ok(2)]));
    let query = Query::new(&store, ["k"], {
        let script = Arc::clone(&script);
        move |_: ()| {
            let script = Arc::clone(&script);
            async move { script.next() }
        }
    })
    .stale_time(Duration::from_secs(3600));

    let handle = query.fetch(());
    handle.settled().await;
    assert_eq!(handle.data().as_deref(), Some(&1));
    drop(handle);

    store.invalidate(
        &["k"],
        InvalidateOptions {
            force: true,
            ..Default::default()
        },
    );
    assert!(store.cached_keys().is_empty());

    let handle = query.fetch(());
    handle.settled().await;
    assert_eq!(handle.data().as_deref(), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn unknown_keys_are_a_silent_no_op() {
    setup();
    let store = fresh_store();
    store.invalidate(&["nope"], InvalidateOptions::default());
    store.invalidate(
        &["nope"],
        InvalidateOptions {
            force: true,
            exact: true,
        },
    );
    assert!(store.cached_keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn introspection_reports_decoded_keys() {
    setup();
    let store = fresh_store();
    let gate = Gate::new();
    let query = Query::new(&store, ["slow", "q"], {
        let gate = gate.clone();
        move |_: ()| {
            let gate = gate.clone();
            async move {
                gate.wait().await;
                Ok::<_, String>(1u32)
            }
        }
    });

    let handle = query.fetch(());
    let key = CacheKey::new(["slow", "q"]);

    assert!(store.is_loading());
    assert_eq!(store.loading_keys(), vec![key.clone()]);
    assert_eq!(store.active_keys(), vec![key.clone()]);
    assert!(store.cached_keys().is_empty());

    gate.open();
    handle.settled().await;

    assert!(!store.is_loading());
    assert!(store.loading_keys().is_empty());
    assert_eq!(store.cached_keys(), vec![key.clone()]);

    // Detaching the consumer keeps the entry cached.
    drop(handle);
    assert!(store.active_keys().is_empty());
    assert_eq!(store.cached_keys(), vec![key]);
}

#[tokio::test(start_paused = true)]
async fn structurally_equal_params_share_an_entry() {
    setup();

    #[derive(Clone, Serialize)]
    struct Filter {
        page: u32,
        tag: &'static str,
    }

    let store = fresh_store();
    let calls = Arc::new(AtomicUsize::new(0));
    let query = Query::new(&store, ["posts"], {
        let calls = Arc::clone(&calls);
        move |_: Filter| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok::<_, String>(1u32)
            }
        }
    })
    .stale_time(Duration::from_secs(3600));

    let first = query.fetch(Filter { page: 1, tag: "rust" });
    first.settled().await;
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    // Same structural content resolves to the same fresh entry.
    let second = query.fetch(Filter { page: 1, tag: "rust" });
    second.settled().await;
    assert_eq!(second.key(), first.key());
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    // Different content is a different entry.
    let third = query.fetch(Filter { page: 2, tag: "rust" });
    third.settled().await;
    assert_ne!(third.key(), first.key());
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn sequential_replay_rebuilds_pages() {
    setup();
    let store = fresh_store();
    let calls = Arc::new(AtomicUsize::new(0));
    let query = SequentialQuery::new(&store, ["feed"], {
        let calls = Arc::clone(&calls);
        move |_: (), cursor: Option<u32>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                let n = cursor.unwrap_or(0);
                Ok::<_, String>(Page {
                    data: format!("page-{n}"),
                    cursor: (n < 2).then_some(n + 1),
                })
            }
        }
    });

    let handle = query.fetch(());
    handle.settled().await;
    assert_eq!(pages(&handle), ["page-0"]);
    assert_eq!(handle.has_more(), Some(true));
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    handle.load_more().await;
    assert_eq!(pages(&handle), ["page-0", "page-1"]);
    assert_eq!(calls.load(Ordering::Relaxed), 2);

    // Invalidation replays both pages in order, page one first, page two
    // with the cursor page one just returned.
    store.invalidate(&["feed"], InvalidateOptions::default());
    handle.settled().await;
    assert_eq!(calls.load(Ordering::Relaxed), 4);
    assert_eq!(pages(&handle), ["page-0", "page-1"]);
    assert_eq!(handle.has_more(), Some(true));

    handle.load_more().await;
    assert_eq!(pages(&handle), ["page-0", "page-1", "page-2"]);
    assert_eq!(handle.has_more(), Some(false));
    assert_eq!(calls.load(Ordering::Relaxed), 5);

    // Nothing further to load: both triggers are suppressed.
    handle.load_more().await;
    handle.reload().await;
    assert_eq!(calls.load(Ordering::Relaxed), 5);
}

#[tokio::test(start_paused = true)]
async fn sequential_reload_resets_to_page_one() {
    setup();
    let store = fresh_store();
    let query = SequentialQuery::new(&store, ["list"], {
        move |_: (), cursor: Option<u32>| async move {
            let n = cursor.unwrap_or(0);
            Ok::<_, String>(Page {
                data: format!("page-{n}"),
                cursor: Some(n + 1),
            })
        }
    });

    let handle = query.fetch(());
    handle.settled().await;
    handle.load_more().await;
    handle.load_more().await;
    assert_eq!(pages(&handle), ["page-0", "page-1", "page-2"]);

    handle.reload().await;
    assert_eq!(pages(&handle), ["page-0"]);
    assert_eq!(handle.has_more(), Some(true));
}

#[tokio::test(start_paused = true)]
async fn replay_failure_keeps_earlier_pages() {
    setup();
    let store = fresh_store();
    let fail_later_pages = Arc::new(AtomicBool::new(false));
    let query = SequentialQuery::new(&store, ["wobbly"], {
        let fail_later_pages = Arc::clone(&fail_later_pages);
        move |_: (), cursor: Option<u32>| {
            let fail_later_pages = Arc::clone(&fail_later_pages);
            async move {
                if cursor.is_some() && fail_later_pages.load(Ordering::Relaxed) {
                    return Err("page gone".to_owned());
                }
                let n = cursor.unwrap_or(0);
                Ok(Page {
                    data: format!("page-{n}"),
                    cursor: Some(n + 1),
                })
            }
        }
    });

    let handle = query.fetch(());
    handle.settled().await;
    handle.load_more().await;
    assert_eq!(pages(&handle), ["page-0", "page-1"]);

    // The replay aborts at page two; page one's fresh data stays committed.
    fail_later_pages.store(true, Ordering::Relaxed);
    store.invalidate(&["wobbly"], InvalidateOptions::default());
    handle.settled().await;

    assert_eq!(pages(&handle), ["page-0"]);
    assert_eq!(handle.error().as_deref(), Some(&"page gone".to_owned()));
    assert!(!handle.loading());
}

#[tokio::test(start_paused = true)]
async fn has_more_is_indeterminate_while_loading() {
    setup();
    let store = fresh_store();
    let gate = Gate::new();
    let query = SequentialQuery::new(&store, ["stream"], {
        let gate = gate.clone();
        move |_: (), cursor: Option<u32>| {
            let gate = gate.clone();
            async move {
                gate.wait().await;
                let n = cursor.unwrap_or(0);
                Ok::<_, String>(Page {
                    data: format!("page-{n}"),
                    cursor: Some(n + 1),
                })
            }
        }
    });

    let handle = query.fetch(());
    assert!(handle.loading());
    assert_eq!(handle.has_more(), None);

    gate.open();
    handle.settled().await;
    assert_eq!(handle.has_more(), Some(true));
}

#[tokio::test(start_paused = true)]
async fn initial_data_is_reported_before_first_load() {
    setup();
    let store = fresh_store();
    let gate = Gate::new();
    let query = Query::new(&store, ["profile"], {
        let gate = gate.clone();
        move |_: ()| {
            let gate = gate.clone();
            async move {
                gate.wait().await;
                Ok::<_, String>(2u32)
            }
        }
    })
    .initial_data(1);

    let handle = query.fetch(());
    assert_eq!(handle.data().as_deref(), Some(&1));

    gate.open();
    handle.settled().await;
    assert_eq!(handle.data().as_deref(), Some(&2));
}
