//! Multiplexer Invariant Tests
//!
//! Tests for the delivery guarantees of the observe multiplexer:
//! - Exactly-once, gap-free delivery across the attach boundary
//! - Attach blocks until readiness
//! - Reentrancy and lifecycle guards
//! - Teardown runs exactly once

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use observe_multiplex::multiplex::{
    CachingChangeObserver, ChangeEvent, Document, DocumentId, FieldChange, FieldDelta,
    MultiplexError, MultiplexerConfig, ObserveCallbacks, ObserveHandle, ObserveMultiplexer,
    ObserverOptions, OrderingMode,
};
use observe_multiplex::observability::MetricsRegistry;
use serde_json::{json, Value};

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        other => panic!("expected object, got {}", other),
    }
}

fn set(key: &str, value: Value) -> FieldDelta {
    let mut delta = FieldDelta::new();
    delta.insert(key.to_string(), FieldChange::Set(value));
    delta
}

fn build(mode: OrderingMode) -> Arc<ObserveMultiplexer> {
    ObserveMultiplexer::builder(MultiplexerConfig::with_mode(mode))
        .metrics(Arc::new(MetricsRegistry::new()))
        .build()
        .unwrap()
}

type Failures = Arc<Mutex<Vec<MultiplexError>>>;

/// Multiplexer whose task failures are collected
fn build_with_failures(mode: OrderingMode) -> (Arc<ObserveMultiplexer>, Failures) {
    let failures: Failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    let mux = ObserveMultiplexer::builder(MultiplexerConfig::with_mode(mode))
        .metrics(Arc::new(MetricsRegistry::new()))
        .on_task_error(move |e| sink.lock().unwrap().push(e.clone()))
        .build()
        .unwrap();
    (mux, failures)
}

type Log = Arc<Mutex<Vec<String>>>;

/// Callbacks that record `kind:id` for every delivery
fn recorder() -> (ObserveCallbacks, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (a, ab, c, m, r) = (
        Arc::clone(&log),
        Arc::clone(&log),
        Arc::clone(&log),
        Arc::clone(&log),
        Arc::clone(&log),
    );
    let callbacks = ObserveCallbacks::new()
        .added(move |id, _| a.lock().unwrap().push(format!("added:{}", id)))
        .added_before(move |id, _, before| {
            let before = before.map(|b| b.to_string()).unwrap_or_else(|| "end".into());
            ab.lock().unwrap().push(format!("addedBefore:{}:{}", id, before))
        })
        .changed(move |id, _| c.lock().unwrap().push(format!("changed:{}", id)))
        .moved_before(move |id, _| m.lock().unwrap().push(format!("movedBefore:{}", id)))
        .removed(move |id| r.lock().unwrap().push(format!("removed:{}", id)));
    (callbacks, log)
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

// =============================================================================
// Scenarios
// =============================================================================

/// Unordered: replay carries the cache, live events follow.
#[test]
fn test_scenario_unordered_replay_then_live() {
    let mux = build(OrderingMode::Unordered);
    mux.added("x", doc(json!({"a": 1}))).unwrap();
    mux.mark_ready().unwrap();

    let (callbacks, log) = recorder();
    let _handle = mux.observe(callbacks).unwrap();
    assert_eq!(entries(&log), vec!["added:x"]);

    mux.changed("x", set("a", json!(2))).unwrap();
    mux.flush().unwrap();

    assert_eq!(entries(&log), vec!["added:x", "changed:x"]);
    assert_eq!(
        mux.cached_documents().unwrap(),
        vec![(DocumentId::from("x"), doc(json!({"a": 2})))]
    );
}

/// Ordered: replay follows sequence order and moves are reflected.
#[test]
fn test_scenario_ordered_replay_order() {
    let mux = build(OrderingMode::Ordered);
    mux.added_before("a", Document::new(), None).unwrap();
    mux.added_before("b", Document::new(), Some("a".into()))
        .unwrap();
    mux.mark_ready().unwrap();

    let (callbacks, first) = recorder();
    let _h1 = mux.observe(callbacks).unwrap();
    assert_eq!(
        entries(&first),
        vec!["addedBefore:b:end", "addedBefore:a:end"]
    );

    mux.moved_before("b", None).unwrap();

    let (callbacks, second) = recorder();
    let _h2 = mux.observe(callbacks).unwrap();
    assert_eq!(
        entries(&second),
        vec!["addedBefore:a:end", "addedBefore:b:end"]
    );
    assert_eq!(
        entries(&first),
        vec!["addedBefore:b:end", "addedBefore:a:end", "movedBefore:b"]
    );
}

/// Attach before ready blocks; detach meanwhile is a protocol violation.
#[test]
fn test_scenario_attach_blocks_until_ready() {
    let mux = build(OrderingMode::Unordered);
    let (tx, rx) = mpsc::channel();

    let attaching = Arc::clone(&mux);
    let worker = thread::spawn(move || {
        let result = attaching.observe(ObserveCallbacks::new());
        tx.send(()).unwrap();
        result
    });

    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err(), "attach returned before ready");

    let stray = ObserveHandle::new(&mux, ObserveCallbacks::new());
    assert!(matches!(
        mux.detach(stray.id()),
        Err(MultiplexError::ProtocolViolation(_))
    ));

    mux.mark_ready().unwrap();
    let handle = worker.join().unwrap().unwrap();
    assert_eq!(mux.handle_count(), 1);
    assert!(!handle.is_stopped());
}

/// Changed for an unknown id fails and reaches no handle.
#[test]
fn test_scenario_changed_unknown_id() {
    let (mux, failures) = build_with_failures(OrderingMode::Unordered);
    mux.mark_ready().unwrap();

    let (callbacks, log) = recorder();
    let _handle = mux.observe(callbacks).unwrap();

    mux.changed("z", set("a", json!(1))).unwrap();
    mux.flush().unwrap();

    assert!(entries(&log).is_empty());
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0], MultiplexError::ProtocolViolation(_)));
}

/// Before readiness only inserts may arrive; the cache still takes the change.
#[test]
fn test_non_insert_before_ready_is_rejected() {
    let (mux, failures) = build_with_failures(OrderingMode::Unordered);
    mux.added("a", doc(json!({"n": 1}))).unwrap();

    let (callbacks, log) = recorder();
    let handle = ObserveHandle::new(&mux, callbacks);
    let ticket = mux.begin_attach(&handle).unwrap();

    mux.changed("a", set("n", json!(2))).unwrap();
    mux.mark_ready().unwrap();
    ticket.wait().unwrap();
    mux.flush().unwrap();

    assert_eq!(entries(&log), vec!["added:a"]);
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    match &failures[0] {
        MultiplexError::ProtocolViolation(msg) => {
            assert!(msg.contains("during initial adds"), "unexpected message: {}", msg)
        }
        other => panic!("expected protocol violation, got {:?}", other),
    }
    assert_eq!(
        mux.cached_documents().unwrap(),
        vec![(DocumentId::from("a"), doc(json!({"n": 2})))]
    );
}

/// Unordered mode overwrites on re-insert and ignores removal of absent
/// ids; every event is still broadcast.
#[test]
fn test_unordered_map_semantics_are_broadcast() {
    let (mux, failures) = build_with_failures(OrderingMode::Unordered);
    mux.mark_ready().unwrap();
    let (callbacks, log) = recorder();
    let _handle = mux.observe(callbacks).unwrap();

    mux.removed("ghost").unwrap();
    mux.added("x", doc(json!({"a": 1}))).unwrap();
    mux.added("x", doc(json!({"a": 2}))).unwrap();
    mux.flush().unwrap();

    assert_eq!(entries(&log), vec!["removed:ghost", "added:x", "added:x"]);
    assert!(failures.lock().unwrap().is_empty());
    assert_eq!(
        mux.cached_documents().unwrap(),
        vec![(DocumentId::from("x"), doc(json!({"a": 2})))]
    );
}

/// Ordered mode rejects the same events and delivers nothing for them.
#[test]
fn test_ordered_rejects_duplicate_and_absent_ids() {
    let (mux, failures) = build_with_failures(OrderingMode::Ordered);
    mux.mark_ready().unwrap();
    let (callbacks, log) = recorder();
    let _handle = mux.observe(callbacks).unwrap();

    mux.removed("ghost").unwrap();
    mux.added_before("x", doc(json!({"a": 1})), None).unwrap();
    mux.added_before("x", doc(json!({"a": 2})), None).unwrap();
    mux.flush().unwrap();

    assert_eq!(entries(&log), vec!["addedBefore:x:end"]);
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures
        .iter()
        .all(|e| matches!(e, MultiplexError::ProtocolViolation(_))));
    assert_eq!(
        mux.cached_documents().unwrap(),
        vec![(DocumentId::from("x"), doc(json!({"a": 1})))]
    );
}

// =============================================================================
// Delivery Guarantees
// =============================================================================

/// A handle attached mid-stream sees every document exactly once.
#[test]
fn test_exactly_once_across_attach_boundary() {
    const TOTAL: usize = 500;
    let mux = build(OrderingMode::Unordered);
    mux.mark_ready().unwrap();

    let feeder_mux = Arc::clone(&mux);
    let feeder = thread::spawn(move || {
        for i in 0..TOTAL {
            feeder_mux
                .added(format!("doc-{}", i), doc(json!({"i": i})))
                .unwrap();
        }
    });

    thread::sleep(Duration::from_millis(1));
    let (callbacks, log) = recorder();
    let _handle = mux.observe(callbacks).unwrap();

    feeder.join().unwrap();
    mux.flush().unwrap();

    let seen = entries(&log);
    let unique: HashSet<&String> = seen.iter().collect();
    assert_eq!(seen.len(), TOTAL);
    assert_eq!(unique.len(), TOTAL);
}

/// Attach waits even when mark_ready is queued after it.
#[test]
fn test_attach_waits_for_ready_queued_later() {
    let mux = build(OrderingMode::Unordered);
    mux.added("early", Document::new()).unwrap();

    let (callbacks, log) = recorder();
    let handle = ObserveHandle::new(&mux, callbacks);
    let ticket = mux.begin_attach(&handle).unwrap();

    mux.added("late", Document::new()).unwrap();
    mux.mark_ready().unwrap();
    ticket.wait().unwrap();

    mux.flush().unwrap();
    assert_eq!(entries(&log), vec!["added:early", "added:late"]);
}

/// Attaching from inside a callback fails instead of deadlocking.
#[test]
fn test_reentrant_attach_fails() {
    let mux = build(OrderingMode::Unordered);
    mux.mark_ready().unwrap();

    let outcome: Arc<Mutex<Option<MultiplexResultSlot>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    let inner = Arc::clone(&mux);
    let _handle = mux
        .observe(ObserveCallbacks::new().added(move |_, _| {
            let result = inner.observe(ObserveCallbacks::new()).map(|_| ());
            *slot.lock().unwrap() = Some(result);
        }))
        .unwrap();

    mux.added("trigger", Document::new()).unwrap();
    mux.flush().unwrap();

    let outcome = outcome.lock().unwrap().take().unwrap();
    assert!(matches!(
        outcome,
        Err(MultiplexError::ReentrancyViolation(_))
    ));
}

type MultiplexResultSlot = Result<(), MultiplexError>;

/// A handle stopped by an earlier callback in the same broadcast is skipped.
#[test]
fn test_handle_stopped_mid_broadcast_is_skipped() {
    let mux = build(OrderingMode::Unordered);
    mux.mark_ready().unwrap();

    let victim: Arc<Mutex<Option<ObserveHandle>>> = Arc::new(Mutex::new(None));
    let target = Arc::clone(&victim);
    let _stopper = mux
        .observe(ObserveCallbacks::new().added(move |_, _| {
            if let Some(handle) = target.lock().unwrap().as_ref() {
                handle.stop().unwrap();
            }
        }))
        .unwrap();

    let (callbacks, log) = recorder();
    *victim.lock().unwrap() = Some(mux.observe(callbacks).unwrap());

    mux.added("x", Document::new()).unwrap();
    mux.flush().unwrap();

    assert!(entries(&log).is_empty());
    assert_eq!(mux.handle_count(), 1);
    assert!(!mux.is_stopped());
}

/// Each handle gets its own copy of the payload.
#[test]
fn test_handles_receive_independent_copies() {
    let mux = build(OrderingMode::Unordered);
    mux.mark_ready().unwrap();

    let _mutator = mux
        .observe(ObserveCallbacks::new().added(|_, mut fields| {
            fields.insert("tampered".into(), json!(true));
        }))
        .unwrap();

    let received: Arc<Mutex<Vec<Document>>> = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&received);
    let _reader = mux
        .observe(ObserveCallbacks::new().added(move |_, fields| store.lock().unwrap().push(fields)))
        .unwrap();

    mux.added("x", doc(json!({"a": {"nested": 1}}))).unwrap();
    mux.flush().unwrap();

    assert_eq!(
        received.lock().unwrap().clone(),
        vec![doc(json!({"a": {"nested": 1}}))]
    );
    assert_eq!(
        mux.cached_documents().unwrap()[0].1,
        doc(json!({"a": {"nested": 1}}))
    );
}

/// on_flush runs after every previously queued delivery.
#[test]
fn test_on_flush_runs_after_prior_events() {
    let mux = build(OrderingMode::Unordered);
    mux.mark_ready().unwrap();
    let (callbacks, log) = recorder();
    let _handle = mux.observe(callbacks).unwrap();

    let (tx, rx) = mpsc::channel();
    let flush_log = Arc::clone(&log);
    mux.added("a", Document::new()).unwrap();
    mux.removed("a").unwrap();
    mux.on_flush(move || {
        tx.send(flush_log.lock().unwrap().len()).unwrap();
    })
    .unwrap();

    assert_eq!(rx.recv().unwrap(), 2);
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Detaching all H handles tears down exactly once.
#[test]
fn test_teardown_exactly_once_with_many_handles() {
    const HANDLES: usize = 8;
    let stops = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stops);
    let mux = ObserveMultiplexer::builder(MultiplexerConfig::ordered())
        .metrics(Arc::new(MetricsRegistry::new()))
        .on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    mux.mark_ready().unwrap();

    let handles: Vec<ObserveHandle> = (0..HANDLES)
        .map(|_| mux.observe(ObserveCallbacks::new()).unwrap())
        .collect();

    let threads: Vec<_> = handles
        .into_iter()
        .map(|handle| thread::spawn(move || handle.stop().unwrap()))
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(mux.is_stopped());
}

/// stop() twice behaves like once.
#[test]
fn test_stop_is_idempotent() {
    let stops = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stops);
    let metrics = Arc::new(MetricsRegistry::new());
    let mux = ObserveMultiplexer::builder(MultiplexerConfig::unordered())
        .metrics(Arc::clone(&metrics))
        .on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    mux.mark_ready().unwrap();

    let keep = mux.observe(ObserveCallbacks::new()).unwrap();
    let handle = mux.observe(ObserveCallbacks::new()).unwrap();
    handle.stop().unwrap();
    handle.stop().unwrap();

    assert!(handle.is_stopped());
    assert_eq!(mux.handle_count(), 1);
    assert_eq!(metrics.snapshot().handles_detached, 1);
    assert_eq!(stops.load(Ordering::SeqCst), 0);

    keep.stop().unwrap();
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

/// Attach after teardown is rejected.
#[test]
fn test_attach_after_stop_fails() {
    let mux = build(OrderingMode::Unordered);
    mux.mark_ready().unwrap();
    mux.observe(ObserveCallbacks::new()).unwrap().stop().unwrap();

    assert!(matches!(
        mux.observe(ObserveCallbacks::new()),
        Err(MultiplexError::LifecycleViolation(_))
    ));
}

// =============================================================================
// Cache Fold
// =============================================================================

/// The multiplexer's cache equals folding the events over an empty cache.
#[test]
fn test_cache_matches_fold_of_events() {
    let events = vec![
        ChangeEvent::AddedBefore {
            id: "a".into(),
            fields: doc(json!({"n": 1})),
            before: None,
        },
        ChangeEvent::AddedBefore {
            id: "b".into(),
            fields: doc(json!({"n": 2})),
            before: Some("a".into()),
        },
        ChangeEvent::AddedBefore {
            id: "c".into(),
            fields: doc(json!({"n": 3, "tmp": true})),
            before: None,
        },
    ];
    let live = vec![
        ChangeEvent::Changed {
            id: "c".into(),
            delta: {
                let mut d = set("n", json!(30));
                d.insert("tmp".into(), FieldChange::Unset);
                d
            },
        },
        ChangeEvent::MovedBefore {
            id: "c".into(),
            before: Some("b".into()),
        },
        ChangeEvent::Removed { id: "a".into() },
    ];

    let mux = build(OrderingMode::Ordered);
    for event in &events {
        mux.notify(event.clone()).unwrap();
    }
    mux.mark_ready().unwrap();
    for event in &live {
        mux.notify(event.clone()).unwrap();
    }
    mux.flush().unwrap();

    let mut fold =
        CachingChangeObserver::new(ObserverOptions::with_mode(OrderingMode::Ordered)).unwrap();
    for event in events.iter().chain(live.iter()) {
        fold.apply(event).unwrap();
    }

    assert_eq!(mux.cached_documents().unwrap(), fold.docs().to_vec());
    assert_eq!(
        mux.cached_documents().unwrap(),
        vec![
            (DocumentId::from("c"), doc(json!({"n": 30}))),
            (DocumentId::from("b"), doc(json!({"n": 2}))),
        ]
    );
}
