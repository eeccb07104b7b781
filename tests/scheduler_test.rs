//! Integration tests for the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use laneq::config::{EvictionPolicy, RetryPlacement, SchedulerConfig};
use laneq::error::Error;
use laneq::event::{Event, EventKind};
use laneq::model::{EnqueueOptions, Failure, Item, ItemId, Status};
use laneq::registry::handler_fn;
use laneq::scheduler::Scheduler;
use laneq::store::EvictReason;
use serde_json::{Value, json};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent,
        ..SchedulerConfig::default()
    }
}

/// Collect settlement (completed/failed) snapshots until `count` arrive.
async fn settlements(rx: &mut broadcast::Receiver<Event>, count: usize) -> Vec<Item> {
    let mut settled = Vec::new();
    tokio::time::timeout(WAIT, async {
        while settled.len() < count {
            let event = rx.recv().await.expect("event channel");
            if event.kind.is_settlement() {
                settled.push(event.kind.item().cloned().expect("settlement carries item"));
            }
        }
    })
    .await
    .expect("timed out waiting for settlements");
    settled
}

/// Wait for the next event matching `pred`.
async fn next_event(rx: &mut broadcast::Receiver<Event>, pred: impl Fn(&EventKind) -> bool) -> Event {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel");
            if pred(&event.kind) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Handler that fails the first `failures` calls for each `n`, then echoes.
fn flaky(failures: HashMap<u64, u32>, calls: Arc<Mutex<Vec<u64>>>) -> impl laneq::Handler {
    let seen: Arc<Mutex<HashMap<u64, u32>>> = Arc::default();
    handler_fn(move |payload: Value| {
        let seen = Arc::clone(&seen);
        let calls = Arc::clone(&calls);
        let failures = failures.clone();
        async move {
            let n = payload["n"].as_u64().unwrap();
            calls.lock().unwrap().push(n);
            let attempt = {
                let mut seen = seen.lock().unwrap();
                let c = seen.entry(n).or_insert(0);
                *c += 1;
                *c
            };
            if attempt <= failures.get(&n).copied().unwrap_or(0) {
                anyhow::bail!("item {n} failed attempt {attempt}");
            }
            Ok(json!({ "n": n }))
        }
    })
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[test]
fn new_outside_runtime_is_an_error() {
    let result = Scheduler::new(SchedulerConfig::default());
    assert!(matches!(result, Err(Error::Runtime(_))));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let result = Scheduler::new(config(0));
    assert!(matches!(result, Err(Error::Config(_))));
}

// ---------------------------------------------------------------------------
// Basic lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_runs_handler_and_completes() {
    let scheduler = Scheduler::new(config(3)).unwrap();
    let mut rx = scheduler.subscribe();
    scheduler.register_processor(
        "content",
        handler_fn(|payload: Value| async move { Ok(json!({ "echo": payload })) }),
    );

    let id = scheduler
        .enqueue("content", json!({"type": "text"}), EnqueueOptions::new())
        .unwrap();
    assert!(id.as_str().starts_with("content_"));

    let added = next_event(&mut rx, |k| matches!(k, EventKind::ItemAdded { .. })).await;
    assert_eq!(added.kind.item().unwrap().id, id);
    assert_eq!(added.kind.item().unwrap().status, Status::Pending);

    let done = settlements(&mut rx, 1).await;
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].status, Status::Completed);
    assert_eq!(done[0].attempts, 1);
    assert_eq!(done[0].result, Some(json!({"echo": {"type": "text"}})));
}

#[tokio::test]
async fn processor_registration_emits_event() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();
    scheduler.register_processor("social", handler_fn(|_| async { Ok(Value::Null) }));

    let event = next_event(&mut rx, |_| true).await;
    match event.kind {
        EventKind::ProcessorRegistered { queue_name } => assert_eq!(queue_name, "social"),
        other => panic!("expected ProcessorRegistered, got {other:?}"),
    }
    assert!(scheduler.has_processor("social"));
}

#[tokio::test]
async fn event_sequence_numbers_are_monotonic() {
    let scheduler = Scheduler::new(config(2)).unwrap();
    let mut rx = scheduler.subscribe();
    scheduler.register_processor("content", handler_fn(|p| async move { Ok(p) }));
    for n in 0..5 {
        scheduler
            .enqueue("content", json!({ "n": n }), EnqueueOptions::new())
            .unwrap();
    }
    settlements(&mut rx, 5).await;

    // Drain what is left and check the whole stream.
    let mut rx2 = scheduler.subscribe();
    scheduler.enqueue("content", json!({"n": 99}), EnqueueOptions::new()).unwrap();
    let mut seqs = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            let e = rx2.recv().await.unwrap();
            seqs.push(e.seq);
            if e.kind.is_settlement() {
                break;
            }
        }
    })
    .await
    .unwrap();
    for w in seqs.windows(2) {
        assert!(w[1] > w[0]);
    }
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_is_never_exceeded() {
    let scheduler = Scheduler::new(config(3)).unwrap();
    let mut rx = scheduler.subscribe();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
    scheduler.register_processor(
        "social",
        handler_fn(move |_| {
            let (in_flight, peak) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
    );

    // Burst from several tasks at once.
    let mut producers = Vec::new();
    for t in 0..4 {
        let s = scheduler.clone();
        producers.push(tokio::spawn(async move {
            for n in 0..10 {
                s.enqueue("social", json!({ "t": t, "n": n }), EnqueueOptions::new())
                    .unwrap();
                assert!(s.stats("social").processing <= 3);
            }
        }));
    }
    for p in producers {
        p.await.unwrap();
    }

    let done = settlements(&mut rx, 40).await;
    assert!(done.iter().all(|i| i.status == Status::Completed));
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak} exceeded cap");
    assert!(peak >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lanes_are_scheduled_independently() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();

    // The content handler blocks until the social handler has run, which
    // can only happen if a busy content lane does not hold up social.
    let gate = Arc::new(tokio::sync::Notify::new());
    let g = Arc::clone(&gate);
    scheduler.register_processor(
        "content",
        handler_fn(move |_| {
            let gate = Arc::clone(&g);
            async move {
                gate.notified().await;
                Ok(json!("content"))
            }
        }),
    );
    let g = Arc::clone(&gate);
    scheduler.register_processor(
        "social",
        handler_fn(move |_| {
            let gate = Arc::clone(&g);
            async move {
                gate.notify_one();
                Ok(json!("social"))
            }
        }),
    );

    scheduler.enqueue("content", json!({}), EnqueueOptions::new()).unwrap();
    scheduler.enqueue("social", json!({}), EnqueueOptions::new()).unwrap();

    let done = settlements(&mut rx, 2).await;
    assert!(done.iter().all(|i| i.status == Status::Completed));
}

// ---------------------------------------------------------------------------
// Retry accounting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn succeeds_on_last_allowed_attempt() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();
    let calls = Arc::new(Mutex::new(Vec::new()));
    scheduler.register_processor("content", flaky(HashMap::from([(1, 3)]), Arc::clone(&calls)));

    scheduler
        .enqueue("content", json!({"n": 1}), EnqueueOptions::new().max_attempts(4))
        .unwrap();

    let done = settlements(&mut rx, 1).await;
    assert_eq!(done[0].status, Status::Completed);
    assert_eq!(done[0].attempts, 4);
    assert_eq!(calls.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn always_failing_item_stops_at_max_attempts() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    scheduler.register_processor(
        "blockchain",
        handler_fn(move |_| {
            let calls = Arc::clone(&c);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(anyhow::anyhow!("rpc unavailable"))
            }
        }),
    );

    let id = scheduler
        .enqueue("blockchain", json!({}), EnqueueOptions::new())
        .unwrap();

    let mut retries = 0;
    let failed = tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            match event.kind {
                EventKind::ItemRetry { item, .. } => {
                    assert_eq!(item.status, Status::Pending);
                    retries += 1;
                }
                EventKind::ItemFailed { item, .. } => return item,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(retries, 2);
    assert_eq!(failed.id, id);
    assert_eq!(failed.attempts, 3);
    assert_eq!(
        failed.last_error,
        Some(Failure::Handler {
            message: "rpc unavailable".into()
        })
    );

    // Failed items stay queryable and are never dispatched again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.item(&id).unwrap().status, Status::Failed);
    assert_eq!(scheduler.stats("blockchain").failed, 1);
}

#[tokio::test]
async fn panicking_handler_is_a_failure() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();
    scheduler.register_processor(
        "analytics",
        handler_fn(|_| async {
            if true {
                panic!("bad data");
            }
            Ok(Value::Null)
        }),
    );

    scheduler
        .enqueue("analytics", json!({}), EnqueueOptions::new().max_attempts(1))
        .unwrap();

    let done = settlements(&mut rx, 1).await;
    assert_eq!(done[0].status, Status::Failed);
    assert_eq!(
        done[0].last_error,
        Some(Failure::Panicked {
            message: "bad data".into()
        })
    );
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_follows_retry_path() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();
    scheduler.register_processor(
        "social",
        handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }),
    );

    let started = std::time::Instant::now();
    scheduler
        .enqueue(
            "social",
            json!({}),
            EnqueueOptions::new()
                .max_attempts(2)
                .timeout(Duration::from_millis(50)),
        )
        .unwrap();

    let retry = next_event(&mut rx, |k| matches!(k, EventKind::ItemRetry { .. })).await;
    let retried = retry.kind.item().unwrap();
    assert_eq!(
        retried.last_error,
        Some(Failure::Timeout { timeout_ms: 50 })
    );

    let done = settlements(&mut rx, 1).await;
    assert_eq!(done[0].status, Status::Failed);
    assert_eq!(done[0].attempts, 2);
    assert!(done[0].last_error.as_ref().unwrap().is_timeout());
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "timeouts should fire near 50ms each"
    );
}

#[tokio::test]
async fn timed_out_attempt_is_abandoned() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();
    let side_effect = Arc::new(AtomicBool::new(false));
    let s = Arc::clone(&side_effect);
    scheduler.register_processor(
        "blockchain",
        handler_fn(move |_| {
            let side_effect = Arc::clone(&s);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                side_effect.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
    );

    scheduler
        .enqueue(
            "blockchain",
            json!({}),
            EnqueueOptions::new()
                .max_attempts(1)
                .timeout(Duration::from_millis(30)),
        )
        .unwrap();

    let done = settlements(&mut rx, 1).await;
    assert_eq!(done[0].status, Status::Failed);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!side_effect.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_reenters_at_head_of_lane() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();
    let calls = Arc::new(Mutex::new(Vec::new()));
    scheduler.register_processor("content", flaky(HashMap::from([(1, 1)]), Arc::clone(&calls)));

    scheduler.enqueue("content", json!({"n": 1}), EnqueueOptions::new()).unwrap();
    scheduler.enqueue("content", json!({"n": 2}), EnqueueOptions::new()).unwrap();

    let done = settlements(&mut rx, 2).await;
    // A's retry runs before B's first attempt.
    assert_eq!(*calls.lock().unwrap(), vec![1, 1, 2]);
    assert_eq!(done[0].payload["n"], 1);
    assert_eq!(done[0].attempts, 2);
    assert_eq!(done[1].payload["n"], 2);
}

#[tokio::test]
async fn tail_placement_lets_younger_items_go_first() {
    let scheduler = Scheduler::new(SchedulerConfig {
        max_concurrent: 1,
        retry_placement: RetryPlacement::Tail,
        ..SchedulerConfig::default()
    })
    .unwrap();
    let mut rx = scheduler.subscribe();
    let calls = Arc::new(Mutex::new(Vec::new()));
    scheduler.register_processor("content", flaky(HashMap::from([(1, 1)]), Arc::clone(&calls)));

    // Current-thread runtime: nothing runs until we await, so both items are
    // queued before the first attempt.
    scheduler.enqueue("content", json!({"n": 1}), EnqueueOptions::new()).unwrap();
    scheduler.enqueue("content", json!({"n": 2}), EnqueueOptions::new()).unwrap();

    settlements(&mut rx, 2).await;
    assert_eq!(*calls.lock().unwrap(), vec![1, 2, 1]);
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_items_are_evicted_after_settling() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();
    scheduler.register_processor("content", handler_fn(|p| async move { Ok(p) }));

    let id = scheduler.enqueue("content", json!({}), EnqueueOptions::new()).unwrap();

    let evicted = next_event(&mut rx, |k| matches!(k, EventKind::ItemEvicted { .. })).await;
    match evicted.kind {
        EventKind::ItemEvicted { item, reason, .. } => {
            assert_eq!(item.id, id);
            assert_eq!(reason, EvictReason::Completed);
        }
        _ => unreachable!(),
    }
    assert!(scheduler.item(&id).is_none());
    assert!(scheduler.items("content").is_empty());
}

#[tokio::test]
async fn old_items_of_any_status_are_evicted() {
    let scheduler = Scheduler::new(SchedulerConfig {
        eviction_max_age_ms: 20,
        ..SchedulerConfig::default()
    })
    .unwrap();
    let mut rx = scheduler.subscribe();

    // No processor: the item sits pending.
    let id = match scheduler.enqueue("orphan", json!({}), EnqueueOptions::new()) {
        Err(Error::NoProcessor {
            item_id: Some(id), ..
        }) => id,
        other => panic!("expected NoProcessor, got {other:?}"),
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.evict("orphan"), 1);
    assert!(scheduler.item(&id).is_none());

    let evicted = next_event(&mut rx, |k| matches!(k, EventKind::ItemEvicted { .. })).await;
    match evicted.kind {
        EventKind::ItemEvicted { item, reason, .. } => {
            assert_eq!(item.status, Status::Pending);
            assert_eq!(reason, EvictReason::Expired);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn completed_only_policy_keeps_unresolved_work() {
    let scheduler = Scheduler::new(SchedulerConfig {
        eviction_max_age_ms: 20,
        eviction_policy: EvictionPolicy::CompletedOnly,
        ..SchedulerConfig::default()
    })
    .unwrap();

    let _ = scheduler.enqueue("orphan", json!({}), EnqueueOptions::new());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(scheduler.evict("orphan"), 0);
    assert_eq!(scheduler.stats("orphan").pending, 1);
}

#[tokio::test]
async fn acknowledge_removes_settled_items_only() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();
    scheduler.register_processor(
        "social",
        handler_fn(|_| async { Err::<Value, _>(anyhow::anyhow!("quota exceeded")) }),
    );

    let failed_id = scheduler
        .enqueue("social", json!({}), EnqueueOptions::new().max_attempts(1))
        .unwrap();
    settlements(&mut rx, 1).await;

    let pending_id = match scheduler.enqueue("orphan", json!({}), EnqueueOptions::new()) {
        Err(Error::NoProcessor {
            item_id: Some(id), ..
        }) => id,
        other => panic!("expected NoProcessor, got {other:?}"),
    };
    assert!(matches!(
        scheduler.acknowledge(&pending_id),
        Err(Error::NotSettled {
            status: Status::Pending,
            ..
        })
    ));

    let acked = scheduler.acknowledge(&failed_id).unwrap();
    assert_eq!(acked.status, Status::Failed);
    assert!(scheduler.item(&failed_id).is_none());
    assert!(matches!(
        scheduler.acknowledge(&failed_id),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        scheduler.acknowledge(&ItemId::from("nope")),
        Err(Error::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unregistered_lane_reports_error_and_keeps_item_pending() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let mut rx = scheduler.subscribe();

    let err = scheduler
        .enqueue("content", json!({"n": 1}), EnqueueOptions::new())
        .unwrap_err();
    assert!(err.is_configuration());
    let id = match err {
        Error::NoProcessor {
            queue_name,
            item_id: Some(id),
        } => {
            assert_eq!(queue_name, "content");
            id
        }
        other => panic!("expected NoProcessor, got {other:?}"),
    };

    let item = scheduler.item(&id).expect("item is kept");
    assert_eq!(item.status, Status::Pending);
    assert_eq!(item.attempts, 0);
    assert!(matches!(
        scheduler.process_queue("content"),
        Err(Error::NoProcessor { item_id: None, .. })
    ));

    // Registering picks up the waiting item.
    scheduler.register_processor("content", handler_fn(|p| async move { Ok(p) }));
    let done = settlements(&mut rx, 1).await;
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].status, Status::Completed);
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mixed_workload_settles_as_expected() {
    let scheduler = Scheduler::new(SchedulerConfig {
        max_concurrent: 2,
        default_max_attempts: 3,
        default_timeout_ms: 50,
        ..SchedulerConfig::default()
    })
    .unwrap();
    let mut rx = scheduler.subscribe();

    let attempts: Arc<Mutex<HashMap<u64, u32>>> = Arc::default();
    let a = Arc::clone(&attempts);
    scheduler.register_processor(
        "content",
        handler_fn(move |payload: Value| {
            let attempts = Arc::clone(&a);
            async move {
                let n = payload["n"].as_u64().unwrap();
                let attempt = {
                    let mut attempts = attempts.lock().unwrap();
                    let c = attempts.entry(n).or_insert(0);
                    *c += 1;
                    *c
                };
                match n {
                    1 | 3 if attempt <= 2 => anyhow::bail!("item {n} transient failure"),
                    5 => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(Value::Null)
                    }
                    _ => Ok(json!({ "n": n })),
                }
            }
        }),
    );

    let mut ids = Vec::new();
    for n in 1..=5u64 {
        ids.push(
            scheduler
                .enqueue("content", json!({ "n": n }), EnqueueOptions::new())
                .unwrap(),
        );
    }

    let done = settlements(&mut rx, 5).await;
    let by_id: HashMap<ItemId, Item> = done.into_iter().map(|i| (i.id.clone(), i)).collect();

    let expected = [
        (Status::Completed, 3),
        (Status::Completed, 1),
        (Status::Completed, 3),
        (Status::Completed, 1),
        (Status::Failed, 3),
    ];
    for (id, (status, tries)) in ids.iter().zip(expected) {
        let item = &by_id[id];
        assert_eq!(item.status, status, "item {id}");
        assert_eq!(item.attempts, tries, "item {id}");
    }
    assert!(by_id[&ids[4]].last_error.as_ref().unwrap().is_timeout());

    let total: u32 = by_id.values().map(|i| i.attempts).sum();
    assert_eq!(total, 11);
    assert_eq!(attempts.lock().unwrap().values().sum::<u32>(), 11);

    tokio::time::timeout(WAIT, scheduler.wait_idle("content"))
        .await
        .expect("lane should go idle");
    let stats = scheduler.stats("content");
    assert_eq!(stats.pending + stats.processing, 0);
    assert_eq!(stats.failed, 1);
}
