//! The scheduler. Public API for submitting work and registering handlers.
//!
//! The scheduler owns the queue store, the processor registry and the
//! event channel. Every state transition goes through here, under the
//! store lock, so the admission check and the `processing` transition that
//! follows it form one critical section and the per-lane cap can never be
//! oversubscribed.
//!
//! Dispatch is driven by [`Scheduler::process_queue`], a bounded pump that
//! admits pending items in arrival order until the lane is saturated or
//! drained. It runs on every enqueue, every registration and after every
//! settled attempt. Each admitted item gets its own Tokio task; the
//! handler itself runs in a nested task so a timeout can abort it and a
//! panic is caught as an ordinary failure.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::Instant;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventKind};
use crate::model::{EnqueueOptions, Failure, Item, ItemId, LaneStats, Status};
use crate::registry::{Handler, ProcessorRegistry};
use crate::store::{EvictReason, QueueStore};
use crate::telemetry::dispatch::{record_outcome, record_state_transition, start_dispatch_span};
use crate::telemetry::metrics;

/// Named-lane job scheduler. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    store: Mutex<QueueStore>,
    registry: RwLock<ProcessorRegistry>,
    events: EventBus,
    /// Woken whenever items settle or leave a lane.
    settled: Notify,
    runtime: Handle,
}

impl Inner {
    fn lock_store(&self) -> MutexGuard<'_, QueueStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, ProcessorRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler {
    /// Create a scheduler that spawns dispatch tasks on the current Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the config is invalid, `Error::Runtime` if called
    /// outside a Tokio runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        Self::with_runtime(config, runtime)
    }

    /// Create a scheduler that spawns dispatch tasks on `runtime`.
    pub fn with_runtime(config: SchedulerConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store: Mutex::new(QueueStore::new()),
                registry: RwLock::new(ProcessorRegistry::new()),
                events,
                settled: Notify::new(),
                runtime,
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle events. Only events emitted after this call
    /// are received.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register the handler for `queue_name`, replacing any previous one.
    ///
    /// Items that arrived before their handler are picked up immediately.
    pub fn register_processor<H>(&self, queue_name: &str, handler: H)
    where
        H: Handler + 'static,
    {
        self.register_arc(queue_name, Arc::new(handler));
    }

    /// Like [`register_processor`](Self::register_processor) for a shared handler.
    pub fn register_arc(&self, queue_name: &str, handler: Arc<dyn Handler>) {
        let replaced = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(queue_name, handler);

        info!(queue = queue_name, replaced, "processor registered");
        self.inner.events.emit(EventKind::ProcessorRegistered {
            queue_name: queue_name.to_string(),
        });

        if let Err(e) = self.process_queue(queue_name) {
            error!(queue = queue_name, "dispatch after registration failed: {e}");
        }
    }

    pub fn has_processor(&self, queue_name: &str) -> bool {
        self.inner.read_registry().contains(queue_name)
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Append a pending item to the tail of `queue_name` and trigger the lane.
    ///
    /// Never waits on handler execution. Handler failures are reported
    /// through item state and events, never here.
    ///
    /// # Errors
    ///
    /// `Error::NoProcessor` if the lane has no handler. The item is still
    /// stored as `pending` and the error carries its id.
    pub fn enqueue(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<ItemId> {
        let item = Item::new(queue_name, payload, &options, &self.inner.config);
        let id = item.id.clone();

        {
            let mut store = self.inner.lock_store();
            store.push(item.clone());
            self.inner.events.emit(EventKind::ItemAdded {
                queue_name: queue_name.to_string(),
                item,
            });
        }

        metrics::items_enqueued().add(1, &[KeyValue::new("queue", queue_name.to_string())]);
        debug!(queue = queue_name, item_id = %id, "item enqueued");

        match self.process_queue(queue_name) {
            Ok(_) => Ok(id),
            Err(Error::NoProcessor { queue_name, .. }) => Err(Error::NoProcessor {
                queue_name,
                item_id: Some(id),
            }),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Admit pending items from `queue_name` until the lane is saturated or
    /// has nothing pending. Returns how many were admitted.
    ///
    /// # Errors
    ///
    /// `Error::NoProcessor` if the lane has no handler. Nothing is admitted.
    pub fn process_queue(&self, queue_name: &str) -> Result<usize> {
        let Some(handler) = self.inner.read_registry().get(queue_name) else {
            metrics::items_unroutable().add(1, &[KeyValue::new("queue", queue_name.to_string())]);
            warn!(queue = queue_name, "no processor registered, items stay pending");
            return Err(Error::NoProcessor {
                queue_name: queue_name.to_string(),
                item_id: None,
            });
        };

        let mut admitted = Vec::new();
        {
            let mut store = self.inner.lock_store();
            while store.processing_count(queue_name) < self.inner.config.max_concurrent {
                let Some(item) = store.next_pending_mut(queue_name) else {
                    break;
                };
                item.begin_attempt()?;
                admitted.push(item.clone());
            }
        }

        let count = admitted.len();
        for item in admitted {
            count_transition(queue_name, Status::Pending, Status::Processing);
            let scheduler = self.clone();
            let handler = Arc::clone(&handler);
            self.inner
                .runtime
                .spawn(async move { scheduler.dispatch(handler, item).await });
        }
        Ok(count)
    }

    /// Run one attempt, settle it, then pump the lane again.
    async fn dispatch(self, handler: Arc<dyn Handler>, item: Item) {
        let queue_name = item.queue_name.clone();
        let span = start_dispatch_span(&queue_name, &item.id, item.attempts);
        record_state_transition(&span, Status::Pending, Status::Processing);

        let started = Instant::now();
        let outcome = self
            .run_handler(handler, &item)
            .instrument(span.clone())
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        if let Some(status) = self.settle(&queue_name, &item.id, outcome, &span) {
            record_outcome(&span, status);
            metrics::dispatch_duration_ms().record(
                duration_ms,
                &[
                    KeyValue::new("queue", queue_name.clone()),
                    KeyValue::new("outcome", status.as_str()),
                ],
            );
        }
        self.inner.settled.notify_waiters();

        if let Err(e) = self.process_queue(&queue_name) {
            error!(queue = %queue_name, "re-dispatch failed: {e}");
        }
    }

    /// Race the handler against the item's deadline.
    async fn run_handler(
        &self,
        handler: Arc<dyn Handler>,
        item: &Item,
    ) -> std::result::Result<serde_json::Value, Failure> {
        let payload = item.payload.clone();
        let task = self
            .inner
            .runtime
            .spawn(async move { handler.handle(payload).await }.in_current_span());
        let abort = task.abort_handle();

        match tokio::time::timeout(item.timeout(), task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(Failure::Handler {
                message: format!("{e:#}"),
            }),
            Ok(Err(join_err)) => Err(Failure::Panicked {
                message: panic_message(join_err),
            }),
            Err(_) => {
                // Abandon the attempt; whatever it would have done is discarded.
                abort.abort();
                Err(Failure::Timeout {
                    timeout_ms: item.timeout_ms,
                })
            }
        }
    }

    /// Apply an attempt's outcome, emit the matching event and sweep the lane.
    ///
    /// Returns `None` if the item left the lane while the handler ran.
    fn settle(
        &self,
        queue_name: &str,
        id: &ItemId,
        outcome: std::result::Result<serde_json::Value, Failure>,
        span: &Span,
    ) -> Option<Status> {
        let mut store = self.inner.lock_store();

        let Some(item) = store.get_in_lane_mut(queue_name, id) else {
            debug!(queue = queue_name, item_id = %id, "item evicted mid-flight, outcome dropped");
            return None;
        };
        if item.status != Status::Processing {
            debug!(queue = queue_name, item_id = %id, status = %item.status, "stale outcome ignored");
            return None;
        }

        let applied = match outcome {
            Ok(value) => item.complete(value).map(|()| Status::Completed),
            Err(failure) => {
                warn!(
                    queue = queue_name,
                    item_id = %id,
                    attempt = item.attempts,
                    max_attempts = item.max_attempts,
                    timeout = failure.is_timeout(),
                    error = %failure,
                    "attempt failed"
                );
                item.fail(failure)
            }
        };
        let status = match applied {
            Ok(status) => status,
            Err(e) => {
                error!(queue = queue_name, item_id = %id, "cannot settle item: {e}");
                return None;
            }
        };

        let snapshot = item.clone();
        record_state_transition(span, Status::Processing, status);
        count_transition(queue_name, Status::Processing, status);

        let queue_name_owned = queue_name.to_string();
        let kind = match status {
            Status::Completed => EventKind::ItemCompleted {
                queue_name: queue_name_owned,
                item: snapshot,
            },
            Status::Failed => EventKind::ItemFailed {
                queue_name: queue_name_owned,
                item: snapshot,
            },
            Status::Pending | Status::Processing => {
                store.requeue(queue_name, id, self.inner.config.retry_placement);
                EventKind::ItemRetry {
                    queue_name: queue_name_owned,
                    item: snapshot,
                }
            }
        };
        self.inner.events.emit(kind);

        self.sweep(&mut store, queue_name);
        Some(status)
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    /// Run an eviction sweep over `queue_name`. Returns how many items were
    /// removed.
    pub fn evict(&self, queue_name: &str) -> usize {
        let removed = {
            let mut store = self.inner.lock_store();
            self.sweep(&mut store, queue_name)
        };
        if removed > 0 {
            self.inner.settled.notify_waiters();
        }
        removed
    }

    fn sweep(&self, store: &mut QueueStore, queue_name: &str) -> usize {
        let config = &self.inner.config;
        let max_age = chrono::Duration::milliseconds(
            i64::try_from(config.eviction_max_age_ms).unwrap_or(i64::MAX),
        );
        let evicted = store.evict(queue_name, Utc::now(), max_age, config.eviction_policy);

        let count = evicted.len();
        for (item, reason) in evicted {
            let reason_label = match reason {
                EvictReason::Completed => "completed",
                EvictReason::Expired => "expired",
            };
            metrics::items_evicted().add(
                1,
                &[
                    KeyValue::new("queue", queue_name.to_string()),
                    KeyValue::new("reason", reason_label),
                    KeyValue::new("status", item.status.as_str()),
                ],
            );
            self.inner.events.emit(EventKind::ItemEvicted {
                queue_name: queue_name.to_string(),
                item,
                reason,
            });
        }
        count
    }

    /// Remove a settled item. Under [`crate::config::EvictionPolicy::CompletedOnly`]
    /// this is the only way failed items leave their lane.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if no such item exists, `Error::NotSettled` if it
    /// is still pending or processing.
    pub fn acknowledge(&self, id: &ItemId) -> Result<Item> {
        let item = {
            let mut store = self.inner.lock_store();
            let status = store
                .get(id)
                .map(|i| i.status)
                .ok_or_else(|| Error::NotFound(id.clone()))?;
            if !status.is_terminal() {
                return Err(Error::NotSettled {
                    id: id.clone(),
                    status,
                });
            }
            store.remove(id).ok_or_else(|| Error::NotFound(id.clone()))?
        };
        self.inner.settled.notify_waiters();
        debug!(queue = %item.queue_name, item_id = %id, "item acknowledged");
        Ok(item)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Snapshot of one item.
    pub fn item(&self, id: &ItemId) -> Option<Item> {
        self.inner.lock_store().get(id).cloned()
    }

    /// Snapshot of a lane in arrival order.
    pub fn items(&self, queue_name: &str) -> Vec<Item> {
        self.inner.lock_store().lane(queue_name).to_vec()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.lock_store().queue_names()
    }

    pub fn stats(&self, queue_name: &str) -> LaneStats {
        self.inner.lock_store().stats(queue_name)
    }

    /// Resolve once `queue_name` has nothing pending or processing.
    ///
    /// A lane holding pending items but no processor never becomes idle;
    /// wrap this in a timeout if that can happen.
    pub async fn wait_idle(&self, queue_name: &str) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.stats(queue_name).is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("registry", &*self.inner.read_registry())
            .finish()
    }
}

fn count_transition(queue_name: &str, from: Status, to: Status) {
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
