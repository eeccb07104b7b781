//! Structured events emitted by the scheduler on every lifecycle change.
//!
//! Consumers subscribe to the broadcast channel to build dashboards,
//! alerting, or logs. A slow subscriber lags and skips events; it never
//! blocks the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::model::Item;
use crate::store::EvictReason;

/// A structured event emitted by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

/// Item payloads are snapshots taken at the moment of the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ItemAdded { queue_name: String, item: Item },
    ItemCompleted { queue_name: String, item: Item },
    ItemRetry { queue_name: String, item: Item },
    ItemFailed { queue_name: String, item: Item },
    ItemEvicted {
        queue_name: String,
        item: Item,
        reason: EvictReason,
    },
    ProcessorRegistered { queue_name: String },
}

impl EventKind {
    pub fn queue_name(&self) -> &str {
        match self {
            EventKind::ItemAdded { queue_name, .. }
            | EventKind::ItemCompleted { queue_name, .. }
            | EventKind::ItemRetry { queue_name, .. }
            | EventKind::ItemFailed { queue_name, .. }
            | EventKind::ItemEvicted { queue_name, .. }
            | EventKind::ProcessorRegistered { queue_name } => queue_name,
        }
    }

    pub fn item(&self) -> Option<&Item> {
        match self {
            EventKind::ItemAdded { item, .. }
            | EventKind::ItemCompleted { item, .. }
            | EventKind::ItemRetry { item, .. }
            | EventKind::ItemFailed { item, .. }
            | EventKind::ItemEvicted { item, .. } => Some(item),
            EventKind::ProcessorRegistered { .. } => None,
        }
    }

    /// Short name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ItemAdded { .. } => "item_added",
            EventKind::ItemCompleted { .. } => "item_completed",
            EventKind::ItemRetry { .. } => "item_retry",
            EventKind::ItemFailed { .. } => "item_failed",
            EventKind::ItemEvicted { .. } => "item_evicted",
            EventKind::ProcessorRegistered { .. } => "processor_registered",
        }
    }

    /// Completed or failed: the item will not be dispatched again.
    pub fn is_settlement(&self) -> bool {
        matches!(
            self,
            EventKind::ItemCompleted { .. } | EventKind::ItemFailed { .. }
        )
    }
}

/// Fan-out for scheduler events.
pub(crate) struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Log every event from `rx` until the scheduler goes away.
pub async fn log_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event logger lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("event channel closed");
                return;
            }
        }
    }
}

fn log_event(event: &Event) {
    let queue = event.kind.queue_name();
    match &event.kind {
        EventKind::ProcessorRegistered { .. } => {
            info!(seq = event.seq, queue, "processor registered");
        }
        EventKind::ItemFailed { item, .. } => {
            let error = item.last_error.as_ref().map(ToString::to_string);
            warn!(
                seq = event.seq,
                queue,
                item_id = %item.id,
                attempts = item.attempts,
                error = error.as_deref().unwrap_or(""),
                "item failed"
            );
        }
        EventKind::ItemEvicted { item, reason, .. } => {
            if item.status.is_terminal() {
                debug!(seq = event.seq, queue, item_id = %item.id, ?reason, "item evicted");
            } else {
                warn!(
                    seq = event.seq,
                    queue,
                    item_id = %item.id,
                    status = %item.status,
                    "unresolved item evicted by age"
                );
            }
        }
        kind => {
            if let Some(item) = kind.item() {
                info!(
                    seq = event.seq,
                    queue,
                    item_id = %item.id,
                    attempts = item.attempts,
                    "{}",
                    kind.name()
                );
            }
        }
    }
}
