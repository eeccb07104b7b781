//! In-memory queue store.
//!
//! Owns every item, grouped into lanes that keep arrival order. All
//! methods are synchronous; the scheduler calls them under its lock so a
//! check and the transition that follows it can never interleave.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{EvictionPolicy, RetryPlacement};
use crate::model::{Item, ItemId, LaneStats, Status};

/// Why an eviction sweep removed an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    Completed,
    /// Older than the configured max age.
    Expired,
}

/// Lanes of items keyed by queue name.
#[derive(Debug, Default)]
pub struct QueueStore {
    lanes: HashMap<String, Vec<Item>>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail of the item's lane, creating the lane if needed.
    pub fn push(&mut self, item: Item) {
        self.lanes
            .entry(item.queue_name.clone())
            .or_default()
            .push(item);
    }

    pub fn lane(&self, queue_name: &str) -> &[Item] {
        self.lanes.get(queue_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lanes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn processing_count(&self, queue_name: &str) -> usize {
        self.lane(queue_name)
            .iter()
            .filter(|i| i.status == Status::Processing)
            .count()
    }

    /// The oldest pending item in arrival order.
    pub fn next_pending_mut(&mut self, queue_name: &str) -> Option<&mut Item> {
        self.lanes
            .get_mut(queue_name)?
            .iter_mut()
            .find(|i| i.status == Status::Pending)
    }

    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.lanes.values().flatten().find(|i| &i.id == id)
    }

    pub fn get_in_lane_mut(&mut self, queue_name: &str, id: &ItemId) -> Option<&mut Item> {
        self.lanes
            .get_mut(queue_name)?
            .iter_mut()
            .find(|i| &i.id == id)
    }

    /// Move a retried item to the back of its lane when placement is `Tail`.
    /// `Head` leaves it where it was.
    pub fn requeue(&mut self, queue_name: &str, id: &ItemId, placement: RetryPlacement) {
        if placement == RetryPlacement::Head {
            return;
        }
        let Some(lane) = self.lanes.get_mut(queue_name) else {
            return;
        };
        if let Some(pos) = lane.iter().position(|i| &i.id == id) {
            let item = lane.remove(pos);
            lane.push(item);
        }
    }

    /// Remove an item wherever it lives.
    pub fn remove(&mut self, id: &ItemId) -> Option<Item> {
        for lane in self.lanes.values_mut() {
            if let Some(pos) = lane.iter().position(|i| &i.id == id) {
                return Some(lane.remove(pos));
            }
        }
        None
    }

    pub fn stats(&self, queue_name: &str) -> LaneStats {
        let mut stats = LaneStats::default();
        for item in self.lane(queue_name) {
            match item.status {
                Status::Pending => stats.pending += 1,
                Status::Processing => stats.processing += 1,
                Status::Completed => stats.completed += 1,
                Status::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Sweep a lane: drop completed items, and items older than `max_age`
    /// as the policy allows. Returns what was removed, in lane order.
    pub fn evict(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
        policy: EvictionPolicy,
    ) -> Vec<(Item, EvictReason)> {
        let Some(lane) = self.lanes.get_mut(queue_name) else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(lane.len());
        for item in lane.drain(..) {
            let expired = now - item.added_at > max_age;
            let reason = if item.status == Status::Completed {
                Some(EvictReason::Completed)
            } else if expired && policy == EvictionPolicy::AnyStatus {
                Some(EvictReason::Expired)
            } else {
                None
            };
            match reason {
                Some(reason) => evicted.push((item, reason)),
                None => kept.push(item),
            }
        }
        *lane = kept;
        evicted
    }
}
