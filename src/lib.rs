//! # laneq
//!
//! In-process job scheduler for slow, failure-prone side effects.
//!
//! Work is submitted to named lanes. Each lane has one registered handler
//! and is drained in arrival order under a per-lane concurrency cap, with
//! per-item timeouts, bounded retries, lifecycle events on a broadcast
//! channel, and eviction of completed and stale items.

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod workers;

pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use model::{EnqueueOptions, Failure, Item, ItemId, Status};
pub use registry::{Handler, handler_fn};
pub use scheduler::Scheduler;
