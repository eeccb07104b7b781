//! Metric instrument factories for laneq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without one installed, every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("laneq")
}

/// Counter: items enqueued.
/// Labels: `queue`.
pub fn items_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("laneq.items.enqueued")
        .with_description("Number of items enqueued")
        .build()
}

/// Counter: item state transitions.
/// Labels: `queue`, `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("laneq.items.state_transitions")
        .with_description("Number of item state transitions")
        .build()
}

/// Counter: dispatches refused because no processor is registered.
/// Labels: `queue`.
pub fn items_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("laneq.items.unroutable")
        .with_description("Dispatches with no registered processor")
        .build()
}

/// Counter: items removed by eviction sweeps.
/// Labels: `queue`, `reason` ("completed" | "expired"), `status`.
pub fn items_evicted() -> Counter<u64> {
    meter()
        .u64_counter("laneq.items.evicted")
        .with_description("Number of items evicted from lanes")
        .build()
}

/// Histogram: handler attempt duration in milliseconds.
/// Labels: `queue`, `outcome`.
pub fn dispatch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("laneq.dispatch.duration_ms")
        .with_description("Handler attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}
