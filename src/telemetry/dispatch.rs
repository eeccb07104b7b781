//! Dispatch span helpers.
//!
//! One span per dispatch attempt, so retries of the same item show up as
//! sibling spans sharing `item.id`.

use tracing::Span;

use crate::model::{ItemId, Status};

/// Start a span for one handler attempt.
///
/// `item.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_dispatch_span(queue: &str, item_id: &ItemId, attempt: u32) -> Span {
    tracing::info_span!(
        "item.dispatch",
        "queue.name" = queue,
        "item.id" = %item_id,
        "item.attempt" = attempt,
        "item.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.in_scope(|| {
        tracing::debug!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}

/// Record where the attempt left the item.
pub fn record_outcome(span: &Span, status: Status) {
    span.record("item.outcome", status.as_str());
}
