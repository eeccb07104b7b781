//! Integration tests for telemetry initialization and span helpers.

use laneq::model::{ItemId, Status};

#[test]
fn telemetry_initializes_without_endpoint() {
    let config = laneq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "laneq-test".to_string(),
        default_level: "debug".to_string(),
    };
    // Another test in this process may already have set a global
    // subscriber; in that case init returns Err, which is acceptable.
    if let Ok(guard) = laneq::telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn dispatch_span_records_transitions_and_outcome() {
    let id = ItemId::from("content_1700000000000_abcdef123");
    let span = laneq::telemetry::dispatch::start_dispatch_span("content", &id, 2);
    laneq::telemetry::dispatch::record_state_transition(&span, Status::Pending, Status::Processing);
    laneq::telemetry::dispatch::record_outcome(&span, Status::Completed);
}

#[test]
fn metric_instruments_are_usable_without_provider() {
    use opentelemetry::KeyValue;

    laneq::telemetry::metrics::items_enqueued().add(1, &[KeyValue::new("queue", "content")]);
    laneq::telemetry::metrics::dispatch_duration_ms()
        .record(12.5, &[KeyValue::new("queue", "content")]);
}
