use once_cell::sync::Lazy;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

static SCHEDULING_METRICS: Lazy<SchedulingMetrics> = Lazy::new(|| {
    let meter = global::meter("horology-kernel.scheduling");
    SchedulingMetrics {
        transitions: meter
            .u64_counter("kernel.timer.transitions")
            .with_description("Timer lifecycle transitions applied by the state machine")
            .init(),
        firing_drift_ms: meter
            .f64_histogram("kernel.timer.firing_drift_ms")
            .with_description("Observed fire instant minus the effective deadline")
            .init(),
        publish_failures: meter
            .u64_counter("kernel.events.publish_failures")
            .with_description("Event envelopes that failed a durable publish attempt")
            .init(),
        dead_letters: meter
            .u64_counter("kernel.events.dead_letters")
            .with_description("Event envelopes parked on the DLQ subject")
            .init(),
    }
});

struct SchedulingMetrics {
    transitions: Counter<u64>,
    firing_drift_ms: Histogram<f64>,
    publish_failures: Counter<u64>,
    dead_letters: Counter<u64>,
}

pub fn record_transition(kind: &'static str, tenant_id: &str) {
    SCHEDULING_METRICS.transitions.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("tenant_id", tenant_id.to_string()),
        ],
    );
}

pub fn record_firing_drift(drift_ms: i64) {
    SCHEDULING_METRICS
        .firing_drift_ms
        .record(drift_ms as f64, &[]);
}

pub fn record_publish_failure(subject: &str) {
    SCHEDULING_METRICS
        .publish_failures
        .add(1, &[KeyValue::new("subject", subject.to_string())]);
}

pub fn record_dead_letter(subject: &str) {
    SCHEDULING_METRICS
        .dead_letters
        .add(1, &[KeyValue::new("subject", subject.to_string())]);
}
