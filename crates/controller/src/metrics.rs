//! Prometheus instrumentation for the controller layer.

use prometheus::{IntCounter, IntGauge};
use std::sync::LazyLock;

static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!("dvq_msg_queue_depth", "Messages waiting in the queue")
        .expect("metric registration")
});

static MSGS_PROCESSED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!("dvq_worker_msgs_processed", "Messages handled by workers")
        .expect("metric registration")
});

static MSGS_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "dvq_msgs_dropped",
        "Messages rejected at the queue or by validation"
    )
    .expect("metric registration")
});

static DECIDED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!("dvq_decided_total", "Decided instances persisted")
        .expect("metric registration")
});

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as i64);
}

pub fn record_processed() {
    MSGS_PROCESSED.inc();
}

pub fn record_dropped() {
    MSGS_DROPPED.inc();
}

pub fn record_decided() {
    DECIDED_TOTAL.inc();
}
