// src/metrics.rs
//
// Thin telemetry layer. When the `observability` feature is off, every
// helper here compiles to nothing, so the cache's hot path never pays for
// instrumentation it cannot ship.

#[cfg(feature = "observability")]
use metrics::{counter, gauge, histogram};

/// Registers the metric descriptions once, if the `observability` feature
/// is enabled and an exporter has been installed by the embedder.
#[cfg(feature = "observability")]
pub fn describe() {
    metrics::describe_counter!("dbcache_opens_total", "Successful slot acquisitions");
    metrics::describe_counter!("dbcache_errors_total", "Failed open_and_lock calls, by kind");
    metrics::describe_histogram!("dbcache_open_wait_seconds", "Wait time before a slot was acquired");
    metrics::describe_gauge!("dbcache_slots_used", "Non-free slots currently tracked");
    metrics::describe_counter!("dbcache_evictions_total", "Slots returned to FREE by eviction");
    metrics::describe_counter!("dispatch_events_sent_total", "Events successfully published");
    metrics::describe_counter!("dispatch_events_dropped_total", "Events dropped as unrecoverable");
    metrics::describe_gauge!("dispatch_queue_depth", "Outbound events waiting in the dispatch queue");
}

#[cfg(not(feature = "observability"))]
pub fn describe() {}

pub fn record_open(wait: std::time::Duration) {
    #[cfg(feature = "observability")]
    {
        counter!("dbcache_opens_total", 1);
        histogram!("dbcache_open_wait_seconds", wait.as_secs_f64());
    }
    #[cfg(not(feature = "observability"))]
    {
        let _ = wait;
    }
}

pub fn record_error(kind: &'static str) {
    #[cfg(feature = "observability")]
    counter!("dbcache_errors_total", 1, "kind" => kind);
    #[cfg(not(feature = "observability"))]
    {
        let _ = kind;
    }
}

pub fn set_slots_used(count: usize) {
    #[cfg(feature = "observability")]
    gauge!("dbcache_slots_used", count as f64);
    #[cfg(not(feature = "observability"))]
    {
        let _ = count;
    }
}

pub fn record_eviction() {
    #[cfg(feature = "observability")]
    counter!("dbcache_evictions_total", 1);
}

pub fn record_event_sent() {
    #[cfg(feature = "observability")]
    counter!("dispatch_events_sent_total", 1);
}

pub fn record_event_dropped() {
    #[cfg(feature = "observability")]
    counter!("dispatch_events_dropped_total", 1);
}

pub fn set_queue_depth(depth: usize) {
    #[cfg(feature = "observability")]
    gauge!("dispatch_queue_depth", depth as f64);
    #[cfg(not(feature = "observability"))]
    {
        let _ = depth;
    }
}
