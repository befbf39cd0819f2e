//! End-to-end retry/drop behavior of the dispatch worker, exercised through
//! its public API against the in-memory stub broker.

use std::sync::Arc;
use std::time::Duration;

use dbcache_core::dispatch::broker::test_support::StubBroker;
use dbcache_core::dispatch::DispatchWorker;
use dbcache_core::error::BrokerError;
use dbcache_core::settings::DispatchSettings;

fn settings() -> DispatchSettings {
    DispatchSettings {
        poll_timeout_ms: 30,
        flush_divisor: 10,
        shutdown_drain_secs: 2,
        backoff_base_ms: 10,
        backoff_max_attempts: 5,
        overwritable_capacity: 16,
        buffer_delay_ms: 500,
    }
}

#[tokio::test]
async fn network_error_is_retried_then_succeeds() {
    let broker = Arc::new(StubBroker::new(vec![
        Err(BrokerError::Network("connection reset".into())),
        Ok(()),
    ]));
    let worker = DispatchWorker::new("mem://broker", "topic", broker.clone(), settings());

    worker.send("payload-1".into()).await;
    let handle = worker.start();

    tokio::time::sleep(Duration::from_millis(300)).await;
    worker.stop();
    let _ = handle.await;

    assert_eq!(broker.published(), vec!["payload-1".to_string()], "exactly one delivery survives");
    assert!(worker.queue_is_empty(), "the retried message must not remain queued");
    assert_eq!(worker.total_sent_events(), 1, "only the successful publish is counted");
}

#[tokio::test]
async fn unrecoverable_error_drops_the_message_and_resets_backoff() {
    let broker = Arc::new(StubBroker::new(vec![Err(BrokerError::Unrecoverable("malformed payload".into()))]));
    let worker = DispatchWorker::new("mem://broker", "topic", broker.clone(), settings());

    worker.send("doomed".into()).await;
    let handle = worker.start();

    tokio::time::sleep(Duration::from_millis(150)).await;
    worker.stop();
    let _ = handle.await;

    assert!(broker.published().is_empty(), "an unrecoverable error must never be published");
    assert!(worker.queue_is_empty(), "a dropped message leaves no trace in the queue");
    assert_eq!(worker.total_sent_events(), 0);
}

#[tokio::test]
async fn shutdown_drains_queued_events_before_returning() {
    let broker = Arc::new(StubBroker::always_ok());
    let worker = DispatchWorker::new("mem://broker", "topic", broker.clone(), settings());

    for i in 0..5 {
        worker.send(format!("evt-{i}")).await;
    }
    let handle = worker.start();
    // Stop almost immediately; the bounded drain must still flush everything
    // already enqueued before the worker tears down its broker session.
    tokio::time::sleep(Duration::from_millis(20)).await;
    worker.stop();
    let _ = handle.await;

    assert_eq!(broker.published().len(), 5, "shutdown drain must flush all pending events");
}
