//! The event dispatch worker.
//!
//! One worker owns one queue, one broker session, and a buffer of
//! overwritable events. `start()` spawns the loop on the current Tokio
//! runtime and returns a `JoinHandle`; flipping `running` to `false`
//! (via `stop()`) triggers a bounded drain before the broker session is
//! torn down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use indexmap::IndexSet;
use tokio::task::JoinHandle;

use crate::rrd::SingleRrd;
use crate::settings::DispatchSettings;

use super::backoff;
use super::broker::EventBroker;
use super::queue::EventQueue;

struct BufferedEvent {
    payload: String,
    inserted_at: Instant,
}

/// Coalescing buffer for events that only need to carry their *latest*
/// value (overwrite-by-key), flushed onto the main queue periodically or
/// forced on shutdown. Insertion order is preserved via `IndexSet`-style
/// ordering over a side map, mirroring the original's overwritable buffer
/// without requiring its keys to implement `Hash` + `Ord` simultaneously.
struct OverwritableBuffer {
    order: IndexSet<String>,
    entries: HashMap<String, BufferedEvent>,
}

impl OverwritableBuffer {
    fn new() -> Self {
        Self { order: IndexSet::new(), entries: HashMap::new() }
    }

    fn insert(&mut self, key: String, payload: String, capacity: usize) {
        if !self.entries.contains_key(&key) {
            if capacity > 0 && self.order.len() >= capacity {
                if let Some(oldest) = self.order.shift_remove_index(0) {
                    self.entries.remove(&oldest);
                }
            }
            self.order.insert(key.clone());
        }
        self.entries.insert(key, BufferedEvent { payload, inserted_at: Instant::now() });
    }

    fn drain_ready(&mut self, force: bool, delay: Duration) -> Vec<String> {
        let now = Instant::now();
        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|k| {
                self.entries
                    .get(*k)
                    .map(|e| force || now.saturating_duration_since(e.inserted_at) >= delay)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let mut payloads = Vec::with_capacity(ready.len());
        for key in ready {
            self.order.shift_remove(&key);
            if let Some(event) = self.entries.remove(&key) {
                payloads.push(event.payload);
            }
        }
        payloads
    }
}

#[derive(Default)]
struct RunningCtx {
    attempts_put: u32,
}

/// Owns the outbound queue, the broker session, and the rolling
/// send-count / send-time counters for one named topic.
pub struct DispatchWorker<B: EventBroker> {
    endpoint: String,
    topic: String,
    broker: Arc<B>,
    queue: Arc<EventQueue>,
    buffer: Mutex<OverwritableBuffer>,
    settings: ArcSwap<DispatchSettings>,
    running: AtomicBool,
    healthy: AtomicBool,
    send_count: Mutex<SingleRrd>,
    send_time: Mutex<SingleRrd>,
    created_at: Instant,
}

impl<B: EventBroker + 'static> DispatchWorker<B> {
    pub fn new(endpoint: impl Into<String>, topic: impl Into<String>, broker: Arc<B>, settings: DispatchSettings) -> Arc<Self> {
        let created_at = Instant::now();
        Arc::new(Self {
            endpoint: endpoint.into(),
            topic: topic.into(),
            broker,
            queue: Arc::new(EventQueue::new()),
            buffer: Mutex::new(OverwritableBuffer::new()),
            settings: ArcSwap::from_pointee(settings),
            running: AtomicBool::new(false),
            healthy: AtomicBool::new(false),
            send_count: Mutex::new(SingleRrd::new(0, 60)),
            send_time: Mutex::new(SingleRrd::new(0, 60)),
            created_at,
        })
    }

    fn now_secs(&self, instant: Instant) -> i64 {
        instant.saturating_duration_since(self.created_at).as_secs() as i64
    }

    pub fn set_settings(&self, settings: DispatchSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Enqueues `payload` for immediate delivery, preserving FIFO order.
    pub async fn send(&self, payload: String) {
        self.queue.push_back(payload).await;
        crate::metrics::set_queue_depth(self.queue.len());
    }

    /// Enqueues `payload` under `key`, coalescing with any value already
    /// buffered under the same key (only the latest survives a flush).
    pub fn send_overwritable(&self, key: String, payload: String) {
        let capacity = self.settings.load().overwritable_capacity;
        self.buffer.lock().unwrap().insert(key, payload, capacity);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue depth at or above `threshold` (an embedder-supplied notion of
    /// "backed up"), read-only.
    pub fn is_stalled(&self, threshold: usize) -> bool {
        self.queue.len() >= threshold
    }

    /// True when nothing is waiting to be published.
    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_sent_events(&self) -> u64 {
        let now = self.now_secs(Instant::now());
        self.send_count.lock().unwrap().get_delta(now, 60)
    }

    pub fn total_send_time(&self) -> u64 {
        let now = self.now_secs(Instant::now());
        self.send_time.lock().unwrap().get_delta(now, 60)
    }

    /// Starts the worker loop on the current Tokio runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let worker = self.clone();
        tokio::spawn(async move { worker.run().await })
    }

    /// Cooperative shutdown: the loop exits after its bounded drain.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>) {
        if let Err(e) = self.broker.create(&self.endpoint, &self.topic).await {
            tracing::warn!(endpoint = %self.endpoint, error = %e, "broker session could not be created");
            self.healthy.store(false, Ordering::SeqCst);
            return;
        }
        self.healthy.store(true, Ordering::SeqCst);

        let mut ctx = RunningCtx::default();
        let mut last_flush = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let settings = self.settings.load_full();
            let now = Instant::now();
            if now.saturating_duration_since(last_flush) >= settings.buffer_flush_interval() {
                last_flush = now;
                self.flush_buffered(false).await;
            }

            if !self.manage_message(&mut ctx).await {
                let delay = backoff::delay(ctx.attempts_put, settings.backoff_base(), settings.backoff_max_attempts);
                tokio::time::sleep(delay).await;
            }
        }

        let settings = self.settings.load_full();
        let deadline = Instant::now() + settings.shutdown_drain();
        while !self.queue.is_empty() {
            if Instant::now() > deadline {
                tracing::warn!(endpoint = %self.endpoint, "shutdown drain deadline reached with events still queued");
                break;
            }
            self.flush_buffered(true).await;
            if !self.manage_message(&mut ctx).await {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        self.flush_buffered(true).await;
        self.broker.destroy().await;
    }

    async fn flush_buffered(&self, force: bool) {
        let settings = self.settings.load_full();
        let ready = self.buffer.lock().unwrap().drain_ready(force, settings.buffer_delay());
        for payload in ready {
            self.queue.push_back(payload).await;
        }
        crate::metrics::set_queue_depth(self.queue.len());
    }

    /// Pops and publishes one message. Returns `true` if the loop can
    /// continue immediately, `false` if it should back off.
    async fn manage_message(&self, ctx: &mut RunningCtx) -> bool {
        let settings = self.settings.load_full();
        let msg = match self.queue.pop_timeout(settings.poll_timeout()).await {
            Some(m) if !m.is_empty() => m,
            _ => return true,
        };

        let start = Instant::now();
        let result = self.broker.publish(&self.topic, msg.as_bytes()).await;
        let end = Instant::now();
        let now_secs = self.now_secs(end);

        self.send_count.lock().unwrap().add(now_secs, 1);
        self.send_time
            .lock()
            .unwrap()
            .add(now_secs, end.saturating_duration_since(start).as_micros() as u64);

        match result {
            Ok(()) => {
                ctx.attempts_put = 0;
                crate::metrics::record_event_sent();
                true
            }
            Err(e) if e.is_retry() || e.is_network_error() => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "recoverable broker error, requeueing");
                self.queue.push_front(msg).await;
                ctx.attempts_put += 1;
                false
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "unrecoverable broker error, dropping event");
                crate::metrics::record_event_dropped();
                ctx.attempts_put = 0;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::broker::test_support::StubBroker;
    use crate::error::BrokerError;

    fn settings() -> DispatchSettings {
        DispatchSettings {
            poll_timeout_ms: 50,
            flush_divisor: 10,
            shutdown_drain_secs: 1,
            backoff_base_ms: 5,
            backoff_max_attempts: 5,
            overwritable_capacity: 16,
            buffer_delay_ms: 1000,
        }
    }

    #[tokio::test]
    async fn publishes_and_drains_on_success() {
        let broker = Arc::new(StubBroker::always_ok());
        let worker = DispatchWorker::new("mem://", "topic", broker.clone(), settings());
        worker.send("hello".into()).await;
        let handle = worker.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        worker.stop();
        let _ = handle.await;
        assert_eq!(broker.published(), vec!["hello".to_string()]);
        assert!(worker.is_healthy());
    }

    #[tokio::test]
    async fn retries_network_error_then_succeeds() {
        let broker = Arc::new(StubBroker::new(vec![
            Err(BrokerError::Network("connection reset".into())),
            Ok(()),
        ]));
        let worker = DispatchWorker::new("mem://", "topic", broker.clone(), settings());
        worker.send("payload".into()).await;
        let handle = worker.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.stop();
        let _ = handle.await;
        assert_eq!(broker.published(), vec!["payload".to_string()]);
        assert!(worker.queue.is_empty());
    }

    #[tokio::test]
    async fn unrecoverable_error_drops_the_event() {
        let broker = Arc::new(StubBroker::new(vec![Err(BrokerError::Unrecoverable("bad payload".into()))]));
        let worker = DispatchWorker::new("mem://", "topic", broker.clone(), settings());
        worker.send("doomed".into()).await;
        let handle = worker.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        worker.stop();
        let _ = handle.await;
        assert!(broker.published().is_empty());
        assert!(worker.queue.is_empty());
    }

    #[tokio::test]
    async fn overwritable_buffer_coalesces_by_key() {
        let broker = Arc::new(StubBroker::always_ok());
        let worker = DispatchWorker::new("mem://", "topic", broker.clone(), settings());
        worker.send_overwritable("k".into(), "first".into());
        worker.send_overwritable("k".into(), "second".into());
        worker.flush_buffered(true).await;
        assert_eq!(worker.queue.len(), 1);
        let popped = worker.queue.pop_timeout(Duration::from_millis(10)).await;
        assert_eq!(popped, Some("second".to_string()));
    }
}
