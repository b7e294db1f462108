//! Worker-pool consumer.
//!
//! A fixed number of workers drain one shared delivery stream. Each worker
//! pulls a delivery, decodes the envelope, dispatches it by event type and
//! settles it exactly once:
//!
//! - undecodable envelope: requeue, bounded by the retry policy
//! - no handler for the event type: ack, no side effects
//! - handler ok: ack
//! - retryable handler error or handler panic: requeue, bounded by the retry policy
//! - non-retryable handler error: reject without requeue (dead-lettered)
//!
//! Workers do not coordinate, so two events for the same order can be
//! handled at the same time and in either order. Handlers must be
//! idempotent and must not assume ordering.

use async_trait::async_trait;
use futures::future::FutureExt;
use futures::stream::{BoxStream, StreamExt};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::metrics::MetricsSink;
use crate::retry::{AttemptTracker, RetryPolicy};
use crate::shutdown::ShutdownListener;
use crate::Event;

const UNDECODABLE: &str = "undecodable";

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed out by the broker. Settling consumes it, so a delivery
/// can be acked or nacked only once.
pub struct Delivery {
    body: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        message_id: Option<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            message_id,
            redelivered,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Identity used to count failed attempts across redeliveries: the
    /// message id when the publisher set one, otherwise a hash of the body.
    pub fn retry_key(&self) -> String {
        match &self.message_id {
            Some(id) => id.clone(),
            None => {
                let mut hasher = DefaultHasher::new();
                self.body.hash(&mut hasher);
                format!("body-{:016x}", hasher.finish())
            }
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    /// Nack without requeue; the broker dead-letters it.
    Reject,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
            Disposition::Reject => "reject",
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload can never be processed; redelivering it will not help.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Downstream, persistence or publish failure.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    pub fn handler_for(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

pub struct WorkerPool {
    size: usize,
    inner: Arc<PoolInner>,
}

struct PoolInner {
    dispatcher: Dispatcher,
    retry: RetryPolicy,
    attempts: AttemptTracker,
    metrics: Arc<dyn MetricsSink>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        dispatcher: Dispatcher,
        retry: RetryPolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            size: size.max(1),
            inner: Arc::new(PoolInner {
                dispatcher,
                retry,
                attempts: AttemptTracker::new(),
                metrics,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs until the stream ends or shutdown is triggered. Returns only
    /// after every worker has settled the delivery it was holding; deliveries
    /// never pulled from the stream stay with the broker.
    pub async fn run(&self, deliveries: DeliveryStream, shutdown: ShutdownListener) {
        let stream = Arc::new(Mutex::new(deliveries));
        let mut workers = JoinSet::new();

        for id in 0..self.size {
            let inner = self.inner.clone();
            workers.spawn(inner.work(id, stream.clone(), shutdown.clone()));
        }
        info!(
            workers = self.size,
            event_types = ?self.inner.dispatcher.event_types(),
            "Worker pool started"
        );

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Worker pool drained");
    }
}

impl PoolInner {
    async fn work(
        self: Arc<Self>,
        id: usize,
        stream: Arc<Mutex<DeliveryStream>>,
        mut shutdown: ShutdownListener,
    ) {
        debug!(worker = id, "Worker started");
        loop {
            let next = {
                let mut deliveries = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    guard = stream.lock() => guard,
                };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = deliveries.next() => next,
                }
            };

            match next {
                Some(Ok(delivery)) => self.settle(id, delivery, &mut shutdown).await,
                Some(Err(e)) => {
                    error!(worker = id, "Delivery stream failed: {}", e);
                    break;
                }
                None => break,
            }
        }
        debug!(worker = id, "Worker stopped");
    }

    async fn settle(&self, worker: usize, delivery: Delivery, shutdown: &mut ShutdownListener) {
        let started = Instant::now();
        let (event_type, disposition) = self.decide(worker, &delivery, shutdown).await;

        let result = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Requeue => delivery.nack(true).await,
            Disposition::Reject => delivery.nack(false).await,
        };
        if let Err(e) = result {
            error!(
                worker,
                event_type = %event_type,
                disposition = disposition.as_str(),
                "Failed to settle delivery: {}",
                e
            );
        }

        self.metrics.delivery_settled(&event_type, disposition);
        self.metrics.handler_latency(&event_type, started.elapsed());
    }

    async fn decide(
        &self,
        worker: usize,
        delivery: &Delivery,
        shutdown: &mut ShutdownListener,
    ) -> (String, Disposition) {
        let event = match Event::decode(delivery.body()) {
            Ok(event) => event,
            Err(e) => {
                warn!(worker, redelivered = delivery.redelivered(), "Undecodable delivery: {}", e);
                let disposition = self.retry_or_reject(delivery, shutdown).await;
                return (UNDECODABLE.to_string(), disposition);
            }
        };

        let Some(handler) = self.dispatcher.handler_for(&event.event_type) else {
            debug!(worker, event_type = %event.event_type, "No handler registered, acknowledging");
            return (event.event_type, Disposition::Ack);
        };

        let outcome = AssertUnwindSafe(handler.handle(&event)).catch_unwind().await;
        let disposition = match outcome {
            Ok(Ok(())) => {
                self.attempts.clear(&delivery.retry_key());
                Disposition::Ack
            }
            Ok(Err(e)) if e.is_retryable() => {
                warn!(worker, event_type = %event.event_type, "Handler failed, will retry: {}", e);
                self.retry_or_reject(delivery, shutdown).await
            }
            Ok(Err(e)) => {
                error!(worker, event_type = %event.event_type, "Handler rejected delivery: {}", e);
                self.attempts.clear(&delivery.retry_key());
                Disposition::Reject
            }
            Err(_) => {
                error!(worker, event_type = %event.event_type, "Handler panicked");
                self.retry_or_reject(delivery, shutdown).await
            }
        };
        (event.event_type, disposition)
    }

    /// Counts the failure; requeues after a backoff while attempts remain,
    /// otherwise rejects so the broker dead-letters the message. The backoff
    /// is cut short on shutdown.
    async fn retry_or_reject(&self, delivery: &Delivery, shutdown: &mut ShutdownListener) -> Disposition {
        let key = delivery.retry_key();
        let failures = self.attempts.record_failure(&key);

        if !self.retry.should_retry(failures) {
            warn!(
                retry_key = %key,
                failures,
                max_attempts = self.retry.max_attempts,
                "Delivery attempts exhausted, dead-lettering"
            );
            self.attempts.clear(&key);
            return Disposition::Reject;
        }

        let delay = self.retry.delay_for_attempt(failures - 1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {}
        }
        Disposition::Requeue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_types;
    use crate::metrics::NoopMetrics;
    use crate::shutdown::Shutdown;
    use crate::testing::{MemoryBroker, Settlement};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn pool(size: usize, dispatcher: Dispatcher, retry: RetryPolicy) -> WorkerPool {
        WorkerPool::new(size, dispatcher, retry, Arc::new(NoopMetrics))
    }

    fn created_event(n: usize) -> Event {
        Event::new(event_types::ORDER_CREATED, &serde_json::json!({ "n": n })).unwrap()
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails with a transient error the first `failures` times it is called.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Flaky {
        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(HandlerError::Transient("stock service unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Invalid;

    #[async_trait]
    impl EventHandler for Invalid {
        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            Err(HandlerError::InvalidPayload("missing id".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn every_delivery_settled_exactly_once() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Counting::default());
        let dispatcher = Dispatcher::new().on(event_types::ORDER_CREATED, handler.clone());

        for n in 0..50 {
            broker.publish(&created_event(n));
        }
        broker.close();

        let shutdown = Shutdown::new();
        pool(4, dispatcher, fast_retry(3))
            .run(broker.deliveries(), shutdown.subscribe())
            .await;

        let ledger = broker.ledger();
        assert_eq!(ledger.issued(), 50);
        assert_eq!(ledger.count(Settlement::Acked), 50);
        assert!(ledger.each_settled_once());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn unknown_event_type_is_acked_without_side_effects() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Counting::default());
        let dispatcher = Dispatcher::new().on(event_types::ORDER_CREATED, handler.clone());

        broker.publish(&Event::new("inventory.adjusted", &serde_json::json!({})).unwrap());
        broker.close();

        let shutdown = Shutdown::new();
        pool(2, dispatcher, fast_retry(3))
            .run(broker.deliveries(), shutdown.subscribe())
            .await;

        let ledger = broker.ledger();
        assert_eq!(ledger.count(Settlement::Acked), 1);
        assert_eq!(ledger.count(Settlement::Requeued), 0);
        assert_eq!(ledger.issued(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undecodable_delivery_is_dead_lettered_after_max_attempts() {
        let broker = MemoryBroker::new();
        broker.publish_raw(b"{not json".to_vec(), Some("poison".to_string()));
        broker.close();

        let shutdown = Shutdown::new();
        pool(2, Dispatcher::new(), fast_retry(3))
            .run(broker.deliveries(), shutdown.subscribe())
            .await;

        let ledger = broker.ledger();
        assert_eq!(ledger.count(Settlement::Requeued), 2);
        assert_eq!(ledger.count(Settlement::Rejected), 1);
        assert_eq!(ledger.count(Settlement::Acked), 0);
        assert_eq!(ledger.issued(), 3);
        assert_eq!(ledger.dead_letters(), vec![b"{not json".to_vec()]);
    }

    #[tokio::test]
    async fn transient_failure_is_requeued_then_acked() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new().on(event_types::ORDER_CREATED, handler.clone());

        broker.publish(&created_event(1));
        broker.close();

        let shutdown = Shutdown::new();
        pool(1, dispatcher, fast_retry(5))
            .run(broker.deliveries(), shutdown.subscribe())
            .await;

        let ledger = broker.ledger();
        assert_eq!(ledger.count(Settlement::Requeued), 1);
        assert_eq!(ledger.count(Settlement::Acked), 1);
        assert_eq!(ledger.redelivered(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_rejected_once() {
        let broker = MemoryBroker::new();
        let dispatcher = Dispatcher::new().on(event_types::ORDER_CREATED, Arc::new(Invalid));

        broker.publish(&created_event(1));
        broker.close();

        let shutdown = Shutdown::new();
        pool(2, dispatcher, fast_retry(5))
            .run(broker.deliveries(), shutdown.subscribe())
            .await;

        let ledger = broker.ledger();
        assert_eq!(ledger.count(Settlement::Rejected), 1);
        assert_eq!(ledger.count(Settlement::Requeued), 0);
        assert_eq!(ledger.issued(), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_the_pool() {
        let broker = MemoryBroker::new();
        let counting = Arc::new(Counting::default());
        let dispatcher = Dispatcher::new()
            .on(event_types::ORDER_CREATED, Arc::new(Panicking))
            .on(event_types::ORDER_COMPLETED, counting.clone());

        broker.publish(&created_event(1));
        broker.publish(&Event::new(event_types::ORDER_COMPLETED, &serde_json::json!({})).unwrap());
        broker.close();

        let shutdown = Shutdown::new();
        pool(1, dispatcher, fast_retry(2))
            .run(broker.deliveries(), shutdown.subscribe())
            .await;

        let ledger = broker.ledger();
        assert_eq!(ledger.count(Settlement::Rejected), 1);
        assert_eq!(ledger.count(Settlement::Requeued), 1);
        assert_eq!(ledger.count(Settlement::Acked), 1);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    struct Gate {
        started: tokio::sync::Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Gate {
        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_work() {
        let broker = MemoryBroker::new();
        let gate = Arc::new(Gate {
            started: tokio::sync::Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new().on(event_types::ORDER_CREATED, gate.clone());

        for n in 0..10 {
            broker.publish(&created_event(n));
        }

        let shutdown = Shutdown::new();
        let worker_pool = pool(1, dispatcher, fast_retry(3));
        let deliveries = broker.deliveries();
        let listener = shutdown.subscribe();
        let running = tokio::spawn(async move { worker_pool.run(deliveries, listener).await });

        gate.started.notified().await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("pool did not stop")
            .unwrap();

        let ledger = broker.ledger();
        let processed = gate.calls.load(Ordering::SeqCst);
        assert!(processed >= 1 && processed < 10);
        assert_eq!(ledger.count(Settlement::Acked), processed);
        assert!(ledger.each_settled_once());
    }

    #[test]
    fn retry_key_prefers_message_id() {
        let broker = MemoryBroker::new();
        let with_id = broker.delivery_for_test(b"{}".to_vec(), Some("m-1".to_string()));
        assert_eq!(with_id.retry_key(), "m-1");

        let a = broker.delivery_for_test(b"same".to_vec(), None);
        let b = broker.delivery_for_test(b"same".to_vec(), None);
        assert_eq!(a.retry_key(), b.retry_key());
        assert!(a.retry_key().starts_with("body-"));
    }
}
