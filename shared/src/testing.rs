//! In-memory stand-ins for the broker, used by unit tests here and in the
//! service crates (through the `testing` feature).
//!
//! `MemoryBroker` behaves like a single AMQP queue: a nack with requeue puts
//! the message back with `redelivered = true`, a nack without requeue parks
//! it (dead-letter). Every settlement is recorded in a `Ledger` keyed by a
//! per-delivery tag.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::broker::EventPublisher;
use crate::consumer::{Acknowledger, Delivery, DeliveryStream};
use crate::error::BrokerError;
use crate::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    Rejected,
}

#[derive(Debug, Default)]
pub struct Ledger {
    issued: AtomicU64,
    redelivered: AtomicU64,
    settlements: Mutex<Vec<(u64, Settlement)>>,
    dead_letters: Mutex<Vec<Vec<u8>>>,
}

impl Ledger {
    fn next_tag(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, tag: u64, settlement: Settlement) {
        self.settlements.lock().unwrap().push((tag, settlement));
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst) as usize
    }

    pub fn redelivered(&self) -> usize {
        self.redelivered.load(Ordering::SeqCst) as usize
    }

    pub fn count(&self, settlement: Settlement) -> usize {
        self.settlements
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == settlement)
            .count()
    }

    /// True when no delivery tag was settled more than once.
    pub fn each_settled_once(&self) -> bool {
        let settlements = self.settlements.lock().unwrap();
        let mut tags: Vec<u64> = settlements.iter().map(|(tag, _)| *tag).collect();
        let total = tags.len();
        tags.sort_unstable();
        tags.dedup();
        tags.len() == total
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.dead_letters.lock().unwrap().clone()
    }
}

struct MemoryAcker {
    tag: u64,
    body: Vec<u8>,
    message_id: Option<String>,
    queue: mpsc::UnboundedSender<Delivery>,
    ledger: Arc<Ledger>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.ledger.record(self.tag, Settlement::Acked);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            self.ledger.record(self.tag, Settlement::Requeued);
            self.ledger.redelivered.fetch_add(1, Ordering::SeqCst);
            let redelivery = new_delivery(
                &self.ledger,
                &self.queue,
                self.body.clone(),
                self.message_id.clone(),
                true,
            );
            let _ = self.queue.send(redelivery);
        } else {
            self.ledger.record(self.tag, Settlement::Rejected);
            self.ledger.dead_letters.lock().unwrap().push(self.body.clone());
        }
        Ok(())
    }
}

fn new_delivery(
    ledger: &Arc<Ledger>,
    queue: &mpsc::UnboundedSender<Delivery>,
    body: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
) -> Delivery {
    let acker = MemoryAcker {
        tag: ledger.next_tag(),
        body: body.clone(),
        message_id: message_id.clone(),
        queue: queue.clone(),
        ledger: ledger.clone(),
    };
    Delivery::new(body, message_id, redelivered, Box::new(acker))
}

pub struct MemoryBroker {
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    ledger: Arc<Ledger>,
    next_message_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            ledger: Arc::new(Ledger::default()),
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Enqueues an event with a fresh message id, as the AMQP publisher does.
    pub fn publish(&self, event: &Event) {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let body = event.to_bytes().expect("event encodes");
        self.publish_raw(body, Some(format!("msg-{}", id)));
    }

    pub fn publish_raw(&self, body: Vec<u8>, message_id: Option<String>) {
        let guard = self.sender.lock().unwrap();
        let sender = guard.as_ref().expect("broker is closed");
        let delivery = new_delivery(&self.ledger, sender, body, message_id, false);
        sender.send(delivery).expect("queue receiver dropped");
    }

    /// Stops accepting publishes. The delivery stream ends once every
    /// outstanding delivery has been settled without requeue.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn deliveries(&self) -> DeliveryStream {
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .expect("deliveries already taken");
        stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        })
        .boxed()
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }

    /// A delivery that is not enqueued, for tests that settle by hand.
    pub fn delivery_for_test(&self, body: Vec<u8>, message_id: Option<String>) -> Delivery {
        let (sender, _receiver) = mpsc::unbounded_channel();
        new_delivery(&self.ledger, &sender, body, message_id, false)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Records published events; can be switched to fail every publish.
#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<Event>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, event: &Event) -> Result<(), BrokerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
