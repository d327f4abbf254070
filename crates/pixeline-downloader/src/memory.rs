//! In-process broker.
//!
//! Each queue is an unbounded channel with a single subscriber. Prefetch is
//! enforced with a semaphore: a delivery holds a permit until it is acked or
//! rejected (or dropped, which models a redelivery-free loss).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

use crate::broker::{Broker, BrokerError, Delivery, Subscription};

#[derive(Debug, Default)]
struct Counters {
    acked: AtomicU64,
    rejected: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

#[derive(Debug)]
struct QueueState {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    published: Vec<Vec<u8>>,
}

impl QueueState {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
            published: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<FxHashMap<String, QueueState>>,
    counters: Arc<Counters>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        f(queues
            .entry(queue.to_string())
            .or_insert_with(QueueState::new))
    }

    /// Every payload published to `queue`, in order
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.published.clone())
    }

    /// Published payloads decoded as JSON
    pub fn published_json<T: serde::de::DeserializeOwned>(&self, queue: &str) -> Vec<T> {
        self.published(queue)
            .iter()
            .filter_map(|p| serde_json::from_slice(p).ok())
            .collect()
    }

    /// End the subscription stream of `queue` once it drains; later publishes fail
    pub fn close(&self, queue: &str) {
        self.with_queue(queue, |q| q.tx = None);
    }

    pub fn acked(&self) -> u64 {
        self.counters.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.counters.rejected.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously unsettled deliveries seen
    pub fn max_in_flight(&self) -> u64 {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        self.with_queue(queue, |_| ());
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.with_queue(queue, |q| -> Result<(), BrokerError> {
            let tx = q
                .tx
                .as_ref()
                .ok_or_else(|| BrokerError::Closed(queue.to_string()))?;
            tx.send(payload.to_vec())
                .map_err(|_| BrokerError::Closed(queue.to_string()))?;
            q.published.push(payload.to_vec());
            Ok(())
        })
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError> {
        let rx = self
            .with_queue(queue, |q| q.rx.take())
            .ok_or_else(|| BrokerError::Closed(format!("{queue} already has a subscriber")))?;
        let permits = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
        let counters = Arc::clone(&self.counters);

        let stream = futures_util::stream::unfold(
            (rx, permits, counters),
            |(mut rx, permits, counters)| async move {
                let permit = Arc::clone(&permits).acquire_owned().await.ok()?;
                let payload = rx.recv().await?;
                let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
                let delivery = MemoryDelivery {
                    payload,
                    permit: Mutex::new(Some(permit)),
                    counters: Arc::clone(&counters),
                };
                Some((
                    Ok(Box::new(delivery) as Box<dyn Delivery>),
                    (rx, permits, counters),
                ))
            },
        );
        Ok(stream.boxed())
    }
}

struct MemoryDelivery {
    payload: Vec<u8>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    counters: Arc<Counters>,
}

impl MemoryDelivery {
    fn settle(&self, counter: &AtomicU64) -> Result<(), BrokerError> {
        let permit = self
            .permit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| BrokerError::Closed("delivery already settled".to_string()))?;
        counter.fetch_add(1, Ordering::SeqCst);
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
        Ok(())
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        let unsettled = self
            .permit
            .get_mut()
            .map(|p| p.is_some())
            .unwrap_or(false);
        if unsettled {
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(&self.counters.acked)
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.settle(&self.counters.rejected)
    }
}
