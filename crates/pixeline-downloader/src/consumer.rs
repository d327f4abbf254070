//! Download-queue consumer.
//!
//! Deliveries are processed up to `prefetch` at a time. Every parsed message
//! is acked once handled, whatever the outcome; unparseable ones are rejected
//! without requeue. Successful downloads are announced on the embedding queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use pixeline_core::CancellationToken;

use crate::broker::{Broker, Delivery, Subscription, publish_json};
use crate::download::{Downloaded, Downloader};
use crate::messages::{EmbeddingEvent, parse_download_request};

pub struct Consumer {
    downloader: Arc<Downloader>,
    broker: Arc<dyn Broker>,
    embedding_queue: String,
    prefetch: u16,
}

impl Consumer {
    pub fn new(
        downloader: Arc<Downloader>,
        broker: Arc<dyn Broker>,
        embedding_queue: impl Into<String>,
        prefetch: u16,
    ) -> Self {
        Self {
            downloader,
            broker,
            embedding_queue: embedding_queue.into(),
            prefetch: prefetch.max(1),
        }
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    /// Consume until the subscription ends or `shutdown` fires.
    ///
    /// On shutdown no new deliveries are taken and in-flight ones are
    /// dropped unacked, so the broker redelivers them. Returns the number of
    /// deliveries fully handled.
    pub async fn run(&self, subscription: Subscription, shutdown: &CancellationToken) -> u64 {
        let handled = AtomicU64::new(0);
        subscription
            .take_until(shutdown.cancelled())
            .for_each_concurrent(usize::from(self.prefetch), |item| {
                let handled = &handled;
                async move {
                    let delivery = match item {
                        Ok(d) => d,
                        Err(e) => {
                            log::error!("Delivery failed: {e}");
                            return;
                        }
                    };
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            log::debug!("Dropping in-flight delivery on shutdown");
                        }
                        _ = self.handle(delivery) => {
                            handled.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;
        handled.load(Ordering::Relaxed)
    }

    /// Process one delivery to completion and settle it.
    pub async fn handle(&self, delivery: Box<dyn Delivery>) {
        let request = match parse_download_request(delivery.payload()) {
            Ok(r) => r,
            Err(reason) => {
                log::warn!(
                    "Dropping malformed message ({reason}): {}",
                    String::from_utf8_lossy(delivery.payload())
                );
                self.downloader.stats().record_malformed();
                if let Err(e) = delivery.reject().await {
                    log::error!("Failed to reject message: {e}");
                }
                return;
            }
        };

        if let Some(done) = self.downloader.process(&request.url).await {
            self.announce(&done).await;
        }
        if let Err(e) = delivery.ack().await {
            log::error!("Failed to ack {}: {e}", request.url);
        }
    }

    /// Fire-and-forget event for the embedding stage
    async fn announce(&self, done: &Downloaded) {
        let event = EmbeddingEvent {
            image_id: done.id,
            image_url: done.url.clone(),
            image_path: done.path.to_string_lossy().into_owned(),
        };
        if let Err(e) = publish_json(self.broker.as_ref(), &self.embedding_queue, &event).await {
            log::error!("Failed to publish embedding event for {}: {e}", done.url);
        }
    }
}
