//! Decision publishing.
//!
//! Decisions go to a durable event stream. The HTTP path publishes
//! asynchronously through a bounded queue so the response never waits on
//! the stream; the outbox worker publishes inline because its ack depends
//! on publish success.

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::StreamsInterface;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::Decision;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("PUBLISH_FAILED: {0}")]
    Failed(String),
    #[error("publish serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait DecisionPublisher: Send + Sync {
    async fn publish(&self, decision: &Decision) -> Result<(), PublishError>;
}

/// Appends decisions to a Redis stream as a single JSON `payload` field.
pub struct StreamPublisher {
    client: Client,
    stream_key: String,
}

impl StreamPublisher {
    pub fn new(client: Client, stream_key: String) -> Self {
        Self { client, stream_key }
    }
}

#[async_trait]
impl DecisionPublisher for StreamPublisher {
    async fn publish(&self, decision: &Decision) -> Result<(), PublishError> {
        let payload = serde_json::to_string(decision)?;
        let _: String = self
            .client
            .xadd(&self.stream_key, false, None, "*", ("payload", payload))
            .await
            .map_err(|e| PublishError::Failed(e.to_string()))?;
        Ok(())
    }
}

/// Publisher used when no event stream is configured: decisions are
/// dropped with a counter so the degradation is visible to operators.
pub struct NoopPublisher;

#[async_trait]
impl DecisionPublisher for NoopPublisher {
    async fn publish(&self, decision: &Decision) -> Result<(), PublishError> {
        metrics::increment_counter!("decision_publish_noop_total");
        tracing::debug!(transaction_id = %decision.transaction_id, "No publisher configured; dropping decision");
        Ok(())
    }
}

/// Test sink: records published decisions, optionally failing on demand.
#[derive(Default)]
pub struct SinkPublisher {
    decisions: Mutex<Vec<Decision>>,
    fail: AtomicBool,
}

impl SinkPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Decision> {
        self.decisions.lock().clone()
    }

    pub fn published_count(&self) -> usize {
        self.decisions.lock().len()
    }
}

#[async_trait]
impl DecisionPublisher for SinkPublisher {
    async fn publish(&self, decision: &Decision) -> Result<(), PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Failed("sink failing".to_string()));
        }
        self.decisions.lock().push(decision.clone());
        Ok(())
    }
}

/// Bounded async publish queue for the request path. Enqueue never blocks;
/// when the queue is full the decision is dropped with a warning rather
/// than stalling a response.
#[derive(Clone)]
pub struct PublishQueue {
    tx: mpsc::Sender<Decision>,
}

impl PublishQueue {
    pub fn start(
        publisher: Arc<dyn DecisionPublisher>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Decision>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(decision) = rx.recv().await {
                if let Err(e) = publisher.publish(&decision).await {
                    warn!(
                        transaction_id = %decision.transaction_id,
                        error = %e,
                        "Async decision publish failed"
                    );
                    metrics::increment_counter!("decision_publish_failed_total");
                } else {
                    metrics::increment_counter!("decision_publish_total");
                }
            }
            info!("Publish queue drained");
        });

        (Self { tx }, handle)
    }

    pub fn enqueue(&self, decision: Decision) {
        if let Err(e) = self.tx.try_send(decision) {
            warn!(error = %e, "Publish queue full; dropping decision");
            metrics::increment_counter!("decision_publish_dropped_total");
        }
    }

    /// Close the queue and wait for the worker to drain what was already
    /// enqueued, bounded by `timeout`.
    pub async fn shutdown(self, handle: JoinHandle<()>, timeout: Duration) {
        drop(self.tx);
        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!("Publish queue did not drain within shutdown timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionOutcome;

    fn decision(id: &str) -> Decision {
        Decision::degraded(id.to_string(), DecisionOutcome::Approve, None, "INTERNAL_ERROR")
    }

    #[tokio::test]
    async fn queue_publishes_asynchronously_and_drains_on_shutdown() {
        let sink = Arc::new(SinkPublisher::new());
        let (queue, handle) = PublishQueue::start(sink.clone(), 16);

        queue.enqueue(decision("txn-1"));
        queue.enqueue(decision("txn-2"));
        queue.shutdown(handle, Duration::from_secs(1)).await;

        let published = sink.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].transaction_id, "txn-1");
    }

    #[tokio::test]
    async fn publish_failures_do_not_stop_the_queue() {
        let sink = Arc::new(SinkPublisher::new());
        sink.set_failing(true);
        let (queue, handle) = PublishQueue::start(sink.clone(), 16);

        queue.enqueue(decision("txn-1"));
        sink.set_failing(false);
        queue.enqueue(decision("txn-2"));
        queue.shutdown(handle, Duration::from_secs(1)).await;

        // txn-1 was lost to the failing sink; txn-2 made it through.
        let published = sink.published();
        assert!(published.iter().any(|d| d.transaction_id == "txn-2"));
    }
}
