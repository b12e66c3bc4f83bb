//! Durable single-consumer outbox.
//!
//! Upstream AUTH events are appended to a stream; this service consumes
//! them at-least-once to drive derived MONITORING evaluations. Two backends
//! sit behind one facade: in-memory for tests and Redis Streams for
//! production.

pub mod memory;
pub mod stream;
pub mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::Decision;

pub use memory::MemoryOutbox;
pub use stream::StreamOutbox;
pub use worker::OutboxWorker;

/// One upstream AUTH event: the transaction payload plus the authoritative
/// decision the AUTH service already published for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboxEvent {
    #[serde(default)]
    pub transaction: Option<serde_json::Value>,
    #[serde(default)]
    pub upstream_decision: Option<Decision>,
}

/// A delivered entry. `event` is `None` when the payload did not decode;
/// such poison entries are acked and counted rather than redelivered
/// forever.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub entry_id: String,
    pub event: Option<OutboxEvent>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSummary {
    pub total_pending: u64,
    pub oldest_idle_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox transport error: {0}")]
    Transport(String),
    #[error("outbox serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait Outbox: Send + Sync {
    /// Durably enqueue an event; returns a monotonic string id.
    async fn append(&self, event: &OutboxEvent) -> Result<String, OutboxError>;

    /// Pull up to the configured batch size for this consumer, blocking up
    /// to the configured block time when the stream is empty.
    async fn read_batch(&self) -> Result<Vec<OutboxEntry>, OutboxError>;

    /// Mark one entry delivered. Unacked entries are redelivered.
    async fn ack(&self, entry_id: &str) -> Result<(), OutboxError>;

    /// Idempotent consumer-group creation.
    async fn ensure_group(&self) -> Result<(), OutboxError>;

    async fn pending_summary(&self) -> Result<PendingSummary, OutboxError>;

    /// Claim entries another consumer left pending beyond the idle
    /// threshold, so a crashed sibling's work resumes here.
    async fn claim_idle(&self) -> Result<Vec<OutboxEntry>, OutboxError>;
}
