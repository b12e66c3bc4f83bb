//! In-memory outbox backend for tests and local runs.
//!
//! Mirrors the stream backend's delivery semantics: reads move entries to a
//! pending set, acks delete them, unacked entries can be re-claimed after
//! an idle threshold.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{Outbox, OutboxEntry, OutboxError, OutboxEvent, PendingSummary};

struct PendingEntry {
    event: Option<OutboxEvent>,
    delivered_at: Instant,
}

pub struct MemoryOutbox {
    queue: Mutex<VecDeque<(String, Option<OutboxEvent>)>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    sequence: AtomicU64,
    batch_size: usize,
    claim_idle_after: Duration,
}

impl MemoryOutbox {
    pub fn new(batch_size: usize, claim_idle_after: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            batch_size: batch_size.max(1),
            claim_idle_after,
        }
    }

    /// Push a raw payload that will fail to decode: a poison entry.
    pub fn append_poison(&self) -> String {
        let id = self.next_id();
        self.queue.lock().push_back((id.clone(), None));
        id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{seq:016}")
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn append(&self, event: &OutboxEvent) -> Result<String, OutboxError> {
        let id = self.next_id();
        self.queue.lock().push_back((id.clone(), Some(event.clone())));
        Ok(id)
    }

    async fn read_batch(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        let mut queue = self.queue.lock();
        let mut pending = self.pending.lock();
        let now = Instant::now();

        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            let Some((entry_id, event)) = queue.pop_front() else {
                break;
            };
            pending.insert(
                entry_id.clone(),
                PendingEntry {
                    event: event.clone(),
                    delivered_at: now,
                },
            );
            batch.push(OutboxEntry { entry_id, event });
        }
        Ok(batch)
    }

    async fn ack(&self, entry_id: &str) -> Result<(), OutboxError> {
        self.pending.lock().remove(entry_id);
        Ok(())
    }

    async fn ensure_group(&self) -> Result<(), OutboxError> {
        Ok(())
    }

    async fn pending_summary(&self) -> Result<PendingSummary, OutboxError> {
        let pending = self.pending.lock();
        let now = Instant::now();
        let oldest_idle_ms = pending
            .values()
            .map(|e| now.saturating_duration_since(e.delivered_at).as_millis() as u64)
            .max();
        Ok(PendingSummary {
            total_pending: pending.len() as u64,
            oldest_idle_ms,
        })
    }

    async fn claim_idle(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        let mut pending = self.pending.lock();
        let now = Instant::now();

        let mut claimed = Vec::new();
        for (entry_id, entry) in pending.iter_mut() {
            if now.saturating_duration_since(entry.delivered_at) >= self.claim_idle_after {
                entry.delivered_at = now;
                claimed.push(OutboxEntry {
                    entry_id: entry_id.clone(),
                    event: entry.event.clone(),
                });
            }
        }
        claimed.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outbox() -> MemoryOutbox {
        MemoryOutbox::new(10, Duration::from_secs(60))
    }

    fn event(txn_id: &str) -> OutboxEvent {
        OutboxEvent {
            transaction: Some(json!({"transaction_id": txn_id})),
            upstream_decision: None,
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let outbox = outbox();
        let a = outbox.append(&event("a")).await.unwrap();
        let b = outbox.append(&event("b")).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn read_moves_entries_to_pending_until_acked() {
        let outbox = outbox();
        outbox.append(&event("a")).await.unwrap();
        outbox.append(&event("b")).await.unwrap();

        let batch = outbox.read_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(outbox.queue_len(), 0);
        assert_eq!(outbox.pending_len(), 2);

        outbox.ack(&batch[0].entry_id).await.unwrap();
        assert_eq!(outbox.pending_len(), 1);

        let summary = outbox.pending_summary().await.unwrap();
        assert_eq!(summary.total_pending, 1);
    }

    #[tokio::test]
    async fn idle_entries_are_reclaimed() {
        let outbox = MemoryOutbox::new(10, Duration::from_millis(20));
        outbox.append(&event("a")).await.unwrap();
        let batch = outbox.read_batch().await.unwrap();

        // Fresh pending entries are not claimable.
        assert!(outbox.claim_idle().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let claimed = outbox.claim_idle().await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].entry_id, batch[0].entry_id);
    }

    #[tokio::test]
    async fn batch_size_bounds_reads() {
        let outbox = MemoryOutbox::new(2, Duration::from_secs(60));
        for i in 0..5 {
            outbox.append(&event(&i.to_string())).await.unwrap();
        }
        assert_eq!(outbox.read_batch().await.unwrap().len(), 2);
        assert_eq!(outbox.queue_len(), 3);
    }
}
