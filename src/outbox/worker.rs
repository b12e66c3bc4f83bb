//! Outbox consumer.
//!
//! Drains upstream AUTH events and, for each entry: publishes the upstream
//! decision, runs the derived MONITORING evaluation, publishes the derived
//! decision, then acks. Any publish failure leaves the entry unacked for
//! redelivery. Degenerate entries are acked and counted so they cannot
//! cause redelivery storms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Outbox, OutboxEntry, OutboxEvent};
use crate::models::TransactionRequest;
use crate::publish::DecisionPublisher;
use crate::service::EvalService;

pub struct OutboxWorker {
    outbox: Arc<dyn Outbox>,
    publisher: Arc<dyn DecisionPublisher>,
    service: Arc<EvalService>,
    claim_interval: Duration,
    poison_entries: AtomicU64,
}

impl OutboxWorker {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        publisher: Arc<dyn DecisionPublisher>,
        service: Arc<EvalService>,
        claim_interval: Duration,
    ) -> Self {
        Self {
            outbox,
            publisher,
            service,
            claim_interval,
            poison_entries: AtomicU64::new(0),
        }
    }

    pub fn poison_count(&self) -> u64 {
        self.poison_entries.load(Ordering::Relaxed)
    }

    /// Consumer loop. Claims a dead sibling's pending entries on startup
    /// and periodically thereafter.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.outbox.ensure_group().await {
            warn!(error = %e, "Consumer group creation failed; continuing");
        }

        self.recover_pending().await;
        info!("Outbox worker started");

        let mut claim_ticker = tokio::time::interval(self.claim_interval);
        claim_ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Outbox worker stopping");
                        return;
                    }
                }
                _ = claim_ticker.tick() => {
                    self.recover_pending().await;
                }
                batch = self.outbox.read_batch() => {
                    match batch {
                        Ok(entries) if entries.is_empty() => {
                            // Backends without server-side blocking return
                            // immediately; avoid a hot spin.
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Ok(entries) => {
                            for entry in entries {
                                self.handle_entry(entry).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Outbox read failed; backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    async fn recover_pending(&self) {
        match self.outbox.claim_idle().await {
            Ok(claimed) if !claimed.is_empty() => {
                info!(count = claimed.len(), "Claimed idle pending entries");
                for entry in claimed {
                    self.handle_entry(entry).await;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Pending-claim sweep failed"),
        }
    }

    /// Process one entry. Acks only after both publishes succeed; processes
    /// in order publish(upstream) -> evaluate -> publish(derived).
    pub async fn handle_entry(&self, entry: OutboxEntry) {
        let entry_id = entry.entry_id.clone();

        let Some(event) = entry.event else {
            self.ack_poison(&entry_id, "undecodable payload").await;
            return;
        };

        let OutboxEvent {
            transaction: Some(transaction),
            upstream_decision: Some(upstream),
        } = event
        else {
            self.ack_poison(&entry_id, "missing transaction or upstream decision")
                .await;
            return;
        };

        let request = match serde_json::from_value::<TransactionRequest>(transaction) {
            Ok(request) => request,
            Err(e) => {
                self.ack_poison(&entry_id, &format!("transaction not decodable: {e}"))
                    .await;
                return;
            }
        };

        if let Err(e) = self.publisher.publish(&upstream).await {
            // Unacked: the entry is redelivered and retried from the top.
            error!(entry_id = %entry_id, error = %e, "Upstream decision publish failed; leaving unacked");
            return;
        }

        let derived = self
            .service
            .evaluate_normalized(&request, upstream.decision)
            .await;

        if let Err(e) = self.publisher.publish(&derived).await {
            error!(entry_id = %entry_id, error = %e, "Derived decision publish failed; leaving unacked");
            return;
        }

        if let Err(e) = self.outbox.ack(&entry_id).await {
            // Publishes landed; redelivery will duplicate them, which
            // at-least-once consumers must tolerate.
            warn!(entry_id = %entry_id, error = %e, "Ack failed after successful publishes");
            return;
        }

        debug!(entry_id = %entry_id, transaction_id = %derived.transaction_id, "Outbox entry processed");
        metrics::increment_counter!("outbox_entries_processed_total");
    }

    async fn ack_poison(&self, entry_id: &str, reason: &str) {
        warn!(entry_id, reason, "Skipping degenerate outbox entry");
        self.poison_entries.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("outbox_poison_entries_total");
        if let Err(e) = self.outbox.ack(entry_id).await {
            warn!(entry_id, error = %e, "Failed to ack poison entry");
        }
    }
}
