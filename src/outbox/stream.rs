//! Redis Streams outbox backend.
//!
//! One stream key, one consumer group, JSON payload under a single `payload`
//! field. Delivery is at-least-once: entries stay in the group's pending
//! list until XACK, and XAUTOCLAIM recovers entries a dead consumer left
//! behind.

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::StreamsInterface;
use fred::types::streams::{XReadResponse, XID};
use fred::types::Value;
use tracing::{debug, warn};

use super::{Outbox, OutboxEntry, OutboxError, OutboxEvent, PendingSummary};

#[derive(Debug, Clone)]
pub struct StreamOutboxConfig {
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: u64,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
}

pub struct StreamOutbox {
    client: Client,
    config: StreamOutboxConfig,
}

impl StreamOutbox {
    pub fn new(client: Client, config: StreamOutboxConfig) -> Self {
        Self { client, config }
    }

    fn decode_payload(entry_id: &str, payload: Option<&str>) -> Option<OutboxEvent> {
        let raw = payload?;
        match serde_json::from_str::<OutboxEvent>(raw) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(entry_id, error = %e, "Outbox payload failed to decode");
                None
            }
        }
    }

    /// Decode one `[id, [k, v, ...]]` stream entry from a raw reply value.
    fn decode_raw_entry(value: &Value) -> Option<OutboxEntry> {
        let Value::Array(parts) = value else {
            return None;
        };
        let entry_id = parts.first()?.as_str()?.to_string();

        // Field lists arrive as `[k, v, ...]` arrays on RESP2 and as maps on
        // RESP3; fred converts either shape to a HashMap.
        let payload = parts
            .get(1)
            .cloned()
            .and_then(|fields| {
                fields
                    .convert::<std::collections::HashMap<String, String>>()
                    .ok()
            })
            .and_then(|map| map.get("payload").cloned());

        let event = Self::decode_payload(&entry_id, payload.as_deref());
        Some(OutboxEntry { entry_id, event })
    }
}

fn transport(e: fred::error::Error) -> OutboxError {
    OutboxError::Transport(e.to_string())
}

#[async_trait]
impl Outbox for StreamOutbox {
    async fn append(&self, event: &OutboxEvent) -> Result<String, OutboxError> {
        let payload = serde_json::to_string(event)?;
        let id: String = self
            .client
            .xadd(&self.config.stream_key, false, None, "*", ("payload", payload))
            .await
            .map_err(transport)?;
        Ok(id)
    }

    async fn read_batch(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        let reply: XReadResponse<String, String, String, String> = self
            .client
            .xreadgroup_map(
                &self.config.group,
                &self.config.consumer,
                Some(self.config.batch_size),
                Some(self.config.block_ms),
                false,
                &self.config.stream_key,
                XID::NewInGroup,
            )
            .await
            .map_err(transport)?;

        let mut batch = Vec::new();
        for (_stream, entries) in reply {
            for (entry_id, fields) in entries {
                let payload = fields.get("payload").map(String::as_str);
                let event = Self::decode_payload(&entry_id, payload);
                batch.push(OutboxEntry { entry_id, event });
            }
        }
        Ok(batch)
    }

    async fn ack(&self, entry_id: &str) -> Result<(), OutboxError> {
        let _: u64 = self
            .client
            .xack(&self.config.stream_key, &self.config.group, entry_id)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn ensure_group(&self) -> Result<(), OutboxError> {
        let result: Result<(), _> = self
            .client
            .xgroup_create(
                &self.config.stream_key,
                &self.config.group,
                XID::Manual("0".into()),
                true,
            )
            .await;

        match result {
            Ok(()) => {
                debug!(
                    stream = %self.config.stream_key,
                    group = %self.config.group,
                    "Consumer group created"
                );
                Ok(())
            }
            // The group already existing is the idempotent success case.
            Err(e) if e.details().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(transport(e)),
        }
    }

    async fn pending_summary(&self) -> Result<PendingSummary, OutboxError> {
        // Summary form: [count, min-id, max-id, [[consumer, count], ...]].
        let summary: Value = self
            .client
            .xpending(&self.config.stream_key, &self.config.group, ())
            .await
            .map_err(transport)?;

        let total_pending = match &summary {
            Value::Array(parts) => parts.first().and_then(|v| v.as_u64()).unwrap_or(0),
            _ => 0,
        };

        if total_pending == 0 {
            return Ok(PendingSummary::default());
        }

        // Extended form for the oldest entry's idle time:
        // [[id, consumer, idle-ms, deliveries], ...].
        let oldest: Value = self
            .client
            .xpending(&self.config.stream_key, &self.config.group, ("-", "+", 1))
            .await
            .map_err(transport)?;

        let oldest_idle_ms = match &oldest {
            Value::Array(entries) => entries.first().and_then(|entry| match entry {
                Value::Array(parts) => parts.get(2).and_then(|v| v.as_u64()),
                _ => None,
            }),
            _ => None,
        };

        Ok(PendingSummary {
            total_pending,
            oldest_idle_ms,
        })
    }

    async fn claim_idle(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        // Reply: [next-cursor, [[id, fields], ...], (deleted ids on 7.x)].
        let reply: Value = self
            .client
            .xautoclaim(
                &self.config.stream_key,
                &self.config.group,
                &self.config.consumer,
                self.config.claim_idle_ms,
                XID::Manual("0-0".into()),
                Some(self.config.batch_size),
                false,
            )
            .await
            .map_err(transport)?;

        let Value::Array(parts) = reply else {
            return Ok(Vec::new());
        };
        let Some(Value::Array(raw_entries)) = parts.get(1) else {
            return Ok(Vec::new());
        };

        Ok(raw_entries
            .iter()
            .filter_map(Self::decode_raw_entry)
            .collect())
    }
}
