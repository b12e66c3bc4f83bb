//! Velocity counters: atomic increment-with-TTL against Redis.
//!
//! One round trip per check. The INCR and the first-increment EXPIRE run in
//! a single Lua script; there is never a read-then-write sequence. On any
//! transport error or deadline miss the check reports `VELOCITY_UNAVAILABLE`
//! and the evaluation continues.

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::{KeysInterface, LuaInterface};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::engine::ruleset::VelocityConfig;

pub const VELOCITY_UNAVAILABLE: &str = "VELOCITY_UNAVAILABLE";

/// INCR plus TTL arming on the first increment, atomically server-side.
const VELOCITY_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Result of one velocity check. Never an Err: failure is a first-class
/// outcome the evaluator records and moves past.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityOutcome {
    pub count: i64,
    pub exceeded: bool,
    pub error: Option<String>,
}

impl VelocityOutcome {
    fn unavailable() -> Self {
        Self {
            count: 0,
            exceeded: false,
            error: Some(VELOCITY_UNAVAILABLE.to_string()),
        }
    }
}

#[async_trait]
pub trait VelocityCheck: Send + Sync {
    /// Increment the counter for `(config.dimension_key, dimension_value)`
    /// and report `(count, count >= threshold)`.
    async fn check(&self, dimension_value: &str, config: &VelocityConfig) -> VelocityOutcome;
}

/// Percent-escape a dimension value so arbitrary field content stays
/// key-safe (no separators, no whitespace, no control bytes).
fn escape_dimension(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Production counter over a shared Redis client.
pub struct RedisVelocityCounter {
    client: Client,
    scope_prefix: String,
    default_window_seconds: i64,
    default_threshold: i64,
    deadline: Duration,
}

impl RedisVelocityCounter {
    pub fn new(
        client: Client,
        scope_prefix: String,
        default_window_seconds: i64,
        default_threshold: i64,
        deadline_ms: u64,
    ) -> Self {
        Self {
            client,
            scope_prefix,
            default_window_seconds,
            default_threshold,
            deadline: Duration::from_millis(deadline_ms),
        }
    }

    fn key(&self, dimension_key: &str, dimension_value: &str) -> String {
        format!(
            "vel:{}:{}:{}",
            self.scope_prefix,
            dimension_key,
            escape_dimension(dimension_value)
        )
    }

    fn effective(&self, config: &VelocityConfig) -> (i64, i64) {
        let window = if config.window_seconds >= 1 {
            config.window_seconds
        } else {
            self.default_window_seconds
        };
        let threshold = if config.threshold >= 1 {
            config.threshold
        } else {
            self.default_threshold
        };
        (window, threshold)
    }

    /// Test hook; production key-space hygiene relies on TTL alone.
    pub async fn reset(&self, dimension_key: &str, dimension_value: &str) {
        let key = self.key(dimension_key, dimension_value);
        let _: Result<i64, _> = self.client.del(key).await;
    }
}

#[async_trait]
impl VelocityCheck for RedisVelocityCounter {
    async fn check(&self, dimension_value: &str, config: &VelocityConfig) -> VelocityOutcome {
        let (window, threshold) = self.effective(config);
        let key = self.key(&config.dimension_key, dimension_value);

        let incr = self
            .client
            .eval::<i64, _, _, _>(VELOCITY_SCRIPT, vec![key.clone()], vec![window]);

        match tokio::time::timeout(self.deadline, incr).await {
            Ok(Ok(count)) => VelocityOutcome {
                count,
                exceeded: count >= threshold,
                error: None,
            },
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Velocity check failed");
                metrics::increment_counter!("velocity_unavailable_total");
                VelocityOutcome::unavailable()
            }
            Err(_) => {
                warn!(key = %key, deadline_ms = self.deadline.as_millis() as u64, "Velocity check deadline exceeded");
                metrics::increment_counter!("velocity_unavailable_total");
                VelocityOutcome::unavailable()
            }
        }
    }
}

/// In-process counter used by tests and local runs without Redis. Mirrors
/// the production TTL semantics (sliding TTL, not sliding window) and
/// counts round trips so tests can assert the one-call contract.
pub struct MemoryVelocity {
    counters: Mutex<HashMap<String, (i64, Instant)>>,
    calls: AtomicU64,
    default_window_seconds: i64,
    default_threshold: i64,
}

impl Default for MemoryVelocity {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVelocity {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
            default_window_seconds: 3600,
            default_threshold: 10,
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn reset(&self, dimension_key: &str, dimension_value: &str) {
        let key = format!("{dimension_key}:{}", escape_dimension(dimension_value));
        self.counters.lock().remove(&key);
    }
}

#[async_trait]
impl VelocityCheck for MemoryVelocity {
    async fn check(&self, dimension_value: &str, config: &VelocityConfig) -> VelocityOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let window = if config.window_seconds >= 1 {
            config.window_seconds
        } else {
            self.default_window_seconds
        };
        let threshold = if config.threshold >= 1 {
            config.threshold
        } else {
            self.default_threshold
        };

        let key = format!(
            "{}:{}",
            config.dimension_key,
            escape_dimension(dimension_value)
        );
        let ttl = Duration::from_secs(window.max(1) as u64);
        let now = Instant::now();

        let mut counters = self.counters.lock();
        let entry = counters.entry(key).or_insert((0, now + ttl));
        if now >= entry.1 {
            *entry = (0, now + ttl);
        }
        entry.0 += 1;
        // Sliding TTL: every increment re-arms the window.
        entry.1 = now + ttl;

        VelocityOutcome {
            count: entry.0,
            exceeded: entry.0 >= threshold,
            error: None,
        }
    }
}

/// A check that always reports unavailable; used when Redis is not
/// configured so evaluations still complete degraded instead of failing.
pub struct UnavailableVelocity;

#[async_trait]
impl VelocityCheck for UnavailableVelocity {
    async fn check(&self, _dimension_value: &str, _config: &VelocityConfig) -> VelocityOutcome {
        VelocityOutcome::unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionOutcome;

    fn config(window: i64, threshold: i64) -> VelocityConfig {
        VelocityConfig {
            dimension_field_id: crate::engine::fields::field_ids::CARD_HASH,
            dimension_key: "card_hash".into(),
            window_seconds: window,
            threshold,
            action: DecisionOutcome::Review,
        }
    }

    #[test]
    fn dimension_values_are_percent_escaped() {
        assert_eq!(escape_dimension("abc-123"), "abc-123");
        assert_eq!(escape_dimension("a b:c"), "a%20b%3Ac");
        assert_eq!(escape_dimension("épée"), "%C3%A9p%C3%A9e");
    }

    #[tokio::test]
    async fn counts_ramp_and_exceed_at_threshold() {
        let velocity = MemoryVelocity::new();
        let cfg = config(3600, 3);

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(velocity.check("abc", &cfg).await);
        }

        let counts: Vec<i64> = results.iter().map(|r| r.count).collect();
        let exceeded: Vec<bool> = results.iter().map(|r| r.exceeded).collect();
        assert_eq!(counts, vec![1, 2, 3, 4]);
        assert_eq!(exceeded, vec![false, false, true, true]);
    }

    #[tokio::test]
    async fn counters_are_independent_per_dimension_value() {
        let velocity = MemoryVelocity::new();
        let cfg = config(3600, 3);

        velocity.check("abc", &cfg).await;
        velocity.check("abc", &cfg).await;
        let other = velocity.check("xyz", &cfg).await;
        assert_eq!(other.count, 1);

        // Different dimension key is a different counter too.
        let mut ip_cfg = config(3600, 3);
        ip_cfg.dimension_key = "ip_address".into();
        let ip = velocity.check("abc", &ip_cfg).await;
        assert_eq!(ip.count, 1);
    }

    #[tokio::test]
    async fn threshold_one_exceeds_on_first_call() {
        let velocity = MemoryVelocity::new();
        let result = velocity.check("abc", &config(60, 1)).await;
        assert_eq!(result.count, 1);
        assert!(result.exceeded);
    }

    #[tokio::test]
    async fn non_positive_config_uses_process_defaults() {
        let velocity = MemoryVelocity::new();
        // threshold 0 falls back to the default of 10.
        let result = velocity.check("abc", &config(0, 0)).await;
        assert_eq!(result.count, 1);
        assert!(!result.exceeded);
    }

    #[tokio::test]
    async fn reset_clears_one_counter() {
        let velocity = MemoryVelocity::new();
        let cfg = config(3600, 3);
        velocity.check("abc", &cfg).await;
        velocity.check("abc", &cfg).await;
        velocity.reset("card_hash", "abc");
        let result = velocity.check("abc", &cfg).await;
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn unavailable_backend_reports_error_not_failure() {
        let outcome = UnavailableVelocity.check("abc", &config(60, 1)).await;
        assert_eq!(outcome.count, 0);
        assert!(!outcome.exceeded);
        assert_eq!(outcome.error.as_deref(), Some(VELOCITY_UNAVAILABLE));
    }
}
