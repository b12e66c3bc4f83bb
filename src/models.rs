use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Evaluation modes supported by the engine.
///
/// AUTH is first-match with an authoritative decision; MONITORING is
/// all-match with the decision supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationType {
    Auth,
    Monitoring,
}

impl EvaluationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationType::Auth => "AUTH",
            EvaluationType::Monitoring => "MONITORING",
        }
    }
}

/// Final decision outcome carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionOutcome {
    Approve,
    Decline,
    Review,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Approve => "APPROVE",
            DecisionOutcome::Decline => "DECLINE",
            DecisionOutcome::Review => "REVIEW",
        }
    }

    /// Normalize a caller-supplied decision string.
    ///
    /// `APPROVE|APPROVED|ALLOW` map to APPROVE and `DECLINE|DECLINED|BLOCK`
    /// map to DECLINE. Anything else is rejected at the request boundary.
    pub fn normalize(raw: &str) -> Option<DecisionOutcome> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "APPROVE" | "APPROVED" | "ALLOW" => Some(DecisionOutcome::Approve),
            "DECLINE" | "DECLINED" | "BLOCK" => Some(DecisionOutcome::Decline),
            _ => None,
        }
    }
}

/// How the engine arrived at the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineMode {
    Normal,
    Degraded,
    FailOpen,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Normal => "NORMAL",
            EngineMode::Degraded => "DEGRADED",
            EngineMode::FailOpen => "FAIL_OPEN",
        }
    }
}

/// Incoming transaction payload.
///
/// The caller-supplied `decision` is pulled out; every other field stays in
/// the raw map and is resolved against the field registry when the record
/// is built. Unknown fields are ignored by construction.
///
/// Serde impls are hand-written instead of `#[serde(flatten)]`: flatten
/// buffers values through serde's internal Content type, which mangles
/// arbitrary-precision numbers, and exact amount digits are part of the
/// wire contract.
#[derive(Debug, Clone, Default)]
pub struct TransactionRequest {
    pub decision: Option<String>,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl<'de> Deserialize<'de> for TransactionRequest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut fields = serde_json::Map::deserialize(deserializer)?;
        let decision = match fields.remove("decision") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        Ok(Self { decision, fields })
    }
}

impl Serialize for TransactionRequest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let extra = usize::from(self.decision.is_some());
        let mut map = serializer.serialize_map(Some(self.fields.len() + extra))?;
        if let Some(decision) = &self.decision {
            map.serialize_entry("decision", decision)?;
        }
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl TransactionRequest {
    pub fn transaction_id(&self) -> Option<&str> {
        self.fields.get("transaction_id").and_then(|v| v.as_str())
    }

    pub fn country_code(&self) -> Option<&str> {
        self.fields.get("country_code").and_then(|v| v.as_str())
    }

    pub fn transaction_type(&self) -> Option<&str> {
        self.fields.get("transaction_type").and_then(|v| v.as_str())
    }
}

/// One matched rule in a MONITORING response. Matches are informational;
/// they never alter the caller-supplied decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedRule {
    pub id: i64,
    pub name: String,
    pub action: DecisionOutcome,
    pub priority: i32,
    pub conditions_met: Vec<String>,
}

/// Outcome of one velocity check, keyed by rule name in the decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityResult {
    pub rule_id: i64,
    pub dimension: String,
    pub count: i64,
    pub threshold: i64,
    pub exceeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-phase latency capture, milliseconds. Monotonic clock only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingBreakdown {
    pub ruleset_lookup_ms: f64,
    pub rule_evaluation_ms: f64,
    pub velocity_ms: f64,
    pub total_ms: f64,
}

/// Per-condition capture emitted when debug mode samples an evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionEvaluation {
    pub rule_id: i64,
    pub field: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    pub matched: bool,
    pub nanos: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugInfo {
    pub condition_evaluations: Vec<ConditionEvaluation>,
    /// True when the capture hit the configured cap and stopped recording.
    pub truncated: bool,
}

/// The published evaluation result. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub transaction_id: String,
    pub evaluation_type: EvaluationType,
    pub decision: DecisionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset_version: Option<i64>,
    pub engine_mode: EngineMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_error_code: Option<String>,
    pub matched_rules: Vec<MatchedRule>,
    /// Keyed by rule name; BTreeMap keeps serialization deterministic.
    pub velocity_results: BTreeMap<String, VelocityResult>,
    pub timing_breakdown: TimingBreakdown,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_context_snapshot: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<DebugInfo>,
    pub evaluated_at: DateTime<Utc>,
}

impl Decision {
    /// Degraded decision preserving the caller-supplied outcome. Used for
    /// load shedding, missing rulesets, and internal faults: the service
    /// never surfaces a 5xx for an evaluation fault.
    pub fn degraded(
        transaction_id: String,
        decision: DecisionOutcome,
        ruleset_key: Option<String>,
        error_code: &str,
    ) -> Self {
        Decision {
            transaction_id,
            evaluation_type: EvaluationType::Monitoring,
            decision,
            ruleset_key,
            ruleset_version: None,
            engine_mode: EngineMode::Degraded,
            engine_error_code: Some(error_code.to_string()),
            matched_rules: Vec::new(),
            velocity_results: BTreeMap::new(),
            timing_breakdown: TimingBreakdown::default(),
            transaction_context_snapshot: None,
            debug_info: None,
            evaluated_at: Utc::now(),
        }
    }
}

/// Debug-capture knobs. `enabled` is fixed at process start; when false the
/// evaluator takes the capture-free path with no per-condition bookkeeping.
#[derive(Debug, Clone)]
pub struct DebugConfig {
    pub enabled: bool,
    /// 0-100; percentage of evaluations that capture condition detail.
    pub sample_rate: u8,
    pub include_field_values: bool,
    pub max_condition_evaluations: usize,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 100,
            include_field_values: true,
            max_condition_evaluations: 100,
        }
    }
}

/// Application configuration, env-var driven.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub poll_interval_seconds: u64,
    pub required_ruleset_keys: Vec<String>,
    pub max_concurrent: usize,
    pub request_deadline_ms: u64,
    pub shutdown_grace_seconds: u64,

    pub redis_url: String,
    pub velocity_default_window_seconds: i64,
    pub velocity_default_threshold: i64,
    pub velocity_deadline_ms: u64,
    pub velocity_scope_prefix: String,

    pub blob_endpoint: String,
    pub blob_bucket: String,
    pub blob_prefix: String,
    pub blob_env: String,
    pub blob_region: String,

    pub outbox_stream_key: String,
    pub outbox_group: String,
    pub outbox_consumer: String,
    pub outbox_batch_size: u64,
    pub outbox_block_ms: u64,
    pub outbox_claim_idle_ms: u64,

    pub decision_stream_key: String,
    pub publish_queue_capacity: usize,

    /// `transaction_type=ruleset_key` overrides, comma separated.
    pub ruleset_key_policy: Vec<(String, String)>,

    pub debug: DebugConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let required_ruleset_keys = env_string("REQUIRED_RULESET_KEYS", "CARD_MONITORING")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let ruleset_key_policy = env_string("RULESET_KEY_POLICY", "")
            .split(',')
            .filter_map(|pair| {
                let (ty, key) = pair.split_once('=')?;
                let (ty, key) = (ty.trim(), key.trim());
                if ty.is_empty() || key.is_empty() {
                    return None;
                }
                Some((ty.to_ascii_uppercase(), key.to_string()))
            })
            .collect();

        let debug = DebugConfig {
            enabled: matches!(
                env_string("DEBUG_ENABLED", "false").as_str(),
                "1" | "true" | "TRUE" | "on" | "ON"
            ),
            sample_rate: env_parse("DEBUG_SAMPLE_RATE", 100u8).min(100),
            include_field_values: !matches!(
                env_string("DEBUG_INCLUDE_FIELD_VALUES", "true").as_str(),
                "0" | "false" | "FALSE" | "off" | "OFF"
            ),
            max_condition_evaluations: env_parse("DEBUG_MAX_CONDITION_EVALUATIONS", 100usize),
        };

        Ok(Self {
            port: env_parse("PORT", 8080u16),
            poll_interval_seconds: env_parse("POLL_INTERVAL_SECONDS", 30u64),
            required_ruleset_keys,
            max_concurrent: env_parse("LOAD_SHED_MAX_CONCURRENT", 256usize),
            request_deadline_ms: env_parse("REQUEST_DEADLINE_MS", 100u64),
            shutdown_grace_seconds: env_parse("SHUTDOWN_GRACE_SECONDS", 5u64),

            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            velocity_default_window_seconds: env_parse("VELOCITY_DEFAULT_WINDOW_SECONDS", 3600i64),
            velocity_default_threshold: env_parse("VELOCITY_DEFAULT_THRESHOLD", 10i64),
            velocity_deadline_ms: env_parse("VELOCITY_DEADLINE_MS", 50u64),
            velocity_scope_prefix: env_string("VELOCITY_SCOPE_PREFIX", "mon"),

            blob_endpoint: env_string("BLOB_ENDPOINT", "http://127.0.0.1:9000"),
            blob_bucket: env_string("BLOB_BUCKET", "fraud-artifacts"),
            blob_prefix: env_string("BLOB_PREFIX", "artifacts"),
            blob_env: env_string("BLOB_ENV", "prod"),
            blob_region: env_string("BLOB_REGION", "us-east-1"),

            outbox_stream_key: env_string("OUTBOX_STREAM_KEY", "fraud:auth:outbox"),
            outbox_group: env_string("OUTBOX_GROUP", "monitoring"),
            outbox_consumer: env_string("OUTBOX_CONSUMER", "monitoring-1"),
            outbox_batch_size: env_parse("OUTBOX_BATCH_SIZE", 32u64),
            outbox_block_ms: env_parse("OUTBOX_BLOCK_MS", 2000u64),
            outbox_claim_idle_ms: env_parse("OUTBOX_CLAIM_IDLE_MS", 60_000u64),

            decision_stream_key: env_string("DECISION_STREAM_KEY", "fraud:decisions"),
            publish_queue_capacity: env_parse("PUBLISH_QUEUE_CAPACITY", 1024usize),

            ruleset_key_policy,
            debug,
        })
    }

    /// Ruleset key for a transaction type. Policy overrides first, then the
    /// process default.
    pub fn ruleset_key_for(&self, transaction_type: Option<&str>) -> String {
        if let Some(ty) = transaction_type {
            let upper = ty.to_ascii_uppercase();
            for (policy_ty, key) in &self.ruleset_key_policy {
                if *policy_ty == upper {
                    return key.clone();
                }
            }
        }
        "CARD_MONITORING".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_caller_synonyms() {
        assert_eq!(
            DecisionOutcome::normalize("APPROVED"),
            Some(DecisionOutcome::Approve)
        );
        assert_eq!(
            DecisionOutcome::normalize("allow"),
            Some(DecisionOutcome::Approve)
        );
        assert_eq!(
            DecisionOutcome::normalize("BLOCK"),
            Some(DecisionOutcome::Decline)
        );
        assert_eq!(DecisionOutcome::normalize("MAYBE"), None);
        assert_eq!(DecisionOutcome::normalize(""), None);
    }

    #[test]
    fn transaction_request_reads_flattened_fields() {
        let req: TransactionRequest = serde_json::from_value(serde_json::json!({
            "transaction_id": "txn-1",
            "decision": "APPROVE",
            "amount": 123.45,
            "country_code": "US",
            "some_future_field": {"ignored": true}
        }))
        .unwrap();

        assert_eq!(req.transaction_id(), Some("txn-1"));
        assert_eq!(req.country_code(), Some("US"));
        assert_eq!(req.decision.as_deref(), Some("APPROVE"));
    }

    #[test]
    fn ruleset_key_policy_falls_back_to_default() {
        let mut config = Config::from_env().unwrap();
        config.ruleset_key_policy = vec![("CARD_PRESENT".to_string(), "CP_MONITORING".to_string())];

        assert_eq!(config.ruleset_key_for(Some("card_present")), "CP_MONITORING");
        assert_eq!(config.ruleset_key_for(Some("ECOM")), "CARD_MONITORING");
        assert_eq!(config.ruleset_key_for(None), "CARD_MONITORING");
    }
}
