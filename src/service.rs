//! Evaluation glue: normalize the request, select the ruleset, evaluate,
//! and compose the published `Decision`.
//!
//! Shared by the HTTP entry point and the outbox worker so both paths have
//! identical semantics. Every failure past input validation resolves to a
//! degraded decision that preserves the caller-supplied outcome; the
//! service itself never errors after normalization.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::engine::evaluator::Evaluator;
use crate::engine::record::TransactionRecord;
use crate::models::{
    Config, Decision, DecisionOutcome, EngineMode, EvaluationType, TimingBreakdown,
    TransactionRequest,
};
use crate::registry::{FieldRegistryService, RulesetRegistry, GLOBAL_COUNTRY};

pub const ERR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERR_INTERNAL: &str = "INTERNAL_ERROR";
pub const ERR_LOAD_SHEDDING: &str = "LOAD_SHEDDING";

/// Input validation failure: the only path that surfaces a 400.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct InvalidRequest {
    pub message: String,
}

pub struct EvalService {
    config: Arc<Config>,
    fields: Arc<FieldRegistryService>,
    registry: Arc<RulesetRegistry>,
    evaluator: Arc<Evaluator>,
}

impl EvalService {
    pub fn new(
        config: Arc<Config>,
        fields: Arc<FieldRegistryService>,
        registry: Arc<RulesetRegistry>,
        evaluator: Arc<Evaluator>,
    ) -> Self {
        Self {
            config,
            fields,
            registry,
            evaluator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Normalize the caller-supplied decision or reject the request.
    pub fn normalize_decision(
        request: &TransactionRequest,
    ) -> Result<DecisionOutcome, InvalidRequest> {
        request
            .decision
            .as_deref()
            .and_then(DecisionOutcome::normalize)
            .ok_or_else(|| InvalidRequest {
                message: "decision must be APPROVE or DECLINE".to_string(),
            })
    }

    /// Ruleset key for this transaction under the configured policy.
    pub fn ruleset_key(&self, request: &TransactionRequest) -> String {
        self.config.ruleset_key_for(request.transaction_type())
    }

    /// Full MONITORING evaluation. Returns `Err` only for invalid input;
    /// everything downstream fails open into a degraded decision.
    pub async fn evaluate_monitoring(
        &self,
        request: &TransactionRequest,
    ) -> Result<Decision, InvalidRequest> {
        let caller_decision = Self::normalize_decision(request)?;
        Ok(self.evaluate_normalized(request, caller_decision).await)
    }

    /// Evaluation past normalization; the outbox worker enters here with a
    /// decision taken from the upstream event.
    pub async fn evaluate_normalized(
        &self,
        request: &TransactionRequest,
        caller_decision: DecisionOutcome,
    ) -> Decision {
        let total_start = Instant::now();

        let transaction_id = request
            .transaction_id()
            .unwrap_or("unknown")
            .to_string();
        let key = self.ruleset_key(request);
        let country = request.country_code().unwrap_or(GLOBAL_COUNTRY);

        let Some(ruleset) = self.registry.get_with_fallback(country, &key) else {
            debug!(country = %country, key = %key, "No ruleset resolved; failing open");
            metrics::increment_counter!("evaluations_degraded_total");
            let mut decision =
                Decision::degraded(transaction_id, caller_decision, Some(key), ERR_INTERNAL);
            decision.timing_breakdown.total_ms = ms_since(total_start);
            return decision;
        };
        let ruleset_lookup_ms = ms_since(total_start);

        let field_registry = self.fields.current();
        let record = TransactionRecord::build(&field_registry, &request.fields);

        let output = self.evaluator.evaluate_monitoring(&record, &ruleset).await;

        // A blown request deadline never aborts the evaluation; the
        // completed result is returned marked degraded.
        let deadline_exceeded =
            ms_since(total_start) > self.config.request_deadline_ms as f64;
        let engine_mode = if output.velocity_degraded || deadline_exceeded {
            EngineMode::Degraded
        } else {
            EngineMode::Normal
        };

        let snapshot = output
            .debug_info
            .is_some()
            .then(|| record.to_map(&field_registry));

        metrics::increment_counter!("evaluations_total");
        metrics::histogram!("evaluation_total_ms", ms_since(total_start));

        Decision {
            transaction_id,
            evaluation_type: EvaluationType::Monitoring,
            decision: caller_decision,
            ruleset_key: Some(ruleset.key.clone()),
            ruleset_version: Some(ruleset.version),
            engine_mode,
            engine_error_code: None,
            matched_rules: output.matched_rules,
            velocity_results: output.velocity_results,
            timing_breakdown: TimingBreakdown {
                ruleset_lookup_ms,
                rule_evaluation_ms: output.rule_evaluation_ms,
                velocity_ms: output.velocity_ms,
                total_ms: ms_since(total_start),
            },
            transaction_context_snapshot: snapshot,
            debug_info: output.debug_info,
            evaluated_at: Utc::now(),
        }
    }

    /// Degraded decision for paths that never reached evaluation (load
    /// shedding, internal faults). Preserves whatever decision the caller
    /// supplied; falls back to APPROVE when none parses.
    pub fn degraded_decision(
        &self,
        request: &TransactionRequest,
        error_code: &str,
    ) -> Decision {
        let decision = request
            .decision
            .as_deref()
            .and_then(DecisionOutcome::normalize)
            .unwrap_or(DecisionOutcome::Approve);
        Decision::degraded(
            request.transaction_id().unwrap_or("unknown").to_string(),
            decision,
            Some(self.ruleset_key(request)),
            error_code,
        )
    }
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fields::FieldRegistry;
    use crate::engine::ruleset::{RuleSpec, Ruleset, RulesetArtifact};
    use crate::models::DebugConfig;
    use crate::storage::{ArtifactLoader, MemoryBlobStore};
    use crate::velocity::MemoryVelocity;
    use serde_json::json;

    fn service_with(rulesets: Vec<(&str, &str, Ruleset)>) -> EvalService {
        let blob = Arc::new(MemoryBlobStore::new());
        let loader = Arc::new(ArtifactLoader::new(blob, "artifacts", "prod"));
        let fields = Arc::new(FieldRegistryService::new(FieldRegistry::builtin()));
        let registry = Arc::new(RulesetRegistry::new(loader, fields.clone()));
        for (country, key, ruleset) in rulesets {
            registry.install(country, key, Arc::new(ruleset));
        }
        let evaluator = Arc::new(Evaluator::new(
            Arc::new(MemoryVelocity::new()),
            DebugConfig::default(),
        ));
        let mut config = Config::from_env().unwrap();
        config.ruleset_key_policy.clear();
        EvalService::new(Arc::new(config), fields, registry, evaluator)
    }

    fn request(payload: serde_json::Value) -> TransactionRequest {
        serde_json::from_value(payload).unwrap()
    }

    fn two_rule_ruleset() -> Ruleset {
        Ruleset::compile(
            &serde_json::from_value::<RulesetArtifact>(json!({
                "key": "CARD_MONITORING",
                "version": 4,
                "evaluation_type": "MONITORING",
                "field_registry_version": 1,
                "rules": [
                    {
                        "id": 1, "name": "R1", "action": "REVIEW", "priority": 100,
                        "conditions": [{"field": "amount", "operator": "GT", "value": 100}]
                    },
                    {
                        "id": 2, "name": "R2", "action": "APPROVE", "priority": 50,
                        "conditions": [{"field": "country_code", "operator": "EQ", "value": "US"}]
                    }
                ]
            }))
            .unwrap(),
            &FieldRegistry::builtin(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn baseline_approve_against_empty_ruleset() {
        let service = service_with(vec![(
            "global",
            "CARD_MONITORING",
            Ruleset::empty("CARD_MONITORING", 1),
        )]);
        let req = request(json!({
            "transaction_id": "txn-1",
            "decision": "APPROVE",
            "amount": 123.45,
            "currency": "USD",
            "country_code": "US"
        }));

        let decision = service.evaluate_monitoring(&req).await.unwrap();
        assert_eq!(decision.transaction_id, "txn-1");
        assert_eq!(decision.decision, DecisionOutcome::Approve);
        assert_eq!(decision.engine_mode, EngineMode::Normal);
        assert_eq!(decision.ruleset_key.as_deref(), Some("CARD_MONITORING"));
        assert!(decision.matched_rules.is_empty());
    }

    #[tokio::test]
    async fn all_match_keeps_caller_decision() {
        let service = service_with(vec![("global", "CARD_MONITORING", two_rule_ruleset())]);
        let req = request(json!({
            "transaction_id": "txn-2",
            "decision": "DECLINE",
            "amount": 150,
            "country_code": "US"
        }));

        let decision = service.evaluate_monitoring(&req).await.unwrap();
        assert_eq!(decision.decision, DecisionOutcome::Decline);
        assert_eq!(decision.engine_mode, EngineMode::Normal);
        let names: Vec<&str> = decision
            .matched_rules
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(names, vec!["R1", "R2"]);
    }

    #[tokio::test]
    async fn invalid_decision_is_rejected_before_any_work() {
        let service = service_with(vec![]);
        let req = request(json!({"transaction_id": "txn-3", "decision": "MAYBE", "amount": 10}));
        let err = service.evaluate_monitoring(&req).await.unwrap_err();
        assert_eq!(err.message, "decision must be APPROVE or DECLINE");
    }

    #[tokio::test]
    async fn missing_ruleset_fails_open_preserving_decision() {
        let service = service_with(vec![]);
        let req = request(json!({
            "transaction_id": "txn-unk",
            "decision": "APPROVE",
            "transaction_type": "PURCHASE"
        }));

        let decision = service.evaluate_monitoring(&req).await.unwrap();
        assert_eq!(decision.decision, DecisionOutcome::Approve);
        assert_eq!(decision.engine_mode, EngineMode::Degraded);
        assert_eq!(decision.engine_error_code.as_deref(), Some("INTERNAL_ERROR"));
    }

    #[tokio::test]
    async fn country_partition_is_used_before_global() {
        let service = service_with(vec![
            ("global", "CARD_MONITORING", Ruleset::empty("CARD_MONITORING", 1)),
            ("US", "CARD_MONITORING", Ruleset::empty("CARD_MONITORING", 7)),
        ]);

        let req = request(json!({"transaction_id": "t", "decision": "APPROVE", "country_code": "US"}));
        let decision = service.evaluate_monitoring(&req).await.unwrap();
        assert_eq!(decision.ruleset_version, Some(7));

        let req = request(json!({"transaction_id": "t", "decision": "APPROVE", "country_code": "GB"}));
        let decision = service.evaluate_monitoring(&req).await.unwrap();
        assert_eq!(decision.ruleset_version, Some(1));
    }

    #[tokio::test]
    async fn timing_breakdown_is_monotonic() {
        let service = service_with(vec![("global", "CARD_MONITORING", two_rule_ruleset())]);
        let req = request(json!({
            "transaction_id": "t",
            "decision": "APPROVE",
            "amount": 150,
            "country_code": "US"
        }));

        let timing = service
            .evaluate_monitoring(&req)
            .await
            .unwrap()
            .timing_breakdown;
        let parts = timing.ruleset_lookup_ms + timing.rule_evaluation_ms + timing.velocity_ms;
        // Small epsilon for float accumulation.
        assert!(timing.total_ms + 0.001 >= parts);
    }

    #[tokio::test]
    async fn degraded_decision_falls_back_to_approve() {
        let service = service_with(vec![]);
        let req = request(json!({"transaction_id": "t"}));
        let decision = service.degraded_decision(&req, ERR_LOAD_SHEDDING);
        assert_eq!(decision.decision, DecisionOutcome::Approve);
        assert_eq!(decision.engine_error_code.as_deref(), Some("LOAD_SHEDDING"));

        let req = request(json!({"transaction_id": "t", "decision": "DECLINE"}));
        let decision = service.degraded_decision(&req, ERR_LOAD_SHEDDING);
        assert_eq!(decision.decision, DecisionOutcome::Decline);
    }
}
