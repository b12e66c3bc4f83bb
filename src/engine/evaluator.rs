//! Rule evaluation.
//!
//! MONITORING is the hot path: all-match over the applicable rules, with the
//! final decision supplied by the caller. Matches are informational. AUTH
//! first-match semantics are kept as the reference mode for derived flows
//! and tests.
//!
//! Per-rule velocity checks run after matching; a velocity failure is
//! recorded and never fails the evaluation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::engine::debug::{should_sample, DebugCapture};
use crate::engine::record::TransactionRecord;
use crate::engine::ruleset::{Rule, Ruleset};
use crate::models::{DebugConfig, DebugInfo, DecisionOutcome, MatchedRule, VelocityResult};
use crate::velocity::VelocityCheck;

/// Everything one MONITORING evaluation produced. The caller composes the
/// final `Decision` (decision value, timing totals, snapshot).
#[derive(Debug)]
pub struct EvaluationOutput {
    pub matched_rules: Vec<MatchedRule>,
    pub velocity_results: BTreeMap<String, VelocityResult>,
    pub rule_evaluation_ms: f64,
    pub velocity_ms: f64,
    pub debug_info: Option<DebugInfo>,
    /// True when any velocity check came back unavailable; the decision is
    /// still published, marked DEGRADED.
    pub velocity_degraded: bool,
}

pub struct Evaluator {
    velocity: Arc<dyn VelocityCheck>,
    debug: DebugConfig,
}

impl Evaluator {
    pub fn new(velocity: Arc<dyn VelocityCheck>, debug: DebugConfig) -> Self {
        Self { velocity, debug }
    }

    /// All-match MONITORING evaluation. The decision itself is supplied by
    /// the caller and never derived from matched rule actions.
    pub async fn evaluate_monitoring(
        &self,
        record: &TransactionRecord,
        ruleset: &Ruleset,
    ) -> EvaluationOutput {
        let eval_start = Instant::now();

        let applicable = ruleset.applicable_rules(record);

        let mut capture = if self.debug.enabled && should_sample(&self.debug) {
            Some(DebugCapture::new(&self.debug))
        } else {
            None
        };

        let mut matched: Vec<Arc<Rule>> = Vec::new();
        for rule in &applicable {
            if !rule.enabled {
                continue;
            }
            let hit = match capture.as_mut() {
                None => rule.matches(record),
                Some(capture) => evaluate_with_capture(rule.as_ref(), record, capture),
            };
            if hit {
                matched.push(rule.clone());
            }
        }

        let matched_rules: Vec<MatchedRule> = matched
            .iter()
            .map(|rule| MatchedRule {
                id: rule.id,
                name: rule.name.clone(),
                action: rule.action,
                priority: rule.priority,
                conditions_met: rule.condition_descriptions(),
            })
            .collect();

        let rule_evaluation_ms = ms_since(eval_start);

        // Velocity pass over the matched rules only.
        let velocity_start = Instant::now();
        let mut velocity_results = BTreeMap::new();
        let mut velocity_degraded = false;

        for rule in &matched {
            let Some(config) = rule.velocity.as_ref() else {
                continue;
            };
            let Some(dimension_value) = record.get(config.dimension_field_id).render() else {
                // No dimension value on this transaction; nothing to count.
                continue;
            };

            let outcome = self.velocity.check(&dimension_value, config).await;
            if outcome.error.is_some() {
                velocity_degraded = true;
            }
            velocity_results.insert(
                rule.name.clone(),
                VelocityResult {
                    rule_id: rule.id,
                    dimension: config.dimension_key.clone(),
                    count: outcome.count,
                    threshold: config.threshold,
                    exceeded: outcome.exceeded,
                    error: outcome.error,
                },
            );
        }

        let velocity_ms = ms_since(velocity_start);

        EvaluationOutput {
            matched_rules,
            velocity_results,
            rule_evaluation_ms,
            velocity_ms,
            debug_info: capture.map(DebugCapture::finish),
            velocity_degraded,
        }
    }

    /// First-match AUTH evaluation: iteration stops at the first matching
    /// enabled rule and its action is the decision. Default APPROVE.
    pub fn evaluate_auth(
        &self,
        record: &TransactionRecord,
        ruleset: &Ruleset,
    ) -> (DecisionOutcome, Vec<MatchedRule>) {
        for rule in ruleset.applicable_rules(record) {
            if !rule.enabled {
                continue;
            }
            if rule.matches(record) {
                let matched = MatchedRule {
                    id: rule.id,
                    name: rule.name.clone(),
                    action: rule.action,
                    priority: rule.priority,
                    conditions_met: rule.condition_descriptions(),
                };
                return (rule.action, vec![matched]);
            }
        }
        (DecisionOutcome::Approve, Vec::new())
    }
}

/// Condition-by-condition walk preserving short-circuit, recording each
/// evaluated condition into the capture.
fn evaluate_with_capture(
    rule: &Rule,
    record: &TransactionRecord,
    capture: &mut DebugCapture,
) -> bool {
    for condition in rule.conditions() {
        let start = Instant::now();
        let hit = condition.matches(record);
        let nanos = start.elapsed().as_nanos() as u64;
        capture.record(rule.id, condition, record, hit, nanos);
        if !hit {
            return false;
        }
    }
    true
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
