//! Per-condition debug capture.
//!
//! Debug mode is decided at process start. When it is off, the evaluator
//! never constructs a capture and the matched path carries no per-condition
//! bookkeeping. When on, captures are sampled and bounded by
//! `max_condition_evaluations` to cap memory.

use rand::Rng;

use super::condition::CompiledCondition;
use super::record::TransactionRecord;
use crate::models::{ConditionEvaluation, DebugConfig, DebugInfo};

/// Cheap bounded-random sampling check. Called once per evaluation, only
/// when debug is enabled.
pub fn should_sample(config: &DebugConfig) -> bool {
    if !config.enabled {
        return false;
    }
    if config.sample_rate >= 100 {
        return true;
    }
    rand::thread_rng().gen_range(0..100u8) < config.sample_rate
}

/// Collector for one sampled evaluation.
pub struct DebugCapture {
    include_field_values: bool,
    max: usize,
    evaluations: Vec<ConditionEvaluation>,
    truncated: bool,
}

impl DebugCapture {
    pub fn new(config: &DebugConfig) -> Self {
        Self {
            include_field_values: config.include_field_values,
            max: config.max_condition_evaluations,
            evaluations: Vec::new(),
            truncated: false,
        }
    }

    pub fn record(
        &mut self,
        rule_id: i64,
        condition: &CompiledCondition,
        record: &TransactionRecord,
        matched: bool,
        nanos: u64,
    ) {
        if self.evaluations.len() >= self.max {
            self.truncated = true;
            return;
        }

        let (expected, actual) = if self.include_field_values {
            (
                condition.expected().map(str::to_string),
                record.get(condition.field_id()).render(),
            )
        } else {
            (None, None)
        };

        self.evaluations.push(ConditionEvaluation {
            rule_id,
            field: condition.field_key().to_string(),
            operator: condition.operator().as_str().to_string(),
            expected,
            actual,
            matched,
            nanos,
        });
    }

    pub fn finish(self) -> DebugInfo {
        DebugInfo {
            condition_evaluations: self.evaluations,
            truncated: self.truncated,
        }
    }
}
