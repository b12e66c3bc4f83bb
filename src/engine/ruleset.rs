//! Compiled rulesets.
//!
//! A ruleset owns its rules; rules know their id only. At compile time the
//! rules are partitioned into scope buckets (card network / BIN prefix) so
//! evaluation iterates O(matching rules) instead of O(all rules). Rulesets
//! are immutable after compile; hot-swap installs a whole new instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::condition::{compile, CompileError, CompiledCondition, ConditionSpec};
use super::fields::FieldRegistry;
use super::record::TransactionRecord;
use crate::models::{DecisionOutcome, EvaluationType};

fn default_window_seconds() -> i64 {
    3600
}

fn default_threshold() -> i64 {
    10
}

fn default_enabled() -> bool {
    true
}

fn default_velocity_action() -> DecisionOutcome {
    DecisionOutcome::Review
}

/// Wire form of a rule's velocity config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocitySpec {
    /// Field key the counter is dimensioned on (e.g. `card_hash`).
    pub dimension: String,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: i64,
    #[serde(default = "default_threshold")]
    pub threshold: i64,
    #[serde(default = "default_velocity_action")]
    pub action: DecisionOutcome,
}

/// Compiled velocity config with the dimension resolved to a field id.
#[derive(Debug, Clone)]
pub struct VelocityConfig {
    pub dimension_field_id: u16,
    pub dimension_key: String,
    pub window_seconds: i64,
    pub threshold: i64,
    pub action: DecisionOutcome,
}

/// Wire form of a rule's scope restriction. Absent means the rule applies
/// globally within its ruleset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_prefix: Option<String>,
}

/// Scope-bucket key derived from card-scope field values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub network: Option<String>,
    pub bin_prefix: Option<String>,
}

impl ScopeKey {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn is_global(&self) -> bool {
        self.network.is_none() && self.bin_prefix.is_none()
    }

    fn from_spec(spec: &ScopeSpec) -> Self {
        Self {
            network: spec
                .card_network
                .as_deref()
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty()),
            bin_prefix: spec
                .bin_prefix
                .as_deref()
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty()),
        }
    }

    /// Bucket keys a record's scope values select, most specific first.
    /// The global bucket is always consulted separately.
    fn candidates(record: &TransactionRecord) -> Vec<ScopeKey> {
        let network = record.card_network().map(str::to_string);
        let bin = record.bin_prefix();

        let mut keys = Vec::with_capacity(3);
        if network.is_some() && bin.is_some() {
            keys.push(ScopeKey {
                network: network.clone(),
                bin_prefix: bin.clone(),
            });
        }
        if let Some(network) = network {
            keys.push(ScopeKey {
                network: Some(network),
                bin_prefix: None,
            });
        }
        if let Some(bin) = bin {
            keys.push(ScopeKey {
                network: None,
                bin_prefix: Some(bin),
            });
        }
        keys
    }
}

/// Wire form of one rule in a compiled-ruleset artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: i64,
    pub name: String,
    pub action: DecisionOutcome,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub conditions: Vec<ConditionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<VelocitySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSpec>,
}

/// A compiled rule. The predicate is the AND of its compiled conditions,
/// evaluated left-to-right with short-circuit.
#[derive(Debug)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub action: DecisionOutcome,
    pub priority: i32,
    pub enabled: bool,
    conditions: Vec<CompiledCondition>,
    pub velocity: Option<VelocityConfig>,
    pub scope: ScopeKey,
}

impl Rule {
    #[inline]
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    pub fn conditions(&self) -> &[CompiledCondition] {
        &self.conditions
    }

    pub fn condition_descriptions(&self) -> Vec<String> {
        self.conditions
            .iter()
            .map(|c| c.description().to_string())
            .collect()
    }
}

/// Wire form of a full compiled-ruleset artifact
/// (`rulesets/{env}/{key}/v{N}/ruleset.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesetArtifact {
    pub key: String,
    pub version: i64,
    #[serde(default = "default_evaluation_type")]
    pub evaluation_type: EvaluationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_registry_version: Option<i64>,
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_evaluation_type() -> EvaluationType {
    EvaluationType::Monitoring
}

/// An immutable compiled ruleset with its scope index.
#[derive(Debug)]
pub struct Ruleset {
    pub key: String,
    pub version: i64,
    pub evaluation_type: EvaluationType,
    pub field_registry_version: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// All rules, `(priority desc, id asc)`. Built once, never mutated.
    rules: Vec<Arc<Rule>>,
    scope_index: HashMap<ScopeKey, Vec<Arc<Rule>>>,
}

impl Ruleset {
    /// Compile an artifact against the live field registry. Any condition
    /// error rejects the whole ruleset; a bad rule never half-installs.
    pub fn compile(
        artifact: &RulesetArtifact,
        registry: &FieldRegistry,
    ) -> Result<Self, CompileError> {
        let mut rules = Vec::with_capacity(artifact.rules.len());

        for spec in &artifact.rules {
            let conditions: Vec<CompiledCondition> = spec
                .conditions
                .iter()
                .map(|c| compile(c, registry))
                .collect::<Result<_, _>>()?;

            let velocity = match &spec.velocity {
                Some(v) => {
                    let def = registry.resolve(&v.dimension).ok_or_else(|| {
                        CompileError::UnknownField {
                            field: v.dimension.clone(),
                            registry_version: registry.version(),
                        }
                    })?;
                    Some(VelocityConfig {
                        dimension_field_id: def.id,
                        dimension_key: def.key.clone(),
                        window_seconds: v.window_seconds,
                        threshold: v.threshold,
                        action: v.action,
                    })
                }
                None => None,
            };

            let scope = spec
                .scope
                .as_ref()
                .map(ScopeKey::from_spec)
                .unwrap_or_default();

            rules.push(Arc::new(Rule {
                id: spec.id,
                name: spec.name.clone(),
                action: spec.action,
                priority: spec.priority,
                enabled: spec.enabled,
                conditions,
                velocity,
                scope,
            }));
        }

        rules.sort_by(rule_order);

        let mut scope_index: HashMap<ScopeKey, Vec<Arc<Rule>>> = HashMap::new();
        for rule in &rules {
            scope_index
                .entry(rule.scope.clone())
                .or_default()
                .push(rule.clone());
        }

        Ok(Self {
            key: artifact.key.clone(),
            version: artifact.version,
            evaluation_type: artifact.evaluation_type,
            field_registry_version: artifact.field_registry_version,
            created_at: artifact.created_at.unwrap_or_else(Utc::now),
            rules,
            scope_index,
        })
    }

    /// An installed-but-empty ruleset. Used by tests and bootstrap.
    pub fn empty(key: &str, version: i64) -> Self {
        Self {
            key: key.to_string(),
            version,
            evaluation_type: EvaluationType::Monitoring,
            field_registry_version: None,
            created_at: Utc::now(),
            rules: Vec::new(),
            scope_index: HashMap::new(),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// All rules in `(priority desc, id asc)` order.
    pub fn rules_by_priority(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Rules applicable to this record: the union of the buckets keyed by
    /// the record's scope values plus the global bucket, deduplicated,
    /// in `(priority desc, id asc)` order.
    pub fn applicable_rules(&self, record: &TransactionRecord) -> Vec<Arc<Rule>> {
        let candidates = ScopeKey::candidates(record);

        if candidates.is_empty() {
            return self
                .scope_index
                .get(&ScopeKey::global())
                .cloned()
                .unwrap_or_default();
        }

        let mut seen: HashSet<i64> = HashSet::new();
        let mut out: Vec<Arc<Rule>> = Vec::new();

        for key in candidates
            .iter()
            .chain(std::iter::once(&ScopeKey::global()))
        {
            if let Some(bucket) = self.scope_index.get(key) {
                for rule in bucket {
                    if seen.insert(rule.id) {
                        out.push(rule.clone());
                    }
                }
            }
        }

        out.sort_by(rule_order);
        out
    }
}

fn rule_order(a: &Arc<Rule>, b: &Arc<Rule>) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::condition::Operator;
    use serde_json::json;

    fn registry() -> FieldRegistry {
        FieldRegistry::builtin()
    }

    fn rec(payload: serde_json::Value) -> TransactionRecord {
        TransactionRecord::build(&registry(), payload.as_object().unwrap())
    }

    fn rule_spec(id: i64, priority: i32) -> RuleSpec {
        RuleSpec {
            id,
            name: format!("rule-{id}"),
            action: DecisionOutcome::Review,
            priority,
            enabled: true,
            conditions: vec![ConditionSpec {
                field: "amount".into(),
                operator: Operator::Gt,
                value: Some(json!(0)),
                values: None,
            }],
            velocity: None,
            scope: None,
        }
    }

    fn artifact(rules: Vec<RuleSpec>) -> RulesetArtifact {
        RulesetArtifact {
            key: "CARD_MONITORING".into(),
            version: 1,
            evaluation_type: EvaluationType::Monitoring,
            field_registry_version: Some(1),
            rules,
            created_at: None,
        }
    }

    #[test]
    fn rules_are_ordered_priority_desc_then_id_asc() {
        let ruleset = Ruleset::compile(
            &artifact(vec![rule_spec(3, 50), rule_spec(1, 100), rule_spec(2, 100)]),
            &registry(),
        )
        .unwrap();

        let ids: Vec<i64> = ruleset.rules_by_priority().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn bad_condition_rejects_whole_ruleset() {
        let mut bad = rule_spec(1, 10);
        bad.conditions[0].field = "nonexistent".into();
        let err = Ruleset::compile(&artifact(vec![rule_spec(2, 5), bad]), &registry()).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_FIELD");
    }

    #[test]
    fn velocity_dimension_resolves_against_registry() {
        let mut spec = rule_spec(1, 10);
        spec.velocity = Some(VelocitySpec {
            dimension: "card_hash".into(),
            window_seconds: 60,
            threshold: 3,
            action: DecisionOutcome::Decline,
        });
        let ruleset = Ruleset::compile(&artifact(vec![spec]), &registry()).unwrap();
        let velocity = ruleset.rules_by_priority()[0].velocity.as_ref().unwrap();
        assert_eq!(velocity.dimension_key, "card_hash");
        assert_eq!(
            velocity.dimension_field_id,
            crate::engine::fields::field_ids::CARD_HASH
        );
    }

    #[test]
    fn scoped_rules_only_apply_to_matching_records() {
        let mut visa_only = rule_spec(1, 100);
        visa_only.scope = Some(ScopeSpec {
            card_network: Some("VISA".into()),
            bin_prefix: None,
        });
        let global = rule_spec(2, 50);

        let ruleset = Ruleset::compile(&artifact(vec![visa_only, global]), &registry()).unwrap();

        let visa_rec = rec(json!({"card_network": "visa"}));
        let ids: Vec<i64> = ruleset
            .applicable_rules(&visa_rec)
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        let amex_rec = rec(json!({"card_network": "amex"}));
        let ids: Vec<i64> = ruleset
            .applicable_rules(&amex_rec)
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![2]);

        // No scope values at all: only the global bucket.
        let bare = rec(json!({}));
        let ids: Vec<i64> = ruleset
            .applicable_rules(&bare)
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn bin_scoped_bucket_selected_by_prefix() {
        let mut bin_rule = rule_spec(7, 10);
        bin_rule.scope = Some(ScopeSpec {
            card_network: None,
            bin_prefix: Some("411111".into()),
        });
        let ruleset = Ruleset::compile(&artifact(vec![bin_rule]), &registry()).unwrap();

        let hit = rec(json!({"card_bin": "4111112222"}));
        assert_eq!(ruleset.applicable_rules(&hit).len(), 1);

        let miss = rec(json!({"card_bin": "5555444433"}));
        assert!(ruleset.applicable_rules(&miss).is_empty());
    }

    #[test]
    fn applicable_rules_dedupes_and_keeps_order() {
        // A record whose network and BIN both select buckets must not see a
        // rule twice, and ordering stays (priority desc, id asc).
        let mut net_rule = rule_spec(1, 10);
        net_rule.scope = Some(ScopeSpec {
            card_network: Some("visa".into()),
            bin_prefix: None,
        });
        let mut both_rule = rule_spec(2, 90);
        both_rule.scope = Some(ScopeSpec {
            card_network: Some("visa".into()),
            bin_prefix: Some("411111".into()),
        });
        let global = rule_spec(3, 50);

        let ruleset =
            Ruleset::compile(&artifact(vec![net_rule, both_rule, global]), &registry()).unwrap();
        let record = rec(json!({"card_network": "visa", "card_bin": "4111119999"}));

        let ids: Vec<i64> = ruleset
            .applicable_rules(&record)
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn empty_ruleset_yields_no_rules() {
        let ruleset = Ruleset::empty("CARD_MONITORING", 1);
        let record = rec(json!({"amount": 1}));
        assert!(ruleset.applicable_rules(&record).is_empty());
        assert_eq!(ruleset.rule_count(), 0);
    }
}
