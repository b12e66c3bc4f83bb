//! Compiled-rule execution engine: field registry, transaction records,
//! condition compilation, rulesets with scope indexing, and the evaluator.

pub mod condition;
pub mod debug;
pub mod evaluator;
pub mod fields;
pub mod record;
pub mod ruleset;

pub use condition::{CompileError, CompiledCondition, ConditionSpec, Operator};
pub use evaluator::{EvaluationOutput, Evaluator};
pub use fields::{DataType, FieldDef, FieldRegistry, FieldsArtifact};
pub use record::{FieldValue, TransactionRecord};
pub use ruleset::{Rule, Ruleset, RulesetArtifact, RuleSpec, ScopeKey, VelocityConfig};
