//! Condition compiler.
//!
//! Turns a declarative `(field, operator, value)` tuple into a closed
//! predicate over a transaction record. All schema checking happens here:
//! field resolution, operator applicability per datatype, and literal
//! coercion. Evaluation is a jump on a tagged `(operator, datatype)` enum
//! with no per-call allocation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::fields::{DataType, FieldRegistry};
use super::record::{FieldValue, TransactionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "EQ",
            Operator::Ne => "NE",
            Operator::Gt => "GT",
            Operator::Gte => "GTE",
            Operator::Lt => "LT",
            Operator::Lte => "LTE",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
            Operator::Between => "BETWEEN",
            Operator::Contains => "CONTAINS",
            Operator::StartsWith => "STARTS_WITH",
            Operator::EndsWith => "ENDS_WITH",
            Operator::IsNull => "IS_NULL",
            Operator::IsNotNull => "IS_NOT_NULL",
        }
    }

    /// Operator applicability by datatype, enforced at compile time.
    pub fn valid_for(&self, datatype: DataType) -> bool {
        use Operator::*;
        match datatype {
            DataType::String => matches!(
                self,
                Eq | Ne | In | NotIn | Contains | StartsWith | EndsWith | IsNull | IsNotNull
            ),
            DataType::Number => matches!(
                self,
                Eq | Ne | Gt | Gte | Lt | Lte | In | NotIn | Between | IsNull | IsNotNull
            ),
            DataType::Boolean => matches!(self, Eq | Ne | IsNull | IsNotNull),
        }
    }
}

/// Declarative condition as it appears in a compiled-ruleset artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub field: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("UNKNOWN_FIELD: '{field}' is not in field registry v{registry_version}")]
    UnknownField { field: String, registry_version: i64 },
    #[error("INVALID_OPERATOR: {operator} is not applicable to {datatype} field '{field}'")]
    InvalidOperator {
        field: String,
        operator: &'static str,
        datatype: &'static str,
    },
    #[error("INVALID_VALUE: condition on '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl CompileError {
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::UnknownField { .. } => "UNKNOWN_FIELD",
            CompileError::InvalidOperator { .. } => "INVALID_OPERATOR",
            CompileError::InvalidValue { .. } => "INVALID_VALUE",
        }
    }
}

/// One specialized predicate per `(operator, datatype)` pair. Literals were
/// coerced to the field datatype at compile time, so evaluation is a direct
/// comparison against the slot.
#[derive(Debug, Clone)]
enum Predicate {
    TextEq(String),
    TextNe(String),
    TextIn(Vec<String>),
    TextNotIn(Vec<String>),
    TextContains(String),
    TextStartsWith(String),
    TextEndsWith(String),
    NumEq(Decimal),
    NumNe(Decimal),
    NumGt(Decimal),
    NumGte(Decimal),
    NumLt(Decimal),
    NumLte(Decimal),
    NumIn(Vec<Decimal>),
    NumNotIn(Vec<Decimal>),
    NumBetween(Decimal, Decimal),
    BoolEq(bool),
    BoolNe(bool),
    IsNull,
    IsNotNull,
}

impl Predicate {
    /// Evaluate against one slot. Absent yields false for every operator
    /// except IS_NULL.
    fn eval(&self, value: &FieldValue) -> bool {
        if value.is_absent() {
            return matches!(self, Predicate::IsNull);
        }
        match self {
            Predicate::IsNull => false,
            Predicate::IsNotNull => true,
            Predicate::TextEq(want) => value.as_text() == Some(want.as_str()),
            Predicate::TextNe(want) => {
                value.as_text().map(|v| v != want.as_str()).unwrap_or(false)
            }
            Predicate::TextIn(set) => value
                .as_text()
                .map(|v| set.iter().any(|w| w == v))
                .unwrap_or(false),
            Predicate::TextNotIn(set) => value
                .as_text()
                .map(|v| !set.iter().any(|w| w == v))
                .unwrap_or(false),
            Predicate::TextContains(want) => {
                value.as_text().map(|v| v.contains(want.as_str())).unwrap_or(false)
            }
            Predicate::TextStartsWith(want) => value
                .as_text()
                .map(|v| v.starts_with(want.as_str()))
                .unwrap_or(false),
            Predicate::TextEndsWith(want) => value
                .as_text()
                .map(|v| v.ends_with(want.as_str()))
                .unwrap_or(false),
            Predicate::NumEq(want) => value.as_number() == Some(*want),
            Predicate::NumNe(want) => value.as_number().map(|v| v != *want).unwrap_or(false),
            Predicate::NumGt(want) => value.as_number().map(|v| v > *want).unwrap_or(false),
            Predicate::NumGte(want) => value.as_number().map(|v| v >= *want).unwrap_or(false),
            Predicate::NumLt(want) => value.as_number().map(|v| v < *want).unwrap_or(false),
            Predicate::NumLte(want) => value.as_number().map(|v| v <= *want).unwrap_or(false),
            Predicate::NumIn(set) => value
                .as_number()
                .map(|v| set.contains(&v))
                .unwrap_or(false),
            Predicate::NumNotIn(set) => value
                .as_number()
                .map(|v| !set.contains(&v))
                .unwrap_or(false),
            Predicate::NumBetween(low, high) => value
                .as_number()
                .map(|v| v >= *low && v <= *high)
                .unwrap_or(false),
            Predicate::BoolEq(want) => value.as_bool() == Some(*want),
            Predicate::BoolNe(want) => value.as_bool().map(|v| v != *want).unwrap_or(false),
        }
    }
}

/// A closed predicate plus the metadata needed for diagnostics.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    field_id: u16,
    field_key: String,
    operator: Operator,
    predicate: Predicate,
    description: String,
    expected: Option<String>,
}

impl CompiledCondition {
    #[inline]
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.predicate.eval(record.get(self.field_id))
    }

    pub fn field_id(&self) -> u16 {
        self.field_id
    }

    pub fn field_key(&self) -> &str {
        &self.field_key
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Rendered expected value for debug capture; None for IS_NULL family.
    pub fn expected(&self) -> Option<&str> {
        self.expected.as_deref()
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> CompileError {
    CompileError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn coerce_text(field: &str, raw: &Value, lowercase: bool) -> Result<String, CompileError> {
    let s = match raw {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(invalid(
                field,
                format!("expected a string literal, got {other}"),
            ))
        }
    };
    Ok(if lowercase { s.to_lowercase() } else { s })
}

fn coerce_number(field: &str, raw: &Value) -> Result<Decimal, CompileError> {
    let text = match raw {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => {
            return Err(invalid(
                field,
                format!("expected a numeric literal, got {other}"),
            ))
        }
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| invalid(field, format!("not a decimal: {e}")))
}

fn coerce_bool(field: &str, raw: &Value) -> Result<bool, CompileError> {
    match raw {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(invalid(field, format!("not a boolean: '{s}'"))),
        },
        other => Err(invalid(
            field,
            format!("expected a boolean literal, got {other}"),
        )),
    }
}

/// Compile one declarative condition against the live registry.
pub fn compile(
    spec: &ConditionSpec,
    registry: &FieldRegistry,
) -> Result<CompiledCondition, CompileError> {
    let def = registry
        .resolve(&spec.field)
        .ok_or_else(|| CompileError::UnknownField {
            field: spec.field.clone(),
            registry_version: registry.version(),
        })?;

    if !spec.operator.valid_for(def.datatype) {
        return Err(CompileError::InvalidOperator {
            field: def.key.clone(),
            operator: spec.operator.as_str(),
            datatype: def.datatype.as_str(),
        });
    }

    let field = def.key.as_str();
    let op = spec.operator;

    let scalar = |spec: &ConditionSpec| -> Result<Value, CompileError> {
        spec.value
            .clone()
            .ok_or_else(|| invalid(field, format!("{} requires a value", op.as_str())))
    };
    let list = |spec: &ConditionSpec| -> Result<Vec<Value>, CompileError> {
        // Lists arrive in `values`; a JSON array under `value` is accepted
        // too since authoring tools emit both shapes.
        let values = match (&spec.values, &spec.value) {
            (Some(values), _) => values.clone(),
            (None, Some(Value::Array(items))) => items.clone(),
            _ => {
                return Err(invalid(
                    field,
                    format!("{} requires a value list", op.as_str()),
                ))
            }
        };
        if values.is_empty() {
            return Err(invalid(field, format!("{} list is empty", op.as_str())));
        }
        Ok(values)
    };

    let lowercase = def.lowercase_normalized;

    let (predicate, expected) = match (op, def.datatype) {
        (Operator::IsNull, _) => (Predicate::IsNull, None),
        (Operator::IsNotNull, _) => (Predicate::IsNotNull, None),

        (Operator::Eq, DataType::String) => {
            let want = coerce_text(field, &scalar(spec)?, lowercase)?;
            (Predicate::TextEq(want.clone()), Some(want))
        }
        (Operator::Ne, DataType::String) => {
            let want = coerce_text(field, &scalar(spec)?, lowercase)?;
            (Predicate::TextNe(want.clone()), Some(want))
        }
        (Operator::In, DataType::String) | (Operator::NotIn, DataType::String) => {
            let set: Vec<String> = list(spec)?
                .iter()
                .map(|v| coerce_text(field, v, lowercase))
                .collect::<Result<_, _>>()?;
            let expected = set.join(", ");
            let predicate = if op == Operator::In {
                Predicate::TextIn(set)
            } else {
                Predicate::TextNotIn(set)
            };
            (predicate, Some(format!("[{expected}]")))
        }
        (Operator::Contains, DataType::String) => {
            let want = coerce_text(field, &scalar(spec)?, lowercase)?;
            (Predicate::TextContains(want.clone()), Some(want))
        }
        (Operator::StartsWith, DataType::String) => {
            let want = coerce_text(field, &scalar(spec)?, lowercase)?;
            (Predicate::TextStartsWith(want.clone()), Some(want))
        }
        (Operator::EndsWith, DataType::String) => {
            let want = coerce_text(field, &scalar(spec)?, lowercase)?;
            (Predicate::TextEndsWith(want.clone()), Some(want))
        }

        (Operator::Eq, DataType::Number)
        | (Operator::Ne, DataType::Number)
        | (Operator::Gt, DataType::Number)
        | (Operator::Gte, DataType::Number)
        | (Operator::Lt, DataType::Number)
        | (Operator::Lte, DataType::Number) => {
            let want = coerce_number(field, &scalar(spec)?)?;
            let predicate = match op {
                Operator::Eq => Predicate::NumEq(want),
                Operator::Ne => Predicate::NumNe(want),
                Operator::Gt => Predicate::NumGt(want),
                Operator::Gte => Predicate::NumGte(want),
                Operator::Lt => Predicate::NumLt(want),
                _ => Predicate::NumLte(want),
            };
            (predicate, Some(want.to_string()))
        }
        (Operator::In, DataType::Number) | (Operator::NotIn, DataType::Number) => {
            let set: Vec<Decimal> = list(spec)?
                .iter()
                .map(|v| coerce_number(field, v))
                .collect::<Result<_, _>>()?;
            let expected = set
                .iter()
                .map(Decimal::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let predicate = if op == Operator::In {
                Predicate::NumIn(set)
            } else {
                Predicate::NumNotIn(set)
            };
            (predicate, Some(format!("[{expected}]")))
        }
        (Operator::Between, DataType::Number) => {
            let bounds = list(spec)?;
            if bounds.len() != 2 {
                return Err(invalid(
                    field,
                    format!("BETWEEN requires exactly 2 bounds, got {}", bounds.len()),
                ));
            }
            let low = coerce_number(field, &bounds[0])?;
            let high = coerce_number(field, &bounds[1])?;
            if low > high {
                return Err(invalid(field, format!("BETWEEN bounds inverted: {low} > {high}")));
            }
            (
                Predicate::NumBetween(low, high),
                Some(format!("[{low}, {high}]")),
            )
        }

        (Operator::Eq, DataType::Boolean) | (Operator::Ne, DataType::Boolean) => {
            let want = coerce_bool(field, &scalar(spec)?)?;
            let predicate = if op == Operator::Eq {
                Predicate::BoolEq(want)
            } else {
                Predicate::BoolNe(want)
            };
            (predicate, Some(want.to_string()))
        }

        // valid_for filtered everything else out above.
        _ => unreachable!("operator/datatype pair passed validation but has no predicate"),
    };

    let description = match &expected {
        Some(e) => format!("{field} {} {e}", op.as_str()),
        None => format!("{field} {}", op.as_str()),
    };

    Ok(CompiledCondition {
        field_id: def.id,
        field_key: def.key.clone(),
        operator: op,
        predicate,
        description,
        expected,
    })
}
