//! Slot-indexed transaction record.
//!
//! Built once per request from the raw JSON payload and the live field
//! registry, then read by compiled predicates via field id. Missing and null
//! inputs are both represented as `FieldValue::Absent`.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use super::fields::{field_ids, DataType, FieldRegistry};

/// A typed slot value. `Absent` is a first-class state: every predicate on
/// an absent field evaluates to false except `IS_NULL`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(Decimal),
    Bool(bool),
    Absent,
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            FieldValue::Number(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Display form for debug capture; never used on the matched path.
    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(d) => Some(d.to_string()),
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Absent => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Number(d) => serde_json::Number::from_str(&d.to_string())
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(d.to_string())),
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Absent => Value::Null,
        }
    }
}

/// JSON numbers may carry an exponent; `from_str` alone rejects those.
fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

/// Coerce one raw JSON value to the field's datatype. Returns `Absent` for
/// null and for values the datatype cannot represent; compile-time operator
/// checks guarantee predicates never see a cross-typed slot.
fn coerce(raw: &Value, datatype: DataType, lowercase: bool) -> FieldValue {
    match (datatype, raw) {
        (_, Value::Null) => FieldValue::Absent,
        (DataType::String, Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                FieldValue::Absent
            } else if lowercase {
                FieldValue::Text(s.to_lowercase())
            } else {
                FieldValue::Text(s.to_string())
            }
        }
        // MCC and BIN style codes arrive as bare numbers from some gateways.
        (DataType::String, Value::Number(n)) => FieldValue::Text(n.to_string()),
        (DataType::String, Value::Bool(b)) => FieldValue::Text(b.to_string()),
        (DataType::Number, Value::Number(n)) => parse_decimal(&n.to_string())
            .map(FieldValue::Number)
            .unwrap_or(FieldValue::Absent),
        (DataType::Number, Value::String(s)) => parse_decimal(s.trim())
            .map(FieldValue::Number)
            .unwrap_or(FieldValue::Absent),
        (DataType::Boolean, Value::Bool(b)) => FieldValue::Bool(*b),
        (DataType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => FieldValue::Bool(true),
            "false" | "0" | "no" => FieldValue::Bool(false),
            _ => FieldValue::Absent,
        },
        _ => FieldValue::Absent,
    }
}

/// Fixed-arity record addressable by field id. Allocated per request,
/// discarded at response.
#[derive(Debug)]
pub struct TransactionRecord {
    slots: Vec<FieldValue>,
    registry_version: i64,
}

impl TransactionRecord {
    /// Build a record from the flattened request fields. Unknown keys are
    /// ignored; known keys are coerced to the registry datatype.
    pub fn build(registry: &FieldRegistry, fields: &serde_json::Map<String, Value>) -> Self {
        let mut slots = vec![FieldValue::Absent; registry.slot_count()];

        for (key, raw) in fields {
            let Some(def) = registry.resolve(key) else {
                continue;
            };
            slots[def.id as usize] = coerce(raw, def.datatype, def.lowercase_normalized);
        }

        Self {
            slots,
            registry_version: registry.version(),
        }
    }

    pub fn registry_version(&self) -> i64 {
        self.registry_version
    }

    #[inline]
    pub fn get(&self, field_id: u16) -> &FieldValue {
        self.slots
            .get(field_id as usize)
            .unwrap_or(&FieldValue::Absent)
    }

    #[inline]
    pub fn text(&self, field_id: u16) -> Option<&str> {
        self.get(field_id).as_text()
    }

    #[inline]
    pub fn number(&self, field_id: u16) -> Option<Decimal> {
        self.get(field_id).as_number()
    }

    #[inline]
    pub fn boolean(&self, field_id: u16) -> Option<bool> {
        self.get(field_id).as_bool()
    }

    /// Card network value, if present (scope derivation).
    pub fn card_network(&self) -> Option<&str> {
        self.text(field_ids::CARD_NETWORK)
    }

    /// Six-digit BIN prefix, if the record carries a BIN (scope derivation).
    pub fn bin_prefix(&self) -> Option<String> {
        let bin = self.text(field_ids::CARD_BIN)?;
        let digits: String = bin.chars().filter(|c| c.is_ascii_digit()).take(6).collect();
        (!digits.is_empty()).then_some(digits)
    }

    /// `key -> value` view for serialization and debug output only; the hot
    /// path always goes through `get`.
    pub fn to_map(&self, registry: &FieldRegistry) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        for def in registry.iter() {
            let value = self.get(def.id);
            if !value.is_absent() {
                map.insert(def.key.clone(), value.to_json());
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(payload: Value) -> TransactionRecord {
        let registry = FieldRegistry::builtin();
        let fields = payload.as_object().unwrap().clone();
        TransactionRecord::build(&registry, &fields)
    }

    #[test]
    fn builds_typed_slots_from_json() {
        let rec = record(json!({
            "transaction_id": "txn-1",
            "amount": 123.45,
            "currency": "USD",
            "card_present": true,
            "unknown_field": "ignored"
        }));

        assert_eq!(rec.text(field_ids::TRANSACTION_ID), Some("txn-1"));
        assert_eq!(
            rec.number(field_ids::AMOUNT),
            Some(Decimal::from_str("123.45").unwrap())
        );
        assert_eq!(rec.boolean(field_ids::CARD_PRESENT), Some(true));
        assert!(rec.get(field_ids::EMAIL).is_absent());
    }

    #[test]
    fn null_and_missing_are_both_absent() {
        let rec = record(json!({"merchant_id": null}));
        assert!(rec.get(field_ids::MERCHANT_ID).is_absent());
        assert!(rec.get(field_ids::DEVICE_ID).is_absent());
    }

    #[test]
    fn amount_keeps_exact_decimal_digits() {
        let rec = record(json!({"amount": "0.1"}));
        assert_eq!(
            rec.number(field_ids::AMOUNT),
            Some(Decimal::from_str("0.1").unwrap())
        );
    }

    #[test]
    fn name_fields_are_lowercased_on_ingest() {
        let rec = record(json!({"merchant_name": "ACME Corp", "currency": "usd"}));
        assert_eq!(rec.text(field_ids::MERCHANT_NAME), Some("acme corp"));
        // Currency is a code field, not name-like; it is left as-is.
        assert_eq!(rec.text(field_ids::CURRENCY), Some("usd"));
    }

    #[test]
    fn bin_prefix_takes_first_six_digits() {
        let rec = record(json!({"card_bin": "41111122"}));
        assert_eq!(rec.bin_prefix(), Some("411111".to_string()));

        let rec = record(json!({"card_network": "VISA"}));
        assert_eq!(rec.bin_prefix(), None);
        assert_eq!(rec.card_network(), Some("visa"));
    }

    #[test]
    fn map_view_skips_absent_slots() {
        let rec = record(json!({"transaction_id": "t", "amount": 5}));
        let registry = FieldRegistry::builtin();
        let map = rec.to_map(&registry);
        assert_eq!(map.len(), 2);
        assert_eq!(map["transaction_id"], json!("t"));
    }
}
