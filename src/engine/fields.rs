//! Field registry: the versioned schema a transaction record is indexed by.
//!
//! Every field has a stable integer id; compiled predicates address record
//! slots by id and never by name. The builtin 26-field registry is the
//! bootstrap fallback when blob storage has never published one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Datatype of a registry field. Operator applicability is constrained by
/// this at compile time, never at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    String,
    Number,
    Boolean,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "STRING",
            DataType::Number => "NUMBER",
            DataType::Boolean => "BOOLEAN",
        }
    }
}

/// Definition of one transaction field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: u16,
    /// Lowercase snake_case lookup key.
    pub key: String,
    pub display_name: String,
    pub datatype: DataType,
    #[serde(default)]
    pub pii: bool,
    /// Participates in scope-bucket derivation (card network / BIN).
    #[serde(default)]
    pub scope_indexed: bool,
    /// Value is lowercased at record-construction time so case-sensitive
    /// string operators behave predictably for name-like fields.
    #[serde(default)]
    pub lowercase_normalized: bool,
}

/// Stable ids of the builtin schema. Artifact-published registries must keep
/// these assignments for the fields they retain.
pub mod field_ids {
    pub const TRANSACTION_ID: u16 = 1;
    pub const CARD_HASH: u16 = 2;
    pub const AMOUNT: u16 = 3;
    pub const CURRENCY: u16 = 4;
    pub const MERCHANT_ID: u16 = 5;
    pub const MERCHANT_NAME: u16 = 6;
    pub const MERCHANT_CATEGORY: u16 = 7;
    pub const MERCHANT_MCC: u16 = 8;
    pub const CARD_PRESENT: u16 = 9;
    pub const ENTRY_MODE: u16 = 10;
    pub const TRANSACTION_TYPE: u16 = 11;
    pub const COUNTRY_CODE: u16 = 12;
    pub const IP_ADDRESS: u16 = 13;
    pub const DEVICE_ID: u16 = 14;
    pub const EMAIL: u16 = 15;
    pub const PHONE: u16 = 16;
    pub const TIMESTAMP: u16 = 17;
    pub const BILLING_STREET: u16 = 18;
    pub const BILLING_CITY: u16 = 19;
    pub const BILLING_COUNTRY: u16 = 20;
    pub const SHIPPING_STREET: u16 = 21;
    pub const SHIPPING_CITY: u16 = 22;
    pub const SHIPPING_COUNTRY: u16 = 23;
    pub const CARD_NETWORK: u16 = 24;
    pub const CARD_BIN: u16 = 25;
    pub const CARD_LOGO: u16 = 26;
}

/// Wire form of a published field registry (`fields/registry/v{N}/fields.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldsArtifact {
    pub registry_version: i64,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FieldRegistryError {
    #[error("duplicate field id {0}")]
    DuplicateId(u16),
    #[error("duplicate field key '{0}'")]
    DuplicateKey(String),
    #[error("field '{key}' has invalid id {id}")]
    InvalidId { key: String, id: u16 },
}

/// An immutable, versioned set of field definitions with bidirectional
/// id <-> key lookup. Swapped atomically as a whole on hot reload.
#[derive(Debug)]
pub struct FieldRegistry {
    version: i64,
    created_by: String,
    /// Dense slot table indexed by field id; `None` for unassigned ids.
    by_id: Vec<Option<FieldDef>>,
    by_key: HashMap<String, u16>,
}

impl FieldRegistry {
    pub fn from_artifact(artifact: FieldsArtifact) -> Result<Self, FieldRegistryError> {
        let created_by = artifact.created_by.unwrap_or_else(|| "unknown".to_string());
        Self::build(artifact.registry_version, created_by, artifact.fields)
    }

    fn build(
        version: i64,
        created_by: String,
        fields: Vec<FieldDef>,
    ) -> Result<Self, FieldRegistryError> {
        let max_id = fields.iter().map(|f| f.id).max().unwrap_or(0) as usize;
        let mut by_id: Vec<Option<FieldDef>> = vec![None; max_id + 1];
        let mut by_key = HashMap::with_capacity(fields.len());

        for field in fields {
            if field.id == 0 {
                return Err(FieldRegistryError::InvalidId {
                    key: field.key,
                    id: field.id,
                });
            }
            let key = field.key.to_ascii_lowercase();
            if by_key.insert(key, field.id).is_some() {
                return Err(FieldRegistryError::DuplicateKey(field.key));
            }
            let slot = &mut by_id[field.id as usize];
            if slot.is_some() {
                return Err(FieldRegistryError::DuplicateId(field.id));
            }
            *slot = Some(field);
        }

        Ok(Self {
            version,
            created_by,
            by_id,
            by_key,
        })
    }

    /// The builtin 26-field bootstrap registry, version 1. Never fails.
    pub fn builtin() -> Self {
        use field_ids::*;

        fn s(id: u16, key: &str, name: &str) -> FieldDef {
            FieldDef {
                id,
                key: key.to_string(),
                display_name: name.to_string(),
                datatype: DataType::String,
                pii: false,
                scope_indexed: false,
                lowercase_normalized: false,
            }
        }

        let mut fields = vec![
            s(TRANSACTION_ID, "transaction_id", "Transaction ID"),
            s(CARD_HASH, "card_hash", "Card Hash"),
            FieldDef {
                datatype: DataType::Number,
                ..s(AMOUNT, "amount", "Amount")
            },
            s(CURRENCY, "currency", "Currency"),
            s(MERCHANT_ID, "merchant_id", "Merchant ID"),
            FieldDef {
                lowercase_normalized: true,
                ..s(MERCHANT_NAME, "merchant_name", "Merchant Name")
            },
            FieldDef {
                lowercase_normalized: true,
                ..s(MERCHANT_CATEGORY, "merchant_category", "Merchant Category")
            },
            s(MERCHANT_MCC, "merchant_mcc", "Merchant MCC"),
            FieldDef {
                datatype: DataType::Boolean,
                ..s(CARD_PRESENT, "card_present", "Card Present")
            },
            s(ENTRY_MODE, "entry_mode", "Entry Mode"),
            s(TRANSACTION_TYPE, "transaction_type", "Transaction Type"),
            s(COUNTRY_CODE, "country_code", "Country Code"),
            s(IP_ADDRESS, "ip_address", "IP Address"),
            s(DEVICE_ID, "device_id", "Device ID"),
            FieldDef {
                lowercase_normalized: true,
                ..s(EMAIL, "email", "Email")
            },
            s(PHONE, "phone", "Phone"),
            s(TIMESTAMP, "timestamp", "Timestamp"),
            s(BILLING_STREET, "billing_street", "Billing Street"),
            s(BILLING_CITY, "billing_city", "Billing City"),
            s(BILLING_COUNTRY, "billing_country", "Billing Country"),
            s(SHIPPING_STREET, "shipping_street", "Shipping Street"),
            s(SHIPPING_CITY, "shipping_city", "Shipping City"),
            s(SHIPPING_COUNTRY, "shipping_country", "Shipping Country"),
            FieldDef {
                scope_indexed: true,
                lowercase_normalized: true,
                ..s(CARD_NETWORK, "card_network", "Card Network")
            },
            FieldDef {
                scope_indexed: true,
                ..s(CARD_BIN, "card_bin", "Card BIN")
            },
            FieldDef {
                lowercase_normalized: true,
                ..s(CARD_LOGO, "card_logo", "Card Logo")
            },
        ];

        for field in &mut fields {
            field.pii = matches!(
                field.key.as_str(),
                "card_hash"
                    | "ip_address"
                    | "device_id"
                    | "email"
                    | "phone"
                    | "billing_street"
                    | "shipping_street"
            );
        }

        Self::build(1, "builtin".to_string(), fields)
            .unwrap_or_else(|e| panic!("builtin field registry is invalid: {e}"))
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn field_count(&self) -> usize {
        self.by_key.len()
    }

    /// Number of slots a record for this registry needs (max id + 1).
    pub fn slot_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn get(&self, id: u16) -> Option<&FieldDef> {
        self.by_id.get(id as usize).and_then(|f| f.as_ref())
    }

    /// Case-insensitive key lookup.
    pub fn resolve(&self, key: &str) -> Option<&FieldDef> {
        let id = if let Some(id) = self.by_key.get(key) {
            *id
        } else {
            *self.by_key.get(&key.to_ascii_lowercase())?
        };
        self.get(id)
    }

    pub fn key_of(&self, id: u16) -> Option<&str> {
        self.get(id).map(|f| f.key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDef> {
        self.by_id.iter().filter_map(|f| f.as_ref())
    }

    /// Fields participating in scope-bucket derivation.
    pub fn scope_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.iter().filter(|f| f.scope_indexed)
    }
}
