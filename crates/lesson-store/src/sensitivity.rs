//! Declarative sensitivity schema.
//!
//! Whether a record is routed through encryption is decided by explicit
//! tags: key rules for whole records, and field names declared sensitive by
//! the record types that carry them. Nothing here matches substrings.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Implemented by record types that declare their sensitive fields.
pub trait Sensitive {
    const SENSITIVE_FIELDS: &'static [&'static str];
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "match", content = "name", rename_all = "snake_case")]
pub enum KeyRule {
    /// The logical key equals `name`.
    Exact(String),
    /// The logical key is `name` or `name_<suffix>`.
    Family(String),
}

impl KeyRule {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyRule::Exact(name) => key == name,
            KeyRule::Family(name) => match key.strip_prefix(name.as_str()) {
                Some("") => true,
                Some(rest) => rest.starts_with('_') && rest.len() > 1,
                None => false,
            },
        }
    }
}

const DEFAULT_RECORD_FAMILIES: &[&str] = &[
    "user_profile",
    "user_preferences",
    "app_settings",
    "performance_data",
    "grades",
    "personal_notes",
    "student_data",
    "parent_contact",
];

const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "user_profile",
    "user_preferences",
    "app_settings",
    "performance_data",
    "grades",
    "personal_notes",
    "student_data",
    "parent_contact",
    "email",
    "phone",
    "address",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitivitySchema {
    key_rules: BTreeSet<KeyRule>,
    sensitive_fields: BTreeSet<String>,
}

impl Default for SensitivitySchema {
    fn default() -> Self {
        let mut schema = Self::empty();
        for family in DEFAULT_RECORD_FAMILIES {
            schema = schema.with_key_rule(KeyRule::Family((*family).to_string()));
        }
        for field in DEFAULT_SENSITIVE_FIELDS {
            schema = schema.with_field(*field);
        }
        schema
    }
}

impl SensitivitySchema {
    pub fn empty() -> Self {
        Self {
            key_rules: BTreeSet::new(),
            sensitive_fields: BTreeSet::new(),
        }
    }

    pub fn with_key_rule(mut self, rule: KeyRule) -> Self {
        self.key_rules.insert(rule);
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.sensitive_fields.insert(field.into());
        self
    }

    /// Register every field a record type declares sensitive.
    pub fn with_record<T: Sensitive>(mut self) -> Self {
        self.sensitive_fields
            .extend(T::SENSITIVE_FIELDS.iter().map(|f| f.to_string()));
        self
    }

    pub fn is_sensitive_field(&self, field: &str) -> bool {
        self.sensitive_fields.contains(field)
    }

    pub fn is_sensitive_key(&self, key: &str) -> bool {
        self.key_rules.iter().any(|rule| rule.matches(key))
    }

    /// True when the key matches a rule or the payload carries a tagged field
    /// at any depth.
    pub fn should_encrypt(&self, key: &str, data: &Value) -> bool {
        self.is_sensitive_key(key) || self.has_sensitive_field(data)
    }

    fn has_sensitive_field(&self, data: &Value) -> bool {
        match data {
            Value::Object(map) => map
                .iter()
                .any(|(field, value)| self.is_sensitive_field(field) || self.has_sensitive_field(value)),
            Value::Array(items) => items.iter().any(|item| self.has_sensitive_field(item)),
            _ => false,
        }
    }
}
