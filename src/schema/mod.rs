//! Field Schema Resolver
//!
//! Static form definitions loaded at startup. The injection engine asks two
//! questions of them: what a (form, field) pair is declared as, and which
//! human-readable group owns a form. Undeclared fields are never an error,
//! they resolve to free text.

pub mod registry;
pub mod validate;

use serde::{Deserialize, Serialize};

pub use registry::{FormField, FormRegistry, FormSchema};
pub use validate::validate_value;

/// Declared type of a form field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Textarea,
    Number,
    Select,
}

impl FieldType {
    /// Numeric fields are routed to the math-constants section
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Number)
    }
}

/// Resolved schema of one (form, field) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub field_type: FieldType,
    pub label: String,
    pub unit: Option<String>,
    /// Seconds after which the current value is too stale to inject
    pub validity_window: Option<u64>,
    /// Inject the previous value instead of the current one
    pub lookback: bool,
}

impl FieldSchema {
    /// Schema assumed for a field no form declares
    pub fn free_text(field_name: &str) -> Self {
        Self {
            field_type: FieldType::Text,
            label: to_human(field_name),
            unit: None,
            validity_window: None,
            lookback: false,
        }
    }
}

/// Read-only view of the static form configuration
pub trait SchemaProvider: Send + Sync {
    /// Declared schema, or free text when the field is unknown
    fn field_schema(&self, form_name: &str, field_name: &str) -> FieldSchema;

    /// Human-readable name of the role that owns `form_name`
    fn group_name(&self, form_name: &str) -> String;
}

/// `coolant_temp` -> `Coolant Temp`.
///
/// Underscores become spaces, the result is trimmed and title-cased: a letter
/// is upper-cased when the character before it is not a letter and
/// lower-cased otherwise (`DAQ` -> `Daq`, `2nd_gear` -> `2Nd Gear`).
pub fn to_human(raw: &str) -> String {
    let spaced = raw.replace('_', " ");
    let mut out = String::with_capacity(spaced.len());
    let mut prev_alpha = false;

    for ch in spaced.trim().chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }

    out
}
