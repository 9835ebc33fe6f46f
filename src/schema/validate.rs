use super::{FieldType, FormField};

/// Check one submitted value against its field definition.
/// Returns human-readable messages, empty when the value is acceptable.
pub fn validate_value(field: &FormField, value: Option<&str>) -> Vec<String> {
    let mut errors = Vec::new();

    let value = match value {
        Some(v) if !v.is_empty() => v,
        _ => {
            if field.required {
                errors.push(format!("'{}' is required", field.label));
            }
            return errors;
        }
    };

    match field.field_type {
        FieldType::Number => {
            if value.trim().parse::<f64>().is_err() {
                errors.push(format!("'{}' must be a valid number", field.label));
            }
        }
        FieldType::Select => {
            if let Some(options) = field.options.as_ref().filter(|o| !o.is_empty()) {
                if !options.iter().any(|o| o == value) {
                    errors.push(format!(
                        "'{}' must be one of: {}",
                        field.label,
                        options.join(", ")
                    ));
                }
            }
        }
        FieldType::Text | FieldType::Textarea => {}
    }

    errors
}
