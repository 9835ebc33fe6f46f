//! Value selection: which value, if any, a field contributes to a merge pass

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::schema::FieldSchema;
use crate::storage::{FormValue, ValueProvider};

/// Section of the target file a tag lives in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `Layers/Details` as `String Id= Value=`
    Details,
    /// `Maths/MathConstants` as `MathConstant Name= Value= Unit=`
    MathConstant { unit: String },
}

impl Destination {
    pub fn for_schema(schema: &FieldSchema) -> Self {
        if schema.field_type.is_numeric() {
            Destination::MathConstant {
                unit: schema.unit.clone().unwrap_or_default(),
            }
        } else {
            Destination::Details
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Value older than the field's validity window
    Stale { age_secs: i64, window_secs: u64 },
    /// Lookback field without a previous value
    NoHistory { entries: usize },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Stale { age_secs, window_secs } => {
                write!(f, "stale ({age_secs}s old, window {window_secs}s)")
            }
            SkipReason::NoHistory { entries } => {
                write!(f, "no previous value ({entries} audit entries)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Inject(String),
    Skip(SkipReason),
}

impl Selection {
    pub fn value(&self) -> Option<&str> {
        match self {
            Selection::Inject(value) => Some(value),
            Selection::Skip(_) => None,
        }
    }
}

/// Applies validity windows and lookback against one point in time
pub struct Selector<'a> {
    values: &'a dyn ValueProvider,
    now: DateTime<Utc>,
}

impl<'a> Selector<'a> {
    pub fn new(values: &'a dyn ValueProvider, now: DateTime<Utc>) -> Self {
        Self { values, now }
    }

    pub fn select(&self, current: &FormValue, schema: &FieldSchema) -> Result<Selection> {
        if let Some(window_secs) = schema.validity_window {
            let age_secs = (self.now - current.updated_at).num_seconds();
            // age == window is still fresh
            if age_secs > 0 && age_secs as u64 > window_secs {
                return Ok(Selection::Skip(SkipReason::Stale {
                    age_secs,
                    window_secs,
                }));
            }
        }

        if schema.lookback {
            let trail = self
                .values
                .audit_trail(&current.form_name, &current.field_name)?;
            return Ok(match trail.get(1) {
                Some(previous) => Selection::Inject(previous.new_value.clone()),
                None => Selection::Skip(SkipReason::NoHistory {
                    entries: trail.len(),
                }),
            });
        }

        Ok(Selection::Inject(current.value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use crate::storage::{AuditLogEntry, StaticValues};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 14, 12, 0, 0).unwrap()
    }

    fn value(v: &str, at: DateTime<Utc>) -> FormValue {
        FormValue {
            form_name: "aero".into(),
            field_name: "wing_angle".into(),
            value: v.into(),
            updated_at: at,
            updated_by: None,
        }
    }

    fn audit(id: i64, v: &str, at: DateTime<Utc>) -> AuditLogEntry {
        AuditLogEntry {
            id,
            form_name: "aero".into(),
            field_name: "wing_angle".into(),
            old_value: None,
            new_value: v.into(),
            changed_at: at,
            changed_by: None,
        }
    }

    fn schema(window: Option<u64>, lookback: bool) -> FieldSchema {
        FieldSchema {
            field_type: FieldType::Number,
            label: "Wing Angle".into(),
            unit: Some("deg".into()),
            validity_window: window,
            lookback,
        }
    }

    #[test]
    fn validity_window_boundary() {
        let provider = StaticValues::default();
        let updated = t0();
        let window = schema(Some(60), false);

        let inside = Selector::new(&provider, updated + Duration::seconds(59));
        assert_eq!(
            inside.select(&value("12", updated), &window).unwrap(),
            Selection::Inject("12".into())
        );

        let at_edge = Selector::new(&provider, updated + Duration::seconds(60));
        assert!(at_edge.select(&value("12", updated), &window).unwrap().value().is_some());

        let outside = Selector::new(&provider, updated + Duration::seconds(61));
        assert_eq!(
            outside.select(&value("12", updated), &window).unwrap(),
            Selection::Skip(SkipReason::Stale {
                age_secs: 61,
                window_secs: 60
            })
        );
    }

    #[test]
    fn future_timestamps_are_fresh() {
        let provider = StaticValues::default();
        let selector = Selector::new(&provider, t0());
        let ahead = value("3", t0() + Duration::seconds(30));
        assert!(selector.select(&ahead, &schema(Some(1), false)).unwrap().value().is_some());
    }

    #[test]
    fn lookback_needs_two_entries() {
        let one = StaticValues {
            values: vec![],
            audit: vec![audit(1, "10", t0())],
        };
        let selector = Selector::new(&one, t0());
        assert_eq!(
            selector.select(&value("10", t0()), &schema(None, true)).unwrap(),
            Selection::Skip(SkipReason::NoHistory { entries: 1 })
        );

        let two = StaticValues {
            values: vec![],
            audit: vec![audit(1, "10", t0()), audit(2, "14", t0() + Duration::seconds(5))],
        };
        let selector = Selector::new(&two, t0() + Duration::seconds(6));
        assert_eq!(
            selector.select(&value("14", t0()), &schema(None, true)).unwrap(),
            Selection::Inject("10".into())
        );
    }

    #[test]
    fn stale_wins_over_lookback() {
        let provider = StaticValues {
            values: vec![],
            audit: vec![audit(1, "10", t0()), audit(2, "14", t0())],
        };
        let selector = Selector::new(&provider, t0() + Duration::seconds(100));
        assert!(matches!(
            selector.select(&value("14", t0()), &schema(Some(10), true)).unwrap(),
            Selection::Skip(SkipReason::Stale { .. })
        ));
    }

    #[test]
    fn routing_by_type() {
        assert_eq!(
            Destination::for_schema(&schema(None, false)),
            Destination::MathConstant { unit: "deg".into() }
        );
        let mut unitless = schema(None, false);
        unitless.unit = None;
        assert_eq!(
            Destination::for_schema(&unitless),
            Destination::MathConstant { unit: String::new() }
        );
        assert_eq!(
            Destination::for_schema(&FieldSchema::free_text("notes")),
            Destination::Details
        );
    }
}
