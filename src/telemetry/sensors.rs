//! Sensor registry payloads and their validation
//!
//! The registry is seeded from [`default_channels`] on first start. Admins can
//! then add, edit, disable or remove sensors; the dashboard only sees enabled
//! ones, ordered by `sort_order`.

use std::ops::RangeInclusive;

use serde::Deserialize;

use super::{default_channels, ChannelInfo};
use crate::storage::Sensor;

pub const MAX_SENSOR_ID_LEN: usize = 64;
pub const MAX_SENSOR_NAME_LEN: usize = 128;
pub const MAX_SENSOR_UNIT_LEN: usize = 32;
pub const MAX_SENSOR_GROUP_LEN: usize = 64;
pub const SORT_ORDER_RANGE: RangeInclusive<i64> = -1000..=10_000;
pub const DEFAULT_GROUP: &str = "Other";

/// A sensor to be created
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewSensor {
    pub sensor_id: String,
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub min_value: f64,
    #[serde(default = "default_max")]
    pub max_value: f64,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn default_max() -> f64 {
    100.0
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn enabled() -> bool {
    true
}

impl NewSensor {
    /// Trim and check every field, returning the normalized sensor or all
    /// problems found
    pub fn validate(mut self) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        self.sensor_id = self.sensor_id.trim().to_string();
        if self.sensor_id.is_empty() {
            errors.push("Sensor ID is required".to_string());
        } else if self.sensor_id.chars().count() > MAX_SENSOR_ID_LEN {
            errors.push(format!("Sensor ID must be at most {MAX_SENSOR_ID_LEN} characters"));
        } else if !is_sensor_id(&self.sensor_id) {
            errors.push("Sensor ID may only contain letters, numbers, and underscores".to_string());
        }

        self.name = self.name.trim().to_string();
        check_text(&mut errors, "Name", &self.name, MAX_SENSOR_NAME_LEN);
        self.unit = self.unit.trim().to_string();
        check_text(&mut errors, "Unit", &self.unit, MAX_SENSOR_UNIT_LEN);

        self.group = self.group.trim().to_string();
        if self.group.chars().count() > MAX_SENSOR_GROUP_LEN {
            errors.push(format!("Group must be at most {MAX_SENSOR_GROUP_LEN} characters"));
        } else if self.group.is_empty() {
            self.group = default_group();
        }

        if self.max_value <= self.min_value {
            errors.push("Max value must be greater than min value".to_string());
        }
        check_sort_order(&mut errors, self.sort_order);

        if errors.is_empty() {
            Ok(self)
        } else {
            Err(errors)
        }
    }
}

/// Partial edit of an existing sensor; absent fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SensorUpdate {
    pub name: Option<String>,
    pub unit: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub group: Option<String>,
    pub sort_order: Option<i64>,
    pub enabled: Option<bool>,
}

impl SensorUpdate {
    /// Field-level checks. The range is checked by [`SensorUpdate::apply`]
    /// because it depends on the stored values.
    pub fn validate(mut self) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        if let Some(name) = self.name.as_mut() {
            *name = name.trim().to_string();
            check_text(&mut errors, "Name", name, MAX_SENSOR_NAME_LEN);
        }
        if let Some(unit) = self.unit.as_mut() {
            *unit = unit.trim().to_string();
            check_text(&mut errors, "Unit", unit, MAX_SENSOR_UNIT_LEN);
        }
        if let Some(group) = &self.group {
            if group.chars().count() > MAX_SENSOR_GROUP_LEN {
                errors.push(format!("Group must be at most {MAX_SENSOR_GROUP_LEN} characters"));
            }
        }
        if let Some(sort_order) = self.sort_order {
            check_sort_order(&mut errors, sort_order);
        }

        if errors.is_empty() {
            Ok(self)
        } else {
            Err(errors)
        }
    }

    /// Apply onto `sensor`. Fails when the resulting range is empty.
    pub fn apply(self, sensor: &mut Sensor) -> Result<(), String> {
        let min_value = self.min_value.unwrap_or(sensor.min_value);
        let max_value = self.max_value.unwrap_or(sensor.max_value);
        if min_value >= max_value {
            return Err("Max value must be greater than min value".to_string());
        }

        sensor.min_value = min_value;
        sensor.max_value = max_value;
        if let Some(name) = self.name {
            sensor.name = name;
        }
        if let Some(unit) = self.unit {
            sensor.unit = unit;
        }
        if let Some(group) = self.group {
            sensor.group = group;
        }
        if let Some(sort_order) = self.sort_order {
            sensor.sort_order = sort_order;
        }
        if let Some(enabled) = self.enabled {
            sensor.enabled = enabled;
        }
        Ok(())
    }
}

impl From<&Sensor> for ChannelInfo {
    fn from(sensor: &Sensor) -> Self {
        ChannelInfo {
            id: sensor.sensor_id.clone(),
            name: sensor.name.clone(),
            unit: sensor.unit.clone(),
            min: sensor.min_value,
            max: sensor.max_value,
            group: sensor.group.clone(),
        }
    }
}

/// Registry contents on first start: the built-in channels in catalogue order
pub fn default_sensors() -> Vec<NewSensor> {
    default_channels()
        .into_iter()
        .enumerate()
        .map(|(idx, channel)| NewSensor {
            sensor_id: channel.id,
            name: channel.name,
            unit: channel.unit,
            min_value: channel.min,
            max_value: channel.max,
            group: channel.group,
            sort_order: idx as i64,
            enabled: true,
        })
        .collect()
}

pub fn is_sensor_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_text(errors: &mut Vec<String>, what: &str, value: &str, max: usize) {
    if value.is_empty() {
        errors.push(format!("{what} is required"));
    } else if value.chars().count() > max {
        errors.push(format!("{what} must be at most {max} characters"));
    }
}

fn check_sort_order(errors: &mut Vec<String>, sort_order: i64) {
    if !SORT_ORDER_RANGE.contains(&sort_order) {
        errors.push(format!(
            "Sort order must be between {} and {}",
            SORT_ORDER_RANGE.start(),
            SORT_ORDER_RANGE.end()
        ));
    }
}
