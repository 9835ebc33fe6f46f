use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::{to_human, FieldSchema, FieldType, SchemaProvider};

/// One field of a form definition file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub label: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_window: Option<u64>,
    #[serde(default)]
    pub lookback: bool,
}

impl FormField {
    fn schema(&self) -> FieldSchema {
        FieldSchema {
            field_type: self.field_type,
            label: self.label.clone(),
            unit: self.unit.clone(),
            validity_window: self.validity_window,
            lookback: self.lookback,
        }
    }
}

/// A form definition: the fields one subteam role fills in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSchema {
    pub form_name: String,
    pub role: String,
    pub fields: Vec<FormField>,
}

impl FormSchema {
    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// All form definitions, indexed for the resolver queries
#[derive(Debug, Clone, Default)]
pub struct FormRegistry {
    forms: Vec<FormSchema>,
    by_form: HashMap<String, usize>,
    by_role: HashMap<String, usize>,
}

impl FormRegistry {
    pub fn new(forms: Vec<FormSchema>) -> Result<Self> {
        let mut by_form = HashMap::new();
        let mut by_role = HashMap::new();

        for (idx, form) in forms.iter().enumerate() {
            if by_form.insert(form.form_name.clone(), idx).is_some() {
                bail!("form '{}' is defined more than once", form.form_name);
            }
            if by_role.insert(form.role.clone(), idx).is_some() {
                bail!("role '{}' owns more than one form", form.role);
            }
        }

        Ok(Self {
            forms,
            by_form,
            by_role,
        })
    }

    /// Load every `*.json`, `*.toml`, `*.yaml` / `*.yml` file in `dir`, in file-name order.
    /// A missing directory yields an empty registry; an invalid file is fatal.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "forms directory not found, no forms loaded");
            return Self::new(Vec::new());
        }

        let mut paths: Vec<_> = walkdir::WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        paths.retain(|p| {
            matches!(
                extension(p).as_deref(),
                Some("json") | Some("toml") | Some("yaml") | Some("yml")
            )
        });

        let mut forms = Vec::with_capacity(paths.len());
        for path in &paths {
            forms.push(load_file(path)?);
        }

        tracing::info!(count = forms.len(), dir = %dir.display(), "form schemas loaded");
        Self::new(forms)
    }

    pub fn forms(&self) -> &[FormSchema] {
        &self.forms
    }

    pub fn form(&self, form_name: &str) -> Option<&FormSchema> {
        self.by_form.get(form_name).map(|&idx| &self.forms[idx])
    }

    pub fn form_by_role(&self, role: &str) -> Option<&FormSchema> {
        self.by_role.get(role).map(|&idx| &self.forms[idx])
    }

    pub fn roles(&self) -> Vec<String> {
        self.forms.iter().map(|f| f.role.clone()).collect()
    }
}

impl SchemaProvider for FormRegistry {
    fn field_schema(&self, form_name: &str, field_name: &str) -> FieldSchema {
        self.form(form_name)
            .and_then(|form| form.field(field_name))
            .map(FormField::schema)
            .unwrap_or_else(|| FieldSchema::free_text(field_name))
    }

    fn group_name(&self, form_name: &str) -> String {
        match self.form(form_name) {
            Some(form) => to_human(&form.role),
            None => to_human(form_name),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn load_file(path: &Path) -> Result<FormSchema> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read form schema {}", path.display()))?;
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

    match extension(path).as_deref() {
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("invalid form schema in {name}")),
        Some("toml") => toml::from_str(&text).with_context(|| format!("invalid form schema in {name}")),
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
            .with_context(|| format!("invalid form schema in {name}")),
        _ => bail!("unsupported schema file: {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const INTAKE_JSON: &str = r#"{
        "form_name": "intake",
        "role": "electronic",
        "fields": [
            {"name": "coolant_temp", "label": "Coolant temperature", "type": "number", "unit": "C"},
            {"name": "sensor_offset", "label": "Offset", "type": "number", "unit": "mV",
             "lookback": true, "validity_window": 3600},
            {"name": "notes", "label": "Notes", "type": "textarea"}
        ]
    }"#;

    const DAQ_TOML: &str = r#"
        form_name = "daq"
        role = "DAQ"

        [[fields]]
        name = "logger_mode"
        label = "Logger mode"
        type = "select"
        required = true
        options = ["race", "test"]
    "#;

    const CHIEF_YAML: &str = "
form_name: chief
role: chief
fields:
  - name: torque
    label: Torque
    type: text
  - name: fuel_load
    label: Fuel load
    type: number
    unit: kg
    validity_window: 900
  - name: notes
    label: Notes
    type: textarea
";

    fn registry() -> (TempDir, FormRegistry) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("10_intake.json"), INTAKE_JSON).unwrap();
        std::fs::write(dir.path().join("20_daq.toml"), DAQ_TOML).unwrap();
        std::fs::write(dir.path().join("README.md"), "not a form").unwrap();
        let registry = FormRegistry::load_dir(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn loads_json_and_toml_in_name_order() {
        let (_dir, registry) = registry();
        let names: Vec<_> = registry.forms().iter().map(|f| f.form_name.as_str()).collect();
        assert_eq!(names, vec!["intake", "daq"]);
        assert_eq!(registry.roles(), vec!["electronic".to_string(), "DAQ".to_string()]);
        assert_eq!(registry.form_by_role("DAQ").unwrap().form_name, "daq");
    }

    #[test]
    fn loads_yaml_forms() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("30_chief.yaml"), CHIEF_YAML).unwrap();
        std::fs::write(dir.path().join("40_pit.yml"), CHIEF_YAML.replace("chief", "pit")).unwrap();
        let registry = FormRegistry::load_dir(dir.path()).unwrap();

        assert_eq!(registry.roles(), vec!["chief".to_string(), "pit".to_string()]);
        let fuel = registry.field_schema("chief", "fuel_load");
        assert!(fuel.field_type.is_numeric());
        assert_eq!(fuel.unit.as_deref(), Some("kg"));
        assert_eq!(fuel.validity_window, Some(900));
        assert_eq!(registry.group_name("pit"), "Pit");
    }

    #[test]
    fn invalid_yaml_names_the_culprit() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.yml"), "form_name: [unclosed").unwrap();
        let err = FormRegistry::load_dir(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("bad.yml"));
    }

    #[test]
    fn resolves_declared_fields() {
        let (_dir, registry) = registry();
        let schema = registry.field_schema("intake", "sensor_offset");
        assert!(schema.field_type.is_numeric());
        assert_eq!(schema.unit.as_deref(), Some("mV"));
        assert_eq!(schema.validity_window, Some(3600));
        assert!(schema.lookback);
    }

    #[test]
    fn undeclared_fields_default_to_free_text() {
        let (_dir, registry) = registry();
        assert_eq!(
            registry.field_schema("intake", "wheel_base"),
            FieldSchema::free_text("wheel_base")
        );
        assert_eq!(
            registry.field_schema("ghost_form", "x"),
            FieldSchema::free_text("x")
        );
    }

    #[test]
    fn group_names_come_from_roles() {
        let (_dir, registry) = registry();
        assert_eq!(registry.group_name("daq"), "Daq");
        assert_eq!(registry.group_name("intake"), "Electronic");
        assert_eq!(registry.group_name("chief_form"), "Chief Form");
    }

    #[test]
    fn invalid_file_names_the_culprit() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{\"form_name\": 3}").unwrap();
        let err = FormRegistry::load_dir(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }

    #[test]
    fn missing_directory_is_empty() {
        let registry = FormRegistry::load_dir(Path::new("/definitely/not/here")).unwrap();
        assert!(registry.forms().is_empty());
    }
}
