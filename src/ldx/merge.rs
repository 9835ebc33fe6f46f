//! Reconciles current form values into one target file

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};

use super::namer::{assign_tag_ids, ExistingTags, NameRequest};
use super::selector::{Destination, Selection, Selector, SkipReason};
use super::tree::{Document, Element};
use crate::error::MergeError;
use crate::schema::SchemaProvider;
use crate::storage::{FormValue, InjectionLogEntry, ValueProvider};

pub const LAYERS: &str = "Layers";
pub const DETAILS: &str = "Details";
pub const STRING_TAG: &str = "String";
pub const MATHS: &str = "Maths";
pub const MATH_CONSTANTS: &str = "MathConstants";
pub const MATH_CONSTANT_TAG: &str = "MathConstant";

/// A field left out of a merge pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedField {
    pub form_name: String,
    pub field_name: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// One entry per tag written, in (form, field) order
    pub entries: Vec<InjectionLogEntry>,
    pub skipped: Vec<SkippedField>,
}

impl MergeOutcome {
    pub fn updates(&self) -> usize {
        self.entries.iter().filter(|e| e.was_update).count()
    }
}

/// Merge outcome plus the document that would be written
struct Prepared {
    outcome: MergeOutcome,
    document: Option<Document>,
}

pub struct MergeEngine<'a> {
    values: &'a dyn ValueProvider,
    schema: &'a dyn SchemaProvider,
}

impl<'a> MergeEngine<'a> {
    pub fn new(values: &'a dyn ValueProvider, schema: &'a dyn SchemaProvider) -> Self {
        Self { values, schema }
    }

    /// Merge the current values into `path`, rewriting it in place
    pub fn merge(&self, path: &Path) -> Result<MergeOutcome, MergeError> {
        self.merge_at(path, Utc::now())
    }

    pub fn merge_at(&self, path: &Path, now: DateTime<Utc>) -> Result<MergeOutcome, MergeError> {
        let prepared = self.prepare(path, now)?;

        if let Some(document) = &prepared.document {
            if !prepared.outcome.entries.is_empty() {
                write_atomic(path, document)?;
                tracing::info!(
                    path = %path.display(),
                    tags = prepared.outcome.entries.len(),
                    updates = prepared.outcome.updates(),
                    skipped = prepared.outcome.skipped.len(),
                    "values injected"
                );
            }
        }

        Ok(prepared.outcome)
    }

    /// Compute what [`MergeEngine::merge`] would write without touching the file
    pub fn plan(&self, path: &Path) -> Result<MergeOutcome, MergeError> {
        Ok(self.prepare(path, Utc::now())?.outcome)
    }

    fn prepare(&self, path: &Path, now: DateTime<Utc>) -> Result<Prepared, MergeError> {
        let mut current = self.values.current_values()?;
        if current.is_empty() {
            tracing::debug!(path = %path.display(), "no form values, nothing to inject");
            return Ok(Prepared {
                outcome: MergeOutcome::default(),
                document: None,
            });
        }
        current.sort_by(|a, b| {
            (a.form_name.as_str(), a.field_name.as_str())
                .cmp(&(b.form_name.as_str(), b.field_name.as_str()))
        });

        let mut document = read_document(path)?;

        let selector = Selector::new(self.values, now);
        let mut selections = Vec::with_capacity(current.len());
        for value in &current {
            let schema = self.schema.field_schema(&value.form_name, &value.field_name);
            let selection = selector.select(value, &schema)?;
            selections.push((Destination::for_schema(&schema), selection));
        }

        let requests: Vec<NameRequest<'_>> = current
            .iter()
            .zip(&selections)
            .map(|(value, (_, selection))| NameRequest {
                form_name: &value.form_name,
                field_name: &value.field_name,
                value: selection.value(),
            })
            .collect();
        let tag_ids = assign_tag_ids(&requests, &existing_tags(&document.root), self.schema);

        let ldx_path = path.to_string_lossy().into_owned();
        let mut outcome = MergeOutcome::default();

        for ((value, (destination, selection)), tag_id) in
            current.iter().zip(selections).zip(tag_ids)
        {
            match selection {
                Selection::Inject(new_value) => {
                    let was_update = apply(&mut document.root, &destination, &tag_id, &new_value);
                    outcome.entries.push(InjectionLogEntry {
                        ldx_path: ldx_path.clone(),
                        field_id: tag_id,
                        value: new_value,
                        was_update,
                        injected_at: now,
                    });
                }
                Selection::Skip(reason) => {
                    log_skip(value, &reason);
                    outcome.skipped.push(SkippedField {
                        form_name: value.form_name.clone(),
                        field_name: value.field_name.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(Prepared {
            outcome,
            document: Some(document),
        })
    }
}

fn log_skip(value: &FormValue, reason: &SkipReason) {
    tracing::debug!(
        form = %value.form_name,
        field = %value.field_name,
        %reason,
        "field skipped"
    );
}

fn read_document(path: &Path) -> Result<Document, MergeError> {
    let bytes = std::fs::read(path).map_err(|e| MergeError::io(path, e))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| MergeError::malformed(path, format!("not valid utf-8: {e}")))?;
    Document::parse(&text).map_err(|e| MergeError::malformed(path, e.to_string()))
}

/// Every tag id in both value sections, with the values it currently holds
pub fn existing_tags(root: &Element) -> ExistingTags {
    let mut tags = ExistingTags::new();

    let sections = [
        (root.path(&[LAYERS, DETAILS]), STRING_TAG, "Id"),
        (root.path(&[MATHS, MATH_CONSTANTS]), MATH_CONSTANT_TAG, "Name"),
    ];
    for (section, tag, key) in sections {
        let Some(section) = section else { continue };
        for el in section.elements().filter(|el| el.name == tag) {
            if let Some(id) = el.attr(key) {
                tags.entry(id.to_string())
                    .or_default()
                    .push(el.attr("Value").unwrap_or_default().to_string());
            }
        }
    }

    tags
}

/// Write one tag into its section. Returns whether an existing value changed.
fn apply(root: &mut Element, destination: &Destination, tag_id: &str, value: &str) -> bool {
    match destination {
        Destination::Details => {
            let details = root.section_mut(LAYERS).section_mut(DETAILS);
            let updated = details
                .elements_mut()
                .find(|el| el.name == STRING_TAG && el.attr("Id") == Some(tag_id))
                .map(|el| {
                    let changed = el.attr("Value") != Some(value);
                    el.set_attr("Value", value);
                    changed
                });
            updated.unwrap_or_else(|| {
                details.push(
                    Element::new(STRING_TAG)
                        .with_attr("Id", tag_id)
                        .with_attr("Value", value),
                );
                false
            })
        }
        Destination::MathConstant { unit } => {
            let constants = root
                .section_or_insert_with(MATHS, || {
                    Element::new(MATHS)
                        .with_attr("Id", "Local")
                        .with_attr("Flags", "1208")
                })
                .section_mut(MATH_CONSTANTS);
            let updated = constants
                .elements_mut()
                .find(|el| el.name == MATH_CONSTANT_TAG && el.attr("Name") == Some(tag_id))
                .map(|el| {
                    let changed = el.attr("Value") != Some(value);
                    el.set_attr("Value", value);
                    el.set_attr("Unit", unit);
                    changed
                });
            updated.unwrap_or_else(|| {
                constants.push(
                    Element::new(MATH_CONSTANT_TAG)
                        .with_attr("Name", tag_id)
                        .with_attr("Value", value)
                        .with_attr("Unit", unit),
                );
                false
            })
        }
    }
}

fn write_atomic(path: &Path, document: &Document) -> Result<(), MergeError> {
    let xml = document
        .to_xml()
        .map_err(|e| MergeError::malformed(path, format!("failed to serialize: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| MergeError::io(path, e))?;
    tmp.write_all(xml.as_bytes())
        .map_err(|e| MergeError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| MergeError::io(path, e))?;
    tmp.persist(path).map_err(|e| MergeError::io(path, e.error))?;
    Ok(())
}
