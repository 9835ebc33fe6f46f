//! Tag id assignment with collision handling
//!
//! Short labels are used when they are unambiguous. A label is ambiguous when
//! two (form, field) pairs produce it, or when the target file already holds a
//! tag of that name with a different value than the one about to be written.
//! Ambiguous labels are qualified with the form name. `notes` fields skip all
//! of this and are keyed by the owning role.

use std::collections::{BTreeMap, HashMap};

use crate::schema::{to_human, SchemaProvider};

/// Field id that always maps to `{group}.notes`
pub const NOTES_FIELD: &str = "notes";

/// One field competing for a tag name
#[derive(Debug, Clone)]
pub struct NameRequest<'a> {
    pub form_name: &'a str,
    pub field_name: &'a str,
    /// Value this pass would write, `None` when the field is skipped
    pub value: Option<&'a str>,
}

/// Tag ids already in the target file with every value they carry
pub type ExistingTags = HashMap<String, Vec<String>>;

/// Resolve the tag id of every request, in request order
pub fn assign_tag_ids(
    requests: &[NameRequest<'_>],
    existing: &ExistingTags,
    schema: &dyn SchemaProvider,
) -> Vec<String> {
    let labels: Vec<String> = requests.iter().map(|r| to_human(r.field_name)).collect();

    let mut groups: BTreeMap<&str, usize> = BTreeMap::new();
    for (request, label) in requests.iter().zip(&labels) {
        if request.field_name != NOTES_FIELD {
            *groups.entry(label.as_str()).or_default() += 1;
        }
    }

    let mut qualified: Vec<bool> = requests
        .iter()
        .zip(&labels)
        .map(|(request, label)| {
            request.field_name != NOTES_FIELD
                && (groups.get(label.as_str()).copied().unwrap_or(0) > 1
                    || clashes_with_file(label, request.value, existing))
        })
        .collect();

    let render = |qualified: &[bool]| -> Vec<String> {
        requests
            .iter()
            .zip(&labels)
            .zip(qualified)
            .map(|((request, label), &qualified)| {
                if request.field_name == NOTES_FIELD {
                    format!("{}.{}", schema.group_name(request.form_name), NOTES_FIELD)
                } else if qualified {
                    format!("{} {}", to_human(request.form_name), label)
                } else {
                    label.clone()
                }
            })
            .collect()
    };

    // A qualified id can land on another field's short label. Qualify every
    // field sharing a final id until nothing changes.
    let mut ids = render(&qualified);
    loop {
        let mut changed = false;
        for idx in duplicated(&ids) {
            if !qualified[idx] && requests[idx].field_name != NOTES_FIELD {
                qualified[idx] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        ids = render(&qualified);
    }

    // forms whose human names coincide still share ids; the raw key is unique
    for idx in duplicated(&ids) {
        let request = &requests[idx];
        ids[idx] = format!("{} ({}.{})", ids[idx], request.form_name, request.field_name);
    }

    ids
}

/// Indices of every id that occurs more than once
fn duplicated(ids: &[String]) -> Vec<usize> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for id in ids {
        *counts.entry(id.as_str()).or_default() += 1;
    }
    ids.iter()
        .enumerate()
        .filter(|(_, id)| counts[id.as_str()] > 1)
        .map(|(idx, _)| idx)
        .collect()
}

/// File-level conflict check. A label already in the file only clashes when
/// it holds a value other than the one about to be written: a tag carrying
/// our own value is the one an earlier pass wrote, and treating it as foreign
/// would rename it on every re-merge.
fn clashes_with_file(label: &str, value: Option<&str>, existing: &ExistingTags) -> bool {
    match (existing.get(label), value) {
        (Some(values), Some(value)) => values.iter().any(|v| v != value),
        // a skipped field writes nothing, so it cannot clash
        _ => false,
    }
}
