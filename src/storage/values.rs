use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::records::{AuditLogEntry, FormValue, SubmitOutcome};
use super::Database;

/// Source of current form values and their change history.
///
/// The merge engine only reads through this trait, so tests can feed it a
/// fixed set of values without a database.
pub trait ValueProvider: Send + Sync {
    /// Latest value of every (form, field) pair
    fn current_values(&self) -> Result<Vec<FormValue>>;

    /// Audit entries of one field, newest first
    fn audit_trail(&self, form_name: &str, field_name: &str) -> Result<Vec<AuditLogEntry>>;
}

impl ValueProvider for Database {
    fn current_values(&self) -> Result<Vec<FormValue>> {
        Database::current_values(self)
    }

    fn audit_trail(&self, form_name: &str, field_name: &str) -> Result<Vec<AuditLogEntry>> {
        Database::audit_trail(self, form_name, field_name)
    }
}

/// Async front of the form value store for request handlers
#[derive(Clone)]
pub struct FormValueStore {
    db: Arc<Database>,
}

impl FormValueStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub async fn submit(
        &self,
        form_name: String,
        values: BTreeMap<String, Option<String>>,
        actor: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let db = self.db.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            db.submit_values(&form_name, &values, actor, now)
        })
        .await
        .map_err(|err| anyhow!("failed to join database task: {err}"))??;

        if outcome.changed > 0 {
            tracing::debug!(changed = outcome.changed, unchanged = outcome.unchanged, "form values saved");
        }

        Ok(outcome)
    }

    /// Run any database call (query or write) on the blocking pool
    pub async fn run<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || call(&db))
            .await
            .map_err(|err| anyhow!("failed to join database task: {err}"))?
    }
}

/// Fixed in-memory value set, handy for dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticValues {
    pub values: Vec<FormValue>,
    pub audit: Vec<AuditLogEntry>,
}

impl ValueProvider for StaticValues {
    fn current_values(&self) -> Result<Vec<FormValue>> {
        Ok(self.values.clone())
    }

    fn audit_trail(&self, form_name: &str, field_name: &str) -> Result<Vec<AuditLogEntry>> {
        let mut trail: Vec<_> = self
            .audit
            .iter()
            .filter(|e| e.form_name == form_name && e.field_name == field_name)
            .cloned()
            .collect();
        trail.sort_by(|a, b| b.changed_at.cmp(&a.changed_at).then(b.id.cmp(&a.id)));
        Ok(trail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_through_store() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let store = FormValueStore::new(db);

        let values = BTreeMap::from([
            ("torque".to_string(), Some("40".to_string())),
            ("notes".to_string(), Some("dry track".to_string())),
        ]);
        let outcome = store.submit("daq".into(), values, Some(7), Utc::now()).await.unwrap();
        assert_eq!(outcome.changed, 2);

        let current = store.run(|db| db.values_for_form("daq")).await.unwrap();
        assert_eq!(current.len(), 2);
        assert!(current.iter().all(|v| v.updated_by == Some(7)));
    }

    #[tokio::test]
    async fn run_carries_writes_too() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let store = FormValueStore::new(db.clone());

        store
            .run(|db| db.set_setting(crate::storage::WATCH_DIRECTORY_KEY, "/srv/ldx"))
            .await
            .unwrap();
        assert_eq!(
            db.get_setting(crate::storage::WATCH_DIRECTORY_KEY).unwrap().as_deref(),
            Some("/srv/ldx")
        );
    }

    #[test]
    fn static_values_trail_is_newest_first() {
        let t0 = Utc::now();
        let entry = |id: i64, value: &str, secs: i64| AuditLogEntry {
            id,
            form_name: "aero".into(),
            field_name: "wing".into(),
            old_value: None,
            new_value: value.into(),
            changed_at: t0 + chrono::Duration::seconds(secs),
            changed_by: None,
        };
        let provider = StaticValues {
            values: vec![],
            audit: vec![entry(1, "a", 0), entry(2, "b", 10), entry(3, "c", 5)],
        };
        let trail = provider.audit_trail("aero", "wing").unwrap();
        let order: Vec<_> = trail.iter().map(|e| e.new_value.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }
}
