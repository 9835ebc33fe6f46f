pub mod db;
pub mod records;
pub mod values;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::telemetry::sensors::default_sensors;

pub use db::{Database, WATCH_DIRECTORY_KEY};
pub use records::{
    AuditLogEntry, FormValue, InjectionLogEntry, InjectionStats, ProcessedFileRecord, Sensor,
    SubmitOutcome,
};
pub use values::{FormValueStore, StaticValues, ValueProvider};

/// Open (creating if needed) the database at `db_path`, make sure the schema
/// exists and seed an empty sensor registry
pub fn open(db_path: &Path) -> Result<Arc<Database>> {
    let db = Database::new(db_path)?;
    db.initialize()?;
    let seeded = db.seed_sensors(&default_sensors())?;
    if seeded > 0 {
        tracing::info!(count = seeded, "sensor registry seeded with default channels");
    }
    tracing::debug!(path = %db_path.display(), "database ready");
    Ok(Arc::new(db))
}
