use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::records::{
    decode_ts, encode_ts, AuditLogEntry, FormValue, InjectionLogEntry, InjectionStats,
    ProcessedFileRecord, Sensor, SubmitOutcome,
};
use crate::telemetry::sensors::NewSensor;

pub const WATCH_DIRECTORY_KEY: &str = "watch_directory";

pub struct Database {
    pub conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(db_path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// On-disk location, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS form_values (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                form_name TEXT NOT NULL,
                field_name TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                updated_by INTEGER,
                UNIQUE(form_name, field_name)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                form_name TEXT NOT NULL,
                field_name TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT NOT NULL,
                changed_at TEXT NOT NULL,
                changed_by INTEGER
            );

            CREATE TABLE IF NOT EXISTS ldx_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                mtime REAL NOT NULL,
                processed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS injection_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ldx_path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                field_id TEXT NOT NULL,
                value TEXT NOT NULL,
                was_update BOOLEAN NOT NULL,
                injected_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sensors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                unit TEXT NOT NULL,
                min_value REAL NOT NULL,
                max_value REAL NOT NULL,
                sensor_group TEXT NOT NULL,
                sort_order INTEGER NOT NULL DEFAULT 0,
                enabled BOOLEAN NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_field_time
                ON audit_log(form_name, field_name, changed_at);
            CREATE INDEX IF NOT EXISTS idx_audit_time
                ON audit_log(changed_at);
            CREATE INDEX IF NOT EXISTS idx_injection_file
                ON injection_log(file_name, injected_at);",
        )?;

        Ok(())
    }

    /// Upsert every submitted field and append an audit entry for each real change.
    /// One transaction per submission.
    pub fn submit_values(
        &self,
        form_name: &str,
        values: &BTreeMap<String, Option<String>>,
        actor: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = encode_ts(&now);
        let mut outcome = SubmitOutcome::default();

        for (field_name, new_value) in values {
            let new_value = new_value.clone().unwrap_or_default();
            let old_value: Option<String> = tx
                .query_row(
                    "SELECT value FROM form_values WHERE form_name = ?1 AND field_name = ?2",
                    params![form_name, field_name],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO form_values (form_name, field_name, value, updated_at, updated_by)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(form_name, field_name) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at,
                    updated_by = excluded.updated_by",
                params![form_name, field_name, new_value, ts, actor],
            )?;

            if old_value.as_deref() == Some(new_value.as_str()) {
                outcome.unchanged += 1;
                continue;
            }

            tx.execute(
                "INSERT INTO audit_log (form_name, field_name, old_value, new_value, changed_at, changed_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![form_name, field_name, old_value, new_value, ts, actor],
            )?;
            outcome.changed += 1;
        }

        tx.commit()?;
        Ok(outcome)
    }

    pub fn current_values(&self) -> Result<Vec<FormValue>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT form_name, field_name, value, updated_at, updated_by
             FROM form_values
             ORDER BY form_name, field_name",
        )?;
        let values = stmt.query_map([], form_value_from_row)?;
        Ok(values.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn values_for_form(&self, form_name: &str) -> Result<Vec<FormValue>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT form_name, field_name, value, updated_at, updated_by
             FROM form_values
             WHERE form_name = ?1
             ORDER BY field_name",
        )?;
        let values = stmt.query_map(params![form_name], form_value_from_row)?;
        Ok(values.collect::<Result<Vec<_>, _>>()?)
    }

    /// Audit entries for one field, newest first
    pub fn audit_trail(&self, form_name: &str, field_name: &str) -> Result<Vec<AuditLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, form_name, field_name, old_value, new_value, changed_at, changed_by
             FROM audit_log
             WHERE form_name = ?1 AND field_name = ?2
             ORDER BY changed_at DESC, id DESC",
        )?;
        let entries = stmt.query_map(params![form_name, field_name], audit_from_row)?;
        Ok(entries.collect::<Result<Vec<_>, _>>()?)
    }

    /// The value a field held at `at`, reconstructed from the audit trail
    pub fn value_as_of(
        &self,
        form_name: &str,
        field_name: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT new_value FROM audit_log
                 WHERE form_name = ?1 AND field_name = ?2 AND changed_at <= ?3
                 ORDER BY changed_at DESC, id DESC
                 LIMIT 1",
                params![form_name, field_name, encode_ts(&at)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// One page of the global audit log, newest first, plus the total row count
    pub fn audit_page(&self, offset: usize, limit: usize) -> Result<(Vec<AuditLogEntry>, u64)> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        let mut stmt = conn.prepare(
            "SELECT id, form_name, field_name, old_value, new_value, changed_at, changed_by
             FROM audit_log
             ORDER BY changed_at DESC, id DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let entries = stmt.query_map(params![limit as i64, offset as i64], audit_from_row)?;
        Ok((entries.collect::<Result<Vec<_>, _>>()?, total.max(0) as u64))
    }

    pub fn is_processed(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row("SELECT id FROM ldx_files WHERE path = ?1", params![path], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    pub fn processed_files(&self) -> Result<Vec<ProcessedFileRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT path, mtime, processed_at FROM ldx_files ORDER BY processed_at DESC, id DESC",
        )?;
        let records = stmt.query_map([], |row| {
            let processed_at: String = row.get(2)?;
            Ok(ProcessedFileRecord {
                path: row.get(0)?,
                mtime: row.get(1)?,
                processed_at: decode_ts(2, &processed_at)?,
            })
        })?;
        Ok(records.collect::<Result<Vec<_>, _>>()?)
    }

    /// Detection time of the most recently processed target file
    pub fn last_processed_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT processed_at FROM ldx_files ORDER BY processed_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| decode_ts(0, &raw)).transpose().map_err(Into::into)
    }

    /// Record a finished merge: the processed-file marker and its injection log
    /// land together or not at all.
    pub fn commit_merge(
        &self,
        record: &ProcessedFileRecord,
        entries: &[InjectionLogEntry],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO ldx_files (path, mtime, processed_at) VALUES (?1, ?2, ?3)",
            params![record.path, record.mtime, encode_ts(&record.processed_at)],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO injection_log (ldx_path, file_name, field_id, value, was_update, injected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.ldx_path,
                    entry.file_name(),
                    entry.field_id,
                    entry.value,
                    entry.was_update,
                    encode_ts(&entry.injected_at),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Injection log for one target file name, newest first
    pub fn injections_for_file(&self, file_name: &str) -> Result<Vec<InjectionLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ldx_path, field_id, value, was_update, injected_at
             FROM injection_log
             WHERE file_name = ?1
             ORDER BY injected_at DESC, id DESC",
        )?;
        let entries = stmt.query_map(params![file_name], |row| {
            let injected_at: String = row.get(4)?;
            Ok(InjectionLogEntry {
                ldx_path: row.get(0)?,
                field_id: row.get(1)?,
                value: row.get(2)?,
                was_update: row.get(3)?,
                injected_at: decode_ts(4, &injected_at)?,
            })
        })?;
        Ok(entries.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn injection_stats(&self) -> Result<Vec<InjectionStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_name, COUNT(*), COALESCE(SUM(CASE WHEN was_update THEN 1 ELSE 0 END), 0)
             FROM injection_log
             GROUP BY file_name
             ORDER BY file_name",
        )?;
        let stats = stmt.query_map([], |row| {
            let total: i64 = row.get(1)?;
            let updates: i64 = row.get(2)?;
            Ok(InjectionStats {
                file_name: row.get(0)?,
                total: total as u64,
                updates: updates as u64,
                static_count: (total - updates) as u64,
            })
        })?;
        Ok(stats.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Insert `defaults` when the registry is empty. Returns how many were added.
    pub fn seed_sensors(&self, defaults: &[NewSensor]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM sensors", [], |row| row.get(0))?;
        if existing > 0 {
            return Ok(0);
        }
        for sensor in defaults {
            insert_sensor_row(&tx, sensor)?;
        }
        tx.commit()?;
        Ok(defaults.len())
    }

    /// Registered sensors ordered by `sort_order`, optionally only enabled ones
    pub fn sensors(&self, enabled_only: bool) -> Result<Vec<Sensor>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, sensor_id, name, unit, min_value, max_value, sensor_group, sort_order, enabled
             FROM sensors
             WHERE enabled = 1 OR ?1 = 0
             ORDER BY sort_order, id",
        )?;
        let sensors = stmt.query_map(params![enabled_only], sensor_from_row)?;
        Ok(sensors.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn sensor(&self, sensor_id: &str) -> Result<Option<Sensor>> {
        let conn = self.conn.lock();
        let sensor = conn
            .query_row(
                "SELECT id, sensor_id, name, unit, min_value, max_value, sensor_group, sort_order, enabled
                 FROM sensors WHERE sensor_id = ?1",
                params![sensor_id],
                sensor_from_row,
            )
            .optional()?;
        Ok(sensor)
    }

    /// Register a new sensor. `None` when the sensor id is already taken.
    pub fn insert_sensor(&self, sensor: &NewSensor) -> Result<Option<Sensor>> {
        {
            let conn = self.conn.lock();
            let taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sensors WHERE sensor_id = ?1)",
                params![sensor.sensor_id],
                |row| row.get(0),
            )?;
            if taken {
                return Ok(None);
            }
            insert_sensor_row(&conn, sensor)?;
        }
        self.sensor(&sensor.sensor_id)
    }

    /// Store every column of `sensor`, keyed by its sensor id
    pub fn save_sensor(&self, sensor: &Sensor) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sensors
             SET name = ?2, unit = ?3, min_value = ?4, max_value = ?5,
                 sensor_group = ?6, sort_order = ?7, enabled = ?8
             WHERE sensor_id = ?1",
            params![
                sensor.sensor_id,
                sensor.name,
                sensor.unit,
                sensor.min_value,
                sensor.max_value,
                sensor.group,
                sensor.sort_order,
                sensor.enabled
            ],
        )?;
        Ok(())
    }

    /// Returns whether a sensor was removed
    pub fn delete_sensor(&self, sensor_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM sensors WHERE sensor_id = ?1", params![sensor_id])?;
        Ok(removed > 0)
    }

    /// Bulk administrative purge. The only path that forgets processed files.
    pub fn purge(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for table in ["injection_log", "ldx_files", "audit_log", "form_values"] {
            tx.execute(&format!("DELETE FROM {table}"), [])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Consistent snapshot of the database file, used by the export endpoint
    pub fn backup_to(&self, destination: &Path) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("VACUUM INTO ?1", params![destination.to_string_lossy()])
            .with_context(|| format!("failed to export database to {}", destination.display()))?;
        Ok(())
    }
}

fn form_value_from_row(row: &Row<'_>) -> rusqlite::Result<FormValue> {
    let updated_at: String = row.get(3)?;
    Ok(FormValue {
        form_name: row.get(0)?,
        field_name: row.get(1)?,
        value: row.get(2)?,
        updated_at: decode_ts(3, &updated_at)?,
        updated_by: row.get(4)?,
    })
}

fn insert_sensor_row(conn: &Connection, sensor: &NewSensor) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO sensors (sensor_id, name, unit, min_value, max_value, sensor_group, sort_order, enabled)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            sensor.sensor_id,
            sensor.name,
            sensor.unit,
            sensor.min_value,
            sensor.max_value,
            sensor.group,
            sensor.sort_order,
            sensor.enabled
        ],
    )
}

fn sensor_from_row(row: &Row<'_>) -> rusqlite::Result<Sensor> {
    Ok(Sensor {
        id: row.get(0)?,
        sensor_id: row.get(1)?,
        name: row.get(2)?,
        unit: row.get(3)?,
        min_value: row.get(4)?,
        max_value: row.get(5)?,
        group: row.get(6)?,
        sort_order: row.get(7)?,
        enabled: row.get(8)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let changed_at: String = row.get(5)?;
    Ok(AuditLogEntry {
        id: row.get(0)?,
        form_name: row.get(1)?,
        field_name: row.get(2)?,
        old_value: row.get(3)?,
        new_value: row.get(4)?,
        changed_at: decode_ts(5, &changed_at)?,
        changed_by: row.get(6)?,
    })
}
