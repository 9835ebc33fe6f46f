//! Watch loop: polls the watch directory and merges every unseen target file once

pub mod detector;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCategory, MergeError};
use crate::ldx::MergeEngine;
use crate::schema::SchemaProvider;
use crate::storage::{Database, ProcessedFileRecord, WATCH_DIRECTORY_KEY};

pub use detector::{list_targets, TargetFile};

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedFile {
    pub path: PathBuf,
    pub injected: usize,
    pub updates: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    #[serde(serialize_with = "serialize_category")]
    pub category: ErrorCategory,
    pub message: String,
}

fn serialize_category<S: serde::Serializer>(
    category: &ErrorCategory,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(category.as_str())
}

/// Result of one scan cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Directory that was scanned, `None` when none is configured or it is missing
    pub directory: Option<PathBuf>,
    pub processed: Vec<ProcessedFile>,
    pub already_seen: usize,
    pub failed: Vec<FailedFile>,
}

struct Inner {
    db: Arc<Database>,
    schema: Arc<dyn SchemaProvider>,
    fallback_dir: Option<PathBuf>,
    extension: String,
    interval: Duration,
    // held for the whole scan so cycles never overlap
    scan_lock: tokio::sync::Mutex<()>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct LdxWatcher {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl LdxWatcher {
    pub fn new(
        db: Arc<Database>,
        schema: Arc<dyn SchemaProvider>,
        fallback_dir: Option<PathBuf>,
        extension: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                schema,
                fallback_dir,
                extension: extension.into(),
                interval,
                scan_lock: tokio::sync::Mutex::new(()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the polling task. A second call while running does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = inner.interval.as_secs_f64(), "ldx watcher started");
            loop {
                inner.scan().await;

                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(inner.interval) => {}
                }
            }
            tracing::info!("ldx watcher stopped");
        });

        *running = Some(Running { token, handle });
    }

    /// Cancel the polling task and wait for it. A scan in progress finishes first.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { token, handle }) = running {
            token.cancel();
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "ldx watcher task failed");
            }
        }
    }

    /// Run one cycle now, waiting for any cycle already in flight
    pub async fn scan_once(&self) -> ScanReport {
        self.inner.scan().await
    }

    /// Directory currently being watched, if any
    pub fn watch_dir(&self) -> Result<Option<PathBuf>> {
        self.inner.watch_dir()
    }

    /// Target files in the watch directory not processed yet, newest first
    pub fn pending_files(&self) -> Result<Vec<TargetFile>> {
        let Some(dir) = self.inner.watch_dir()?.filter(|d| d.is_dir()) else {
            return Ok(Vec::new());
        };

        let mut pending = Vec::new();
        for target in list_targets(&dir, &self.inner.extension)? {
            let key = canonical_key(&target.path)
                .unwrap_or_else(|_| target.path.to_string_lossy().into_owned());
            if !self.inner.db.is_processed(&key)? {
                pending.push(target);
            }
        }
        pending.sort_by(|a, b| b.modified.total_cmp(&a.modified));
        Ok(pending)
    }
}

impl Inner {
    fn watch_dir(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .db
            .get_setting(WATCH_DIRECTORY_KEY)?
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| self.fallback_dir.clone()))
    }

    async fn scan(self: &Arc<Self>) -> ScanReport {
        let _guard = self.scan_lock.lock().await;

        let inner = self.clone();
        match tokio::task::spawn_blocking(move || inner.scan_blocking()).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "scan task panicked");
                ScanReport::default()
            }
        }
    }

    fn scan_blocking(&self) -> ScanReport {
        let mut report = ScanReport::default();

        let dir = match self.watch_dir() {
            Ok(Some(dir)) if dir.is_dir() => dir,
            Ok(Some(dir)) => {
                tracing::debug!(dir = %dir.display(), "watch directory missing, skipping scan");
                return report;
            }
            Ok(None) => return report,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "failed to resolve watch directory");
                return report;
            }
        };

        let targets = match list_targets(&dir, &self.extension) {
            Ok(targets) => targets,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %format!("{err:#}"), "failed to list watch directory");
                return report;
            }
        };
        report.directory = Some(dir);

        for target in targets {
            match self.process_file(&target.path) {
                Ok(Some(done)) => report.processed.push(done),
                Ok(None) => report.already_seen += 1,
                Err(err) => {
                    let category = err.category();
                    tracing::warn!(
                        path = %target.path.display(),
                        category = %category,
                        retryable = category.is_retryable(),
                        error = %err,
                        "target file not processed, will retry next cycle"
                    );
                    report.failed.push(FailedFile {
                        path: target.path,
                        category,
                        message: err.to_string(),
                    });
                }
            }
        }

        if !report.processed.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                processed = report.processed.len(),
                seen = report.already_seen,
                failed = report.failed.len(),
                "scan finished"
            );
        }

        report
    }

    /// Merge one file and record it. `Ok(None)` when it was already processed.
    fn process_file(&self, path: &Path) -> Result<Option<ProcessedFile>, MergeError> {
        let key = canonical_key(path).map_err(|e| MergeError::io(path, e))?;
        if self.db.is_processed(&key)? {
            return Ok(None);
        }

        let canonical = PathBuf::from(&key);
        let now = Utc::now();
        let engine = MergeEngine::new(self.db.as_ref(), self.schema.as_ref());
        let outcome = engine.merge_at(&canonical, now)?;

        let metadata = std::fs::metadata(&canonical).map_err(|e| MergeError::io(&canonical, e))?;
        let record = ProcessedFileRecord {
            path: key,
            mtime: detector::mtime_secs(&metadata),
            processed_at: now,
        };
        self.db
            .commit_merge(&record, &outcome.entries)
            .map_err(|e| MergeError::Storage(e.context(format!("failed to record {}", canonical.display()))))?;

        Ok(Some(ProcessedFile {
            path: canonical,
            injected: outcome.entries.len(),
            updates: outcome.updates(),
            skipped: outcome.skipped.len(),
        }))
    }
}

fn canonical_key(path: &Path) -> std::io::Result<String> {
    Ok(std::fs::canonicalize(path)?.to_string_lossy().into_owned())
}
