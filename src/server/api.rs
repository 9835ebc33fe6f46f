use std::collections::BTreeMap;
use std::path::{Path as FsPath, PathBuf};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::schema::{validate_value, FormSchema};
use crate::storage::{AuditLogEntry, InjectionStats, Sensor, WATCH_DIRECTORY_KEY};
use crate::telemetry::sensors::{NewSensor, SensorUpdate};
use crate::telemetry::{ChannelInfo, SourceStatus};
use crate::watcher::{detector::has_extension, TargetFile};

pub const MAX_FIELDS_PER_SUBMIT: usize = 200;
pub const MAX_FIELD_VALUE_LEN: usize = 10_000;
pub const MAX_WATCH_PATH_LEN: usize = 1024;
pub const ACTOR_HEADER: &str = "x-actor-id";

const SYSTEM_DIRS: [&str; 9] = [
    "/etc", "/var/log", "/usr", "/bin", "/sbin", "/root", "/proc", "/sys", "/dev",
];

/// Error body is always `{"detail": "..."}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unprocessable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Unprocessable(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            ApiError::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn form_not_found() -> ApiError {
    ApiError::NotFound("Form not found".into())
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn roles(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.forms.roles())
}

pub async fn list_forms(State(state): State<AppState>) -> Json<Vec<FormSchema>> {
    Json(state.forms.forms().to_vec())
}

pub async fn get_form(State(state): State<AppState>, Path(role): Path<String>) -> ApiResult<FormSchema> {
    state
        .forms
        .form_by_role(&role)
        .cloned()
        .map(Json)
        .ok_or_else(form_not_found)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FormValuesResponse {
    pub values: BTreeMap<String, Option<String>>,
    /// Unix seconds of each field's last update
    pub timestamps: BTreeMap<String, f64>,
    /// Lookback fields only: value as of the most recent processed target file
    pub previous_values: BTreeMap<String, Option<String>>,
}

pub async fn form_values(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> ApiResult<FormValuesResponse> {
    let form = state.forms.form_by_role(&role).ok_or_else(form_not_found)?;
    let form_name = form.form_name.clone();
    let lookback: Vec<String> = form
        .fields
        .iter()
        .filter(|f| f.lookback)
        .map(|f| f.name.clone())
        .collect();

    let response = state
        .store
        .run(move |db| {
            let current = db.values_for_form(&form_name)?;

            let mut previous_values = BTreeMap::new();
            if !lookback.is_empty() {
                let last_run = db.last_processed_at()?;
                for field in lookback {
                    let previous = match last_run {
                        Some(at) => db.value_as_of(&form_name, &field, at)?,
                        None => None,
                    };
                    previous_values.insert(field, previous);
                }
            }

            Ok(FormValuesResponse {
                timestamps: current
                    .iter()
                    .map(|v| (v.field_name.clone(), unix_secs(&v.updated_at)))
                    .collect(),
                values: current
                    .into_iter()
                    .map(|v| (v.field_name, Some(v.value)))
                    .collect(),
                previous_values,
            })
        })
        .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct FormSubmit {
    pub values: BTreeMap<String, Option<String>>,
}

pub async fn submit_form(
    State(state): State<AppState>,
    Path(role): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<FormSubmit>,
) -> ApiResult<serde_json::Value> {
    if payload.values.len() > MAX_FIELDS_PER_SUBMIT {
        return Err(ApiError::Unprocessable(format!(
            "Too many fields submitted (max {MAX_FIELDS_PER_SUBMIT})"
        )));
    }
    if let Some(name) = payload
        .values
        .iter()
        .find(|(_, v)| v.as_ref().is_some_and(|v| v.chars().count() > MAX_FIELD_VALUE_LEN))
        .map(|(name, _)| name)
    {
        return Err(ApiError::Unprocessable(format!(
            "Value for '{name}' exceeds maximum length of {MAX_FIELD_VALUE_LEN}"
        )));
    }

    let form = state.forms.form_by_role(&role).ok_or_else(form_not_found)?;

    let mut errors = Vec::new();
    for (name, value) in &payload.values {
        let field = form
            .field(name)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown field: '{name}'")))?;
        errors.extend(validate_value(field, value.as_deref()));
    }
    if !errors.is_empty() {
        return Err(ApiError::Unprocessable(errors.join("; ")));
    }

    let actor = actor_id(&headers)?;
    let outcome = state
        .store
        .submit(form.form_name.clone(), payload.values, actor, Utc::now())
        .await?;

    tracing::info!(
        form = %form.form_name,
        changed = outcome.changed,
        unchanged = outcome.unchanged,
        "form submitted"
    );
    Ok(Json(json!({ "status": "saved" })))
}

fn actor_id(headers: &HeaderMap) -> Result<Option<i64>, ApiError> {
    let Some(raw) = headers.get(ACTOR_HEADER) else {
        return Ok(None);
    };
    raw.to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid {ACTOR_HEADER} header")))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditPage {
    pub items: Vec<AuditLogEntry>,
    pub total: u64,
}

pub async fn audit_log(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<AuditPage> {
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(20);
    if !(1..=100).contains(&limit) {
        return Err(ApiError::Unprocessable("limit must be between 1 and 100".into()));
    }

    let (items, total) = state.store.run(move |db| db.audit_page(offset, limit)).await?;
    Ok(Json(AuditPage { items, total }))
}

pub async fn get_watch_directory(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let watcher = state.watcher.clone();
    let dir = tokio::task::spawn_blocking(move || watcher.watch_dir())
        .await
        .map_err(|e| ApiError::Internal(e.into()))??;
    Ok(Json(json!({ "path": dir.map(|d| d.to_string_lossy().into_owned()) })))
}

#[derive(Debug, Deserialize)]
pub struct WatchDirectoryUpdate {
    #[serde(default)]
    pub path: String,
}

pub async fn set_watch_directory(
    State(state): State<AppState>,
    Json(payload): Json<WatchDirectoryUpdate>,
) -> ApiResult<serde_json::Value> {
    let resolved = validate_watch_path(&payload.path)?;
    let value = resolved.to_string_lossy().into_owned();

    let stored = value.clone();
    state
        .store
        .run(move |db| db.set_setting(WATCH_DIRECTORY_KEY, &stored))
        .await?;

    tracing::info!(path = %value, "watch directory updated");
    Ok(Json(json!({ "status": "updated", "path": value })))
}

/// Resolve a requested watch directory and refuse anything unsafe to scan
pub fn validate_watch_path(raw: &str) -> Result<PathBuf, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ApiError::BadRequest("Path is required".into()));
    }
    if raw.len() > MAX_WATCH_PATH_LEN {
        return Err(ApiError::BadRequest("Path is too long".into()));
    }

    let expanded = match (raw.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(raw),
    };
    let resolved = std::fs::canonicalize(&expanded)
        .ok()
        .filter(|p| p.is_dir())
        .ok_or_else(|| {
            ApiError::BadRequest(format!("Directory does not exist: {}", expanded.display()))
        })?;

    let text = resolved.to_string_lossy();
    if let Some(system) = SYSTEM_DIRS
        .iter()
        .find(|dir| text == **dir || text.starts_with(&format!("{dir}/")))
    {
        return Err(ApiError::BadRequest(format!(
            "Access to system directory '{system}' is not allowed"
        )));
    }

    std::fs::read_dir(&resolved).map_err(|_| {
        ApiError::BadRequest(format!("Permission denied reading directory: {}", resolved.display()))
    })?;

    Ok(resolved)
}

pub async fn ldx_files(State(state): State<AppState>) -> ApiResult<Vec<TargetFile>> {
    let watcher = state.watcher.clone();
    let pending = tokio::task::spawn_blocking(move || watcher.pending_files())
        .await
        .map_err(|e| ApiError::Internal(e.into()))??;
    Ok(Json(pending))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InjectionView {
    pub field_id: String,
    pub value: String,
    pub was_update: bool,
    pub injected_at: DateTime<Utc>,
}

pub async fn ldx_file_injections(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> ApiResult<Vec<InjectionView>> {
    if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
        return Err(ApiError::BadRequest("Invalid file name".into()));
    }
    let extension = &state.config.extension;
    if !has_extension(FsPath::new(&file_name), extension) {
        return Err(ApiError::BadRequest(format!("File must be an .{extension} file")));
    }

    let entries = state
        .store
        .run(move |db| db.injections_for_file(&file_name))
        .await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|e| InjectionView {
                field_id: e.field_id,
                value: e.value,
                was_update: e.was_update,
                injected_at: e.injected_at,
            })
            .collect(),
    ))
}

pub async fn ldx_stats(State(state): State<AppState>) -> ApiResult<Vec<InjectionStats>> {
    Ok(Json(state.store.run(|db| db.injection_stats()).await?))
}

pub async fn export_db(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let watcher = state.watcher.clone();
    let dir = tokio::task::spawn_blocking(move || watcher.watch_dir())
        .await
        .map_err(|e| ApiError::Internal(e.into()))??
        .filter(|dir| dir.is_dir())
        .ok_or_else(|| {
            ApiError::BadRequest("Watch directory not configured or does not exist".into())
        })?;

    let filename = format!("export_{}.db", Utc::now().format("%Y-%m-%d_%H%M%S"));
    let destination = dir.join(&filename);
    let target = destination.clone();
    state.store.run(move |db| db.backup_to(&target)).await?;

    tracing::info!(path = %destination.display(), "database exported");
    Ok(Json(json!({ "status": "exported", "filename": filename })))
}

pub async fn clear_data(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    state.store.run(|db| db.purge()).await?;
    tracing::warn!("all form values, audit entries and injection logs cleared");
    Ok(Json(json!({ "status": "cleared" })))
}

pub async fn list_sensors(State(state): State<AppState>) -> ApiResult<Vec<Sensor>> {
    Ok(Json(state.store.run(|db| db.sensors(false)).await?))
}

pub async fn create_sensor(
    State(state): State<AppState>,
    Json(payload): Json<NewSensor>,
) -> ApiResult<Sensor> {
    let sensor = payload
        .validate()
        .map_err(|errors| ApiError::Unprocessable(errors.join("; ")))?;

    let created = state
        .store
        .run(move |db| db.insert_sensor(&sensor))
        .await?
        .ok_or_else(|| ApiError::BadRequest("Sensor ID already exists".into()))?;

    tracing::info!(sensor = %created.sensor_id, "sensor registered");
    Ok(Json(created))
}

pub async fn update_sensor(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
    Json(payload): Json<SensorUpdate>,
) -> ApiResult<Sensor> {
    let update = payload
        .validate()
        .map_err(|errors| ApiError::Unprocessable(errors.join("; ")))?;

    let lookup = sensor_id.clone();
    let mut sensor = state
        .store
        .run(move |db| db.sensor(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Sensor '{sensor_id}' not found")))?;
    update.apply(&mut sensor).map_err(ApiError::BadRequest)?;

    let saved = sensor.clone();
    state.store.run(move |db| db.save_sensor(&saved)).await?;
    Ok(Json(sensor))
}

pub async fn delete_sensor(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let target = sensor_id.clone();
    if !state.store.run(move |db| db.delete_sensor(&target)).await? {
        return Err(ApiError::NotFound("Sensor not found".into()));
    }
    tracing::info!(sensor = %sensor_id, "sensor removed");
    Ok(Json(json!({ "status": "deleted" })))
}

/// Enabled sensors from the registry, in dashboard order
pub async fn telemetry_channels(State(state): State<AppState>) -> ApiResult<Vec<ChannelInfo>> {
    let sensors = state.store.run(|db| db.sensors(true)).await?;
    Ok(Json(sensors.iter().map(ChannelInfo::from).collect()))
}

pub async fn telemetry_source(State(state): State<AppState>) -> Json<SourceStatus> {
    Json(state.telemetry.status())
}

fn unix_secs(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}
