pub mod api;
pub mod ws;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::schema::FormRegistry;
use crate::storage::{Database, FormValueStore};
use crate::telemetry::Telemetry;
use crate::watcher::LdxWatcher;

/// Everything a request handler can reach. Built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub store: FormValueStore,
    pub forms: Arc<FormRegistry>,
    pub watcher: Arc<LdxWatcher>,
    pub telemetry: Telemetry,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        db: Arc<Database>,
        forms: Arc<FormRegistry>,
        watcher: Arc<LdxWatcher>,
        telemetry: Telemetry,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store: FormValueStore::new(db.clone()),
            db,
            forms,
            watcher,
            telemetry,
            config,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(api::health))
        .route("/roles", get(api::roles))
        .route("/forms", get(api::list_forms))
        .route("/forms/{role}", get(api::get_form))
        .route("/forms/{role}/values", get(api::form_values))
        .route("/forms/{role}/submit", post(api::submit_form))
        .route("/admin/audit", get(api::audit_log))
        .route(
            "/admin/watch-directory",
            get(api::get_watch_directory).put(api::set_watch_directory),
        )
        .route("/admin/ldx-files", get(api::ldx_files))
        .route("/admin/ldx-files/{file_name}/injections", get(api::ldx_file_injections))
        .route("/admin/ldx-stats", get(api::ldx_stats))
        .route("/admin/export-db", post(api::export_db))
        .route("/admin/clear-data", post(api::clear_data))
        .route("/admin/sensors", get(api::list_sensors).post(api::create_sensor))
        .route(
            "/admin/sensors/{sensor_id}",
            put(api::update_sensor).delete(api::delete_sensor),
        )
        .route("/telemetry/channels", get(api::telemetry_channels))
        .route("/telemetry/source", get(api::telemetry_source))
        .route("/ws/telemetry", get(ws::telemetry_ws))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serve on `0.0.0.0:port` until `shutdown` resolves
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "http server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
