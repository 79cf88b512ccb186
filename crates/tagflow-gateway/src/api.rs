//! Control API.
//!
//! Small HTTP surface for operators and the ingestor: liveness with
//! dependency status, the merged location configuration, queue depth, and
//! the updater's local status file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::debug;

use tagflow_queue::StagingQueue;

use crate::auth::AuthManager;
use crate::config_sub::ConfigSubscriber;
use crate::error::GatewayError;
use crate::forwarder::Forwarder;
use crate::store::{location_document_path, DocumentStore};

/// Shared control-API state.
pub struct AppState {
    pub auth: Arc<AuthManager>,
    pub queue: Arc<StagingQueue>,
    pub config_sub: Arc<ConfigSubscriber>,
    pub store: Arc<dyn DocumentStore>,
    pub forwarder: Arc<Forwarder>,
    pub location: String,
    pub company_id: String,
    pub update_status_path: PathBuf,
}

/// Creates the control-API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/config/location/{name}",
            get(get_location).put(put_location),
        )
        .route("/api/redis/status", get(redis_status))
        .route("/api/config/updates/status", get(updates_status))
        .with_state(state)
}

/// Liveness plus dependency status.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue_stats = state.queue.stats().await;
    let queue = if queue_stats.is_full() {
        "full"
    } else if !state.queue.durable_available() {
        "fallback"
    } else {
        "ok"
    };
    let auth = state.auth.is_healthy();
    let config_stale = state.config_sub.is_stale();

    let status = if auth && queue == "ok" && !config_stale {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "auth": auth,
        "queue": queue,
        "configStale": config_stale,
    }))
}

fn require_company(params: &HashMap<String, String>) -> Result<&str, GatewayError> {
    params
        .get("companyId")
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or(GatewayError::MissingCompanyId)
}

/// Merged location configuration, from the live snapshot when it is ours.
async fn get_location(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, GatewayError> {
    let company = require_company(&params)?;

    if name == state.location && company == state.company_id && !state.config_sub.is_stale() {
        return Ok(Json(json!({
            "success": true,
            "config": &*state.config_sub.snapshot(),
            "fromCache": true,
        })));
    }

    let path = location_document_path(company, &name);
    let doc = state
        .store
        .get(&path)
        .await?
        .ok_or_else(|| GatewayError::LocationNotFound(name.clone()))?;

    Ok(Json(json!({
        "success": true,
        "config": doc,
        "fromCache": false,
    })))
}

/// Patch the location configuration in the remote store. The snapshot
/// stream picks the change up like any other remote edit.
async fn put_location(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let company = require_company(&params)?;

    let path = location_document_path(company, &name);
    state.store.update(&path, &patch, true).await?;
    debug!(location = %name, "location configuration patched");

    Ok(Json(json!({ "success": true })))
}

/// Queue depth and processing flag.
async fn redis_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.queue.stats().await;
    Json(json!({
        "connected": state.queue.durable_available(),
        "retryQueueLength": stats.size,
        "isProcessing": state.forwarder.is_processing(),
    }))
}

/// Local update-status file maintained by the out-of-process updater.
async fn updates_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = match tokio::fs::read_to_string(&state.update_status_path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or(Value::String("unknown".to_owned())),
        Err(_) => Value::String("unknown".to_owned()),
    };
    Json(json!({ "status": status }))
}
