//! HTTP routes for the item store.
//!
//! Routes:
//! - `GET    /items/{key}`      read a value, `{"value": ...}`
//! - `POST   /items`            upsert `{"key": ..., "value": ...}`, 201
//! - `DELETE /items/{key}`      delete a key, 204 (also when absent)
//! - `GET    /keys?prefix=...`  list keys in ascending order, `{"keys": [...]}`
//!
//! `/items/{key}/`, `/items/` and `/keys/` are accepted as trailing-slash
//! aliases. Unknown paths and methods get the usual `{"error": ...}` body.
//!
//! Every request runs exactly one store transaction.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use itemd_core::ServiceError;
use itemd_kv::KVStore;

type KvState = Arc<dyn KVStore>;

/// Build the item routes, bound to the given store.
pub fn router(kv: Arc<dyn KVStore>) -> Router {
    Router::new()
        .route("/items", post(set_item))
        .route("/items/", post(set_item).get(empty_key).delete(empty_key))
        .route("/items/{key}", get(get_item).delete(delete_item))
        .route("/items/{key}/", get(get_item).delete(delete_item))
        .route("/keys", get(list_keys))
        .route("/keys/", get(list_keys))
        .with_state(kv)
}

/// Merge the item routes into an existing router.
pub fn mount(app: Router, kv: Arc<dyn KVStore>) -> Router {
    app.merge(router(kv))
}

/// Build the complete application: item routes, system endpoints and
/// request tracing.
pub fn build_app(kv: Arc<dyn KVStore>) -> Router {
    let system_routes = Router::new()
        .route("/health", get(health))
        .route("/version", get(version));

    // Fallbacks go on last so they cover every merged route.
    mount(system_routes, kv)
        .fallback(no_route)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(TraceLayer::new_for_http())
}

fn require_key(key: String) -> Result<String, ServiceError> {
    if key.is_empty() {
        return Err(ServiceError::Validation("need not empty key".into()));
    }
    Ok(key)
}

// ---------------------------------------------------------------------------
// GET /items/{key}
// ---------------------------------------------------------------------------

async fn get_item(
    State(kv): State<KvState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let key = require_key(key)?;
    let bytes = kv.get(&key)?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    Ok(Json(serde_json::json!({ "value": value })))
}

// ---------------------------------------------------------------------------
// POST /items
// ---------------------------------------------------------------------------

/// Body of `POST /items`. A `null` value counts as missing.
#[derive(Debug, Deserialize)]
struct SetItemRequest {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

async fn set_item(
    State(kv): State<KvState>,
    payload: Result<Json<SetItemRequest>, JsonRejection>,
) -> Result<StatusCode, ServiceError> {
    let Json(req) = payload.map_err(|e| ServiceError::Validation(e.body_text()))?;

    let key = req
        .key
        .ok_or_else(|| ServiceError::Validation("field 'key' is required".into()))
        .and_then(require_key)?;
    let value = req
        .value
        .ok_or_else(|| ServiceError::Validation("field 'value' is required".into()))?;

    let bytes = serde_json::to_vec(&value)?;
    kv.set(&key, &bytes)?;
    Ok(StatusCode::CREATED)
}

// ---------------------------------------------------------------------------
// DELETE /items/{key}
// ---------------------------------------------------------------------------

/// Absent keys are not looked up first: deleting one is a successful no-op.
async fn delete_item(
    State(kv): State<KvState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ServiceError> {
    let key = require_key(key)?;
    kv.delete(&key)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn empty_key() -> ServiceError {
    ServiceError::Validation("need not empty key".into())
}

// ---------------------------------------------------------------------------
// GET /keys
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ListKeysQuery {
    #[serde(default)]
    prefix: String,
}

async fn list_keys(
    State(kv): State<KvState>,
    query: Result<Query<ListKeysQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let Query(query) = query.map_err(|e| ServiceError::Validation(e.body_text()))?;
    let keys = kv.list_keys(&query.prefix)?;
    Ok(Json(serde_json::json!({ "keys": keys })))
}

// ---------------------------------------------------------------------------
// System endpoints
// ---------------------------------------------------------------------------

async fn no_route(uri: Uri) -> ServiceError {
    ServiceError::NotFound(format!("no route for {}", uri.path()))
}

async fn method_not_allowed(method: Method, uri: Uri) -> ServiceError {
    ServiceError::MethodNotAllowed(format!("method {} not allowed on {}", method, uri.path()))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
    }))
}

async fn version() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "itemd",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
