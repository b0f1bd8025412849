//! Web API handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use validator::Validate;

use super::error::ApiError;
use crate::db::Database;
use crate::script::{
    ExecutionContext, ScriptDispatcher, ScriptRecord, ScriptRepository, ScriptType, GUEST_USER,
};
use crate::ScriptHostError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ScriptDispatcher>,
    pub db: Arc<Mutex<Database>>,
}

/// Build the caller context from request headers and form body.
///
/// Identity comes from the host's auth layer via the `x-user` header;
/// absent means the anonymous Guest.
fn context_from_request(headers: &HeaderMap, form_args: HashMap<String, String>) -> ExecutionContext {
    let user = headers
        .get("x-user")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(GUEST_USER)
        .to_string();
    let csrf_token = headers
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let lang = headers
        .get("x-lang")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("en")
        .to_string();

    ExecutionContext {
        user,
        csrf_token,
        lang,
        form_args,
    }
}

/// POST /api/method/{name} - run an API script and return its flags.
pub async fn run_method(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<HashMap<String, String>>>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context_from_request(&headers, body.map(|Json(b)| b).unwrap_or_default());

    let flags = tokio::task::spawn_blocking(move || {
        let script = load_script(&state.db, &name)?;
        state.dispatcher.execute_method(&script, ctx)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;

    Ok(Json(Value::Object(flags)))
}

/// GET /api/autocomplete - dotted names for the script editor.
pub async fn get_autocomplete(
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, ApiError> {
    let items = tokio::task::spawn_blocking(move || state.dispatcher.get_autocompletion_items())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(Json(items.as_ref().clone()))
}

/// Admin request body for creating or updating a script.
#[derive(Debug, Deserialize, Validate)]
pub struct ScriptUpsertRequest {
    #[validate(length(min = 1, max = 140, message = "name must be 1-140 characters"))]
    pub name: String,
    #[validate(length(min = 1, message = "script body is required"))]
    pub script: String,
    pub script_type: ScriptType,
    #[serde(default)]
    pub allow_guest: bool,
    #[serde(default)]
    pub enable_rate_limit: bool,
    #[serde(default)]
    pub rate_limit_count: u32,
    #[serde(default)]
    pub rate_limit_seconds: u64,
    #[serde(default)]
    pub disabled: bool,
}

impl From<ScriptUpsertRequest> for ScriptRecord {
    fn from(req: ScriptUpsertRequest) -> Self {
        ScriptRecord {
            name: req.name,
            script: req.script,
            script_type: req.script_type,
            allow_guest: req.allow_guest,
            enable_rate_limit: req.enable_rate_limit,
            rate_limit_count: req.rate_limit_count,
            rate_limit_seconds: req.rate_limit_seconds,
            disabled: req.disabled,
        }
    }
}

/// GET /api/admin/scripts - list all script records.
pub async fn list_scripts(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScriptRecord>>, ApiError> {
    let scripts = tokio::task::spawn_blocking(move || {
        let db = state.db.lock().unwrap();
        ScriptRepository::new(&db).list()
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(Json(scripts))
}

/// PUT /api/admin/scripts - create or update a script record.
pub async fn upsert_script(
    State(state): State<AppState>,
    Json(req): Json<ScriptUpsertRequest>,
) -> Result<StatusCode, ApiError> {
    req.validate().map_err(ApiError::from_validation_errors)?;
    let record: ScriptRecord = req.into();

    tokio::task::spawn_blocking(move || {
        let db = state.db.lock().unwrap();
        ScriptRepository::new(&db).upsert(&record)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/admin/scripts/{name} - delete a script record.
pub async fn delete_script(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    tokio::task::spawn_blocking(move || {
        let db = state.db.lock().unwrap();
        ScriptRepository::new(&db).delete(&name)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/admin/clear-cache - invalidate the autocompletion cache.
pub async fn clear_cache(State(state): State<AppState>) -> StatusCode {
    state.dispatcher.clear_autocomplete_cache();
    StatusCode::NO_CONTENT
}

fn load_script(db: &Arc<Mutex<Database>>, name: &str) -> crate::Result<ScriptRecord> {
    let db = db.lock().unwrap();
    ScriptRepository::new(&db)
        .get_by_name(name)?
        .ok_or_else(|| ScriptHostError::NotApplicable(name.to_string()))
}
