//! REST endpoints: health, client config, session history, project files and
//! one-shot spec generation. Every handler resolves the caller and runs the
//! user-root and quota guards first.

pub mod files;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::caller::Caller;
use crate::gemini_spawner::InvocationError;
use crate::guards::GuardError;
use crate::session_store::StoreError;
use crate::state::AppState;
use files::{file_tree, TREE_DEPTH};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Map a filesystem error, using `not_found` as the 404 message
    fn io(err: std::io::Error, not_found: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(not_found.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::Forbidden("Permission denied".into()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidId(_) => Self::BadRequest(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<InvocationError> for ApiError {
    fn from(err: InvocationError) -> Self {
        match err {
            InvocationError::Guard(guard) => Self::Guard(guard),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Guard(guard) => {
                let status = StatusCode::from_u16(guard.status())
                    .unwrap_or(StatusCode::FORBIDDEN);
                let mut body = json!({ "error": guard.to_string() });
                if let GuardError::OverQuota(quota) = guard {
                    body["code"] = json!(guard.code());
                    body["used"] = json!(quota.used);
                    body["limit"] = json!(quota.limit);
                }
                (status, body)
            }
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Resolve the caller, create their root and check their quota
fn admit(state: &AppState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let caller = Caller::from_headers(headers, &state.config.identity);
    let users = state.spawner.users();
    users.ensure_user_root(&caller.uid)?;
    users.quota_guard(&caller.uid)?;
    Ok(caller)
}

/// Project names in URLs encode the directory with `-` for `/`
pub fn decode_project_name(name: &str) -> String {
    name.replace('-', "/")
}

fn guard_project_path(state: &AppState, path: &str, context: &str) -> Result<(), ApiError> {
    let paths = state.spawner.paths();
    paths.ensure_root_exists()?;
    paths.assert_within_root(path, context)?;
    Ok(())
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// `GET /api/config`
pub async fn client_config(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let caller = admit(&state, &headers)?;
    let port = state.config.server.port;
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", port));
    let secure = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
    let scheme = if secure { "wss" } else { "ws" };

    Ok(Json(json!({
        "serverPort": port,
        "wsUrl": format!("{}://{}", scheme, host),
        "shellRoot": state.spawner.paths().root(),
        "userRoot": state.spawner.users().user_root(&caller.uid),
    })))
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    5
}

/// `GET /api/projects/{project}/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project): Path<String>,
    Query(page): Query<Pagination>,
) -> ApiResult {
    admit(&state, &headers)?;
    let project_path = decode_project_name(&project);
    guard_project_path(&state, &project_path, "Project path")?;

    let sessions = state.sessions().list_sessions_for_project(&project_path).await;
    let total = sessions.len();
    let page: Vec<_> = sessions
        .into_iter()
        .skip(page.offset)
        .take(page.limit)
        .collect();
    Ok(Json(json!({ "sessions": page, "total": total })))
}

/// `GET /api/projects/{project}/sessions/{session_id}/messages`
pub async fn session_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_project, session_id)): Path<(String, String)>,
) -> ApiResult {
    admit(&state, &headers)?;
    let messages = state.sessions().get_session_messages(&session_id).await;
    Ok(Json(json!({ "messages": messages })))
}

/// `DELETE /api/projects/{project}/sessions/{session_id}`
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_project, session_id)): Path<(String, String)>,
) -> ApiResult {
    admit(&state, &headers)?;
    let existed = state.sessions().delete_session(&session_id).await?;
    debug!("Delete session {} (existed: {})", session_id, existed);
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQuery {
    file_path: Option<String>,
}

/// Only absolute paths inside the shell root may be touched
fn checked_file_path(state: &AppState, raw: Option<&str>) -> Result<PathBuf, ApiError> {
    let path = raw
        .filter(|p| std::path::Path::new(p).is_absolute())
        .ok_or_else(|| ApiError::BadRequest("Invalid file path".into()))?;
    guard_project_path(state, path, "File path")?;
    Ok(PathBuf::from(path))
}

/// `GET /api/projects/{project}/file?filePath=`
pub async fn read_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(_project): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult {
    admit(&state, &headers)?;
    let path = checked_file_path(&state, query.file_path.as_deref())?;
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ApiError::io(e, "File not found"))?;
    Ok(Json(json!({ "content": content, "path": path })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveFileRequest {
    file_path: Option<String>,
    content: Option<String>,
}

/// `PUT /api/projects/{project}/file`: the previous contents are copied to
/// `<path>.backup.<epoch-ms>` before writing.
pub async fn write_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(_project): Path<String>,
    Json(request): Json<SaveFileRequest>,
) -> ApiResult {
    admit(&state, &headers)?;
    let path = checked_file_path(&state, request.file_path.as_deref())?;
    let content = request
        .content
        .ok_or_else(|| ApiError::BadRequest("Content is required".into()))?;

    let backup = format!("{}.backup.{}", path.display(), Utc::now().timestamp_millis());
    match tokio::fs::copy(&path, &backup).await {
        Ok(_) => debug!("Created backup {}", backup),
        Err(e) => debug!("No backup for {:?}: {}", path, e),
    }

    tokio::fs::write(&path, content)
        .await
        .map_err(|e| ApiError::io(e, "File or directory not found"))?;
    info!("Saved file {:?}", path);
    Ok(Json(json!({
        "success": true,
        "path": path,
        "message": "File saved successfully",
    })))
}

/// `GET /api/projects/{project}/files`
pub async fn project_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project): Path<String>,
) -> ApiResult {
    admit(&state, &headers)?;
    let project_path = decode_project_name(&project);
    guard_project_path(&state, &project_path, "Project path")?;

    let root = PathBuf::from(&project_path);
    if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
        return Err(ApiError::NotFound(format!(
            "Project path not found: {}",
            project_path
        )));
    }
    let tree = tokio::task::spawn_blocking(move || file_tree(&root, TREE_DEPTH, 0))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!(tree)))
}

#[derive(Debug, Deserialize)]
pub struct GenerateSpecRequest {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    context: String,
}

/// `POST /api/generate-spec`
pub async fn generate_spec(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateSpecRequest>,
) -> ApiResult {
    admit(&state, &headers)?;
    if request.kind.trim().is_empty() {
        return Err(ApiError::BadRequest("type is required".into()));
    }
    let spec = state
        .spawner
        .generate_spec(&request.kind, &request.context)
        .await?;
    Ok(Json(json!({ "spec": spec })))
}
