// REST API over the orchestrator

use axum::{
    Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use http::{StatusCode, header};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::OrchestratorError;
use crate::orchestrator::Maestro;

pub type AppState = Arc<Maestro>;

/// Largest accepted upload request.
const UPLOAD_LIMIT: usize = 64 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/servers", get(list_servers))
        .route("/containers", get(list_images))
        .route(
            "/container/{name}",
            post(create_image).get(get_image).delete(delete_image),
        )
        .route("/container/{name}/files", post(upload_files).get(list_files))
        .route("/container/{name}/file", get(download_file).delete(delete_file))
        .route("/container/{name}/run", post(run_image))
        .route("/container/{name}/build", post(build_image))
        .route("/container/{name}/stop", post(stop_image))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(UPLOAD_LIMIT)),
        )
        .with_state(state)
}

/// An operation failure rendered as `{"error": ...}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
            OrchestratorError::InvalidName(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn message(text: String) -> Json<Value> {
    Json(json!({ "message": text }))
}

#[derive(Debug, Deserialize)]
struct ServerQuery {
    #[serde(rename = "serverName", default)]
    server_name: String,
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    #[serde(default)]
    f_name: String,
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn list_servers(State(state): State<AppState>) -> Json<Value> {
    let servers = state.list_servers();
    Json(json!({
        "servers": servers,
        "count": servers.len(),
    }))
}

async fn list_images(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let images = state.list_images().await;
    serde_json::to_value(images)
        .map(Json)
        .map_err(|e| OrchestratorError::Internal(e.to_string()).into())
}

async fn get_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let view = state.get_image(&name).await?;
    Ok(Json(json!(view)))
}

async fn create_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state.create_image(&name).await?;
    Ok((
        StatusCode::CREATED,
        message(format!("New container {name} created")),
    ))
}

async fn delete_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.delete_image(&name).await?;
    Ok(message(format!("Container {name} deleted successfully")))
}

/// Save every `files` part of a multipart upload into the image directory.
async fn upload_files(
    State(state): State<AppState>,
    Path(name): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    // Unknown images are rejected before reading the body.
    state.image(&name)?;

    let mut saved = 0;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to parse multipart form: {e}")))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let contents = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read {file_name}: {e}")))?;

        state.write_file(&name, &file_name, &contents).await?;
        saved += 1;
    }

    if saved == 0 {
        return Err(ApiError::bad_request("No file uploaded"));
    }
    Ok(message(format!("Files uploaded for image {name}")))
}

async fn list_files(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let files = state.list_files(&name).await?;
    Ok(Json(json!(files)))
}

async fn download_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let path = state.file_path(&name, &query.f_name).await?;
    let contents = tokio::fs::read(&path)
        .await
        .map_err(OrchestratorError::from)?;

    let disposition = format!("attachment; filename=\"{}\"", query.f_name.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(contents),
    )
        .into_response())
}

async fn delete_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<Value>> {
    state.delete_file(&name, &query.f_name).await?;
    Ok(message(format!(
        "File {} deleted for image {}",
        query.f_name, name
    )))
}

async fn run_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ServerQuery>,
) -> ApiResult<Json<Value>> {
    state.run(&name, &query.server_name).await?;
    Ok(message(format!(
        "Container for image {} started successfully on server {}",
        name, query.server_name
    )))
}

async fn build_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ServerQuery>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let build_id = state.build(&name, &query.server_name).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": format!(
                "Image {} built successfully on server {}",
                name, query.server_name
            ),
            "build_id": build_id,
        })),
    ))
}

async fn stop_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.stop(&name).await?;
    Ok(message(format!(
        "Container for image {name} stopped successfully"
    )))
}
