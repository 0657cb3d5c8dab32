//! HTTP surface: an axum router over [`DrawingService`].
//!
//! | Route | Operation |
//! |-------|-----------|
//! | `POST /upload` | store the multipart `file` as `file.<ext>` |
//! | `GET /preprocess` | rasterise the upload into page images |
//! | `GET /load_model` | load the detection model (idempotent) |
//! | `GET /inference?max_workers=<n>` | run detection over the newest pages |
//! | `GET /results` | aggregate the inference run(s) |
//! | `GET /reset` | delete uploads and outputs |
//! | `GET /health` | liveness and version |
//!
//! `/uploads/*` and `/outputs/*` serve the two roots read-only so clients
//! can render the page previews referenced in `/results`.
//!
//! Every fatal error is answered as `{status: "failed", error}` with the
//! status code from [`DrawScanError::status_code`].

use crate::error::DrawScanError;
use crate::service::DrawingService;
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::QueryRejection,
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Largest accepted upload. Drawing sets run to hundreds of megabytes.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

type SharedService = Arc<DrawingService>;

/// A failed request, rendered as `{status: "failed", error}`.
#[derive(Debug)]
pub enum ApiError {
    Pipeline(DrawScanError),
    BadRequest(String),
    /// An extractor refused the request before the handler ran.
    Rejected { status: StatusCode, message: String },
}

impl From<QueryRejection> for ApiError {
    fn from(r: QueryRejection) -> Self {
        ApiError::Rejected {
            status: r.status(),
            message: r.body_text(),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(r: MultipartRejection) -> Self {
        ApiError::Rejected {
            status: r.status(),
            message: r.body_text(),
        }
    }
}

impl From<DrawScanError> for ApiError {
    fn from(e: DrawScanError) -> Self {
        ApiError::Pipeline(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Pipeline(e) => (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.to_string(),
            ),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Rejected { status, message } => (status, message),
        };
        if status.is_server_error() {
            error!("{}", message);
        }
        (status, Json(json!({ "status": "failed", "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct InferenceParams {
    pub max_workers: Option<usize>,
}

/// Build the router with all endpoints and static mounts.
pub fn router(service: SharedService) -> Router {
    let uploads = ServeDir::new(&service.config().upload_dir);
    let outputs = ServeDir::new(&service.config().output_dir);

    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/preprocess", get(preprocess))
        .route("/load_model", get(load_model))
        .route("/inference", get(inference))
        .route("/results", get(results))
        .route("/reset", get(reset))
        .nest_service("/uploads", uploads)
        .nest_service("/outputs", outputs)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Create the storage roots, bind `addr` and serve until the process exits.
pub async fn serve(addr: &str, service: DrawingService) -> Result<(), DrawScanError> {
    service.ensure_dirs().await?;
    let app = router(Arc::new(service));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DrawScanError::Internal(format!("Cannot bind {addr}: {e}")))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| DrawScanError::Internal(format!("Server error: {e}")))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn upload(
    State(service): State<SharedService>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let mut multipart = multipart?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {e}")))?;
        let response = service.upload(&file_name, &bytes).await?;
        return Ok(Json(response));
    }
    Err(ApiError::BadRequest("No file in upload".to_string()))
}

async fn preprocess(State(service): State<SharedService>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(service.preprocess().await?))
}

async fn load_model(State(service): State<SharedService>) -> Result<impl IntoResponse, ApiError> {
    service.load_model().await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn inference(
    State(service): State<SharedService>,
    params: Result<Query<InferenceParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    Ok(Json(service.inference(params.max_workers).await?))
}

async fn results(State(service): State<SharedService>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(service.results().await?))
}

async fn reset(State(service): State<SharedService>) -> Result<impl IntoResponse, ApiError> {
    service.reset().await?;
    Ok(Json(
        json!({ "status": "ok", "message": "uploads and outputs cleared" }),
    ))
}
