//! REST Server
//!
//! HTTP front end for uploading sheets, grading them and browsing stored
//! results. Grading runs on the blocking thread pool; the async side only
//! moves bytes and JSON.

mod handlers;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::AppConfig;
use crate::errors::{GradingError, PersistenceError};
use crate::pipeline::GradingPipeline;
use crate::storage::{self, ResultStore, UploadStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<GradingPipeline>,
    uploads: UploadStore,
    results: ResultStore,
    default_threshold: f64,
}

impl AppState {
    /// Build state from configuration, creating the storage directories
    pub fn from_config(config: &AppConfig, pipeline: GradingPipeline) -> Result<Self> {
        let upload_dir = resolve_dir(config.server.upload_dir.as_ref(), "uploads")?;
        let results_dir = resolve_dir(config.server.results_dir.as_ref(), "results")?;

        Ok(Self::new(
            pipeline,
            UploadStore::new(upload_dir)?,
            ResultStore::new(results_dir)?,
            config.grading.threshold,
        ))
    }

    pub fn new(
        pipeline: GradingPipeline,
        uploads: UploadStore,
        results: ResultStore,
        default_threshold: f64,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            uploads,
            results,
            default_threshold,
        }
    }
}

fn resolve_dir(configured: Option<&PathBuf>, name: &str) -> Result<PathBuf> {
    match configured {
        Some(dir) => Ok(dir.clone()),
        None => Ok(storage::get_data_dir()?.join(name)),
    }
}

/// Create the API router
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/version", get(handlers::version))
        .route("/api/upload", post(handlers::upload_image))
        .route("/api/grade", post(handlers::grade))
        .route("/api/results", get(handlers::list_results))
        .route("/api/results/:filename", get(handlers::get_result))
        .route("/api/images", get(handlers::list_images))
        .route("/api/image/:filename", get(handlers::download_image))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
}

/// Serve until the process is stopped
pub async fn run(config: &AppConfig, state: AppState, host: &str, port: u16) -> Result<()> {
    let max_upload_bytes = config.server.max_upload_mb * 1024 * 1024;
    let app = router(state, max_upload_bytes);

    let addr = format!("{}:{}", host, port);
    info!("{}", "=".repeat(60));
    info!("Server starting on http://{}", addr);
    info!("Endpoints:");
    info!("  GET  /api/health             - Health check");
    info!("  GET  /api/version            - Version info");
    info!("  POST /api/upload             - Upload a sheet (multipart field \"image\")");
    info!("  POST /api/grade              - Grade an uploaded sheet");
    info!("  GET  /api/results            - List grading records");
    info!("  GET  /api/results/:filename  - Fetch one record");
    info!("  GET  /api/images             - List uploaded sheets");
    info!("  GET  /api/image/:filename    - Download a sheet");
    info!("{}", "=".repeat(60));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// JSON error response `{"error": message}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<GradingError> for ApiError {
    fn from(e: GradingError) -> Self {
        match e {
            GradingError::ImageNotFound(_) => Self::not_found(e.to_string()),
            GradingError::InvalidImage(_)
            | GradingError::ImageLoad { .. }
            | GradingError::EmptyAnswerKey
            | GradingError::InvalidThreshold(_)
            | GradingError::AnswerKey(_) => Self::bad_request(e.to_string()),
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::NotFound(_) => Self::not_found(e.to_string()),
            PersistenceError::InvalidName(_) | PersistenceError::UnsupportedType(_) => {
                Self::bad_request(e.to_string())
            }
            PersistenceError::Io { .. } | PersistenceError::Serialize(_) => {
                Self::internal(e.to_string())
            }
        }
    }
}
