//! Request handlers

use axum::{
    extract::{rejection::JsonRejection, Multipart, Path, State},
    http::header,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{error, info, warn};

use super::{ApiError, AppState};
use crate::grading::{AnswerKeyFile, GradingRecord};
use crate::pipeline::GradingPipeline;
use crate::storage::unix_timestamp;

const APP_NAME: &str = "Sheet Grader";

/// Body of `POST /api/grade`
#[derive(Debug, Clone, Deserialize)]
pub struct GradeRequest {
    /// Name of a previously uploaded sheet
    pub image: String,
    /// Answer list, or an object with an `answers` list
    pub answer_key: Value,
    /// Overrides the configured threshold
    pub threshold: Option<f64>,
}

/// Everything one grading request needs, resolved against the server state
#[derive(Debug, Clone)]
pub struct GradeContext {
    pub image_name: String,
    pub image_path: PathBuf,
    pub answers: Vec<String>,
    pub threshold: f64,
}

impl GradeContext {
    /// Validate a request and resolve its sheet in the upload directory
    pub fn new(state: &AppState, request: GradeRequest) -> Result<Self, ApiError> {
        let answers = match AnswerKeyFile::from_value(request.answer_key) {
            Ok(AnswerKeyFile::List(answers)) | Ok(AnswerKeyFile::Object { answers }) => answers,
            Err(e) => return Err(ApiError::bad_request(e.to_string())),
        };

        let image_path = state.uploads.path_of(&request.image)?;

        Ok(Self {
            image_name: request.image,
            image_path,
            answers,
            threshold: request.threshold.unwrap_or(state.default_threshold),
        })
    }

    /// Run the blocking pipeline for this request
    pub fn run(self, pipeline: &GradingPipeline) -> Result<GradingRecord, ApiError> {
        Ok(pipeline.grade_answers(&self.image_path, self.answers, self.threshold, self.image_name)?)
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": unix_timestamp(),
    }))
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "app": APP_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "platform": format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
    }))
}

/// Store a sheet from multipart field `image`
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("image") {
            continue;
        }

        let filename = field.file_name().unwrap_or("").to_string();
        if filename.is_empty() {
            return Err(ApiError::bad_request("No file selected"));
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Read error: {}", e)))?;

        let stored = state.uploads.save(&filename, &data)?;
        return Ok(Json(json!({
            "success": true,
            "filename": stored.filename,
            "path": stored.path,
        })));
    }

    Err(ApiError::bad_request("No image provided"))
}

/// Grade an uploaded sheet and persist the record
pub async fn grade(
    State(state): State<AppState>,
    body: Result<Json<GradeRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let context = GradeContext::new(&state, request)?;
    info!(
        "Grading {} against {} answers",
        context.image_name,
        context.answers.len()
    );

    let pipeline = state.pipeline.clone();
    let record = tokio::task::spawn_blocking(move || context.run(&pipeline))
        .await
        .map_err(|e| {
            error!("Grading task failed: {}", e);
            ApiError::internal("Grading task failed")
        })??;

    let result_file = match state.results.save(&record) {
        Ok(name) => Some(name),
        Err(e) => {
            warn!("Could not persist grading record: {}", e);
            None
        }
    };

    Ok(Json(json!({
        "success": true,
        "results": record,
        "result_file": result_file,
    })))
}

pub async fn list_results(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let results = state.results.list()?;
    Ok(Json(json!({ "success": true, "results": results })))
}

pub async fn get_result(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.results.load(&filename)?))
}

pub async fn list_images(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let images = state.uploads.list()?;
    Ok(Json(json!({ "success": true, "images": images })))
}

/// Send a stored sheet as an attachment
pub async fn download_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let path = state.uploads.path_of(&filename)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to read {}: {}", filename, e)))?;

    let disposition = format!("attachment; filename=\"{}\"", filename);
    Ok((
        [
            (header::CONTENT_TYPE, content_type(&filename).to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("Endpoint not found")
}

fn content_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}
