use actix_multipart::{Field, Multipart, MultipartError};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, web};
use futures::TryStreamExt;
use log::{error, info, warn};
use serde::Serialize;
use shared::{ClassificationResults, DEFAULT_MIN_CONFIDENCE, StoredRecord, VocabularyResponse};
use std::sync::Arc;

use crate::classifier::Classifier;
use crate::context::AppContext;
use crate::pipeline::{CancelSignal, Cancelled, ImageSubmission};
use crate::storage::MAX_OBJECT_SIZE;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Upper bound for non-file form fields such as `min_confidence`.
const MAX_TEXT_FIELD_SIZE: usize = 1024;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse {
        error: error.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Malformed upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("min_confidence must be a number between 0 and 1, got {0:?}")]
    MinConfidence(String),
    #[error("Form field {field:?} exceeds the {limit} byte limit")]
    TooLarge { field: String, limit: usize },
}

impl IntakeError {
    fn status(&self) -> StatusCode {
        match self {
            IntakeError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Per-part byte caps applied while the form is read.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub file: usize,
    pub text: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            file: MAX_OBJECT_SIZE,
            text: MAX_TEXT_FIELD_SIZE,
        }
    }
}

#[derive(Debug)]
pub struct UploadedFile {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct UploadForm {
    pub files: Vec<UploadedFile>,
    pub min_confidence: f32,
}

impl UploadForm {
    pub fn into_batch(self) -> Vec<ImageSubmission> {
        let min_confidence = self.min_confidence;
        self.files
            .into_iter()
            .map(|file| ImageSubmission {
                filename: file.filename,
                mime_type: file.mime_type,
                data: file.data,
                min_confidence,
            })
            .collect()
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/image_classify").route(web::post().to(image_classify)))
        .service(
            web::resource("/api/image_classify_cloud_vision_api")
                .route(web::post().to(image_classify_cloud_vision_api)),
        )
        .service(
            web::resource("/api/classification_results")
                .route(web::get().to(classification_results)),
        )
        .service(
            web::resource("/api/image_classify_classes")
                .route(web::get().to(image_classify_classes)),
        );
}

/// Empty means the form default applies.
pub fn parse_min_confidence(raw: &str) -> Result<f32, IntakeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_MIN_CONFIDENCE);
    }
    let value: f32 = trimmed
        .parse()
        .map_err(|_| IntakeError::MinConfidence(raw.to_string()))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(IntakeError::MinConfidence(raw.to_string()));
    }
    Ok(value)
}

/// Buffers a part, giving up as soon as it grows past `limit`.
async fn read_field(
    field: &mut Field,
    name: &str,
    limit: usize,
) -> Result<Vec<u8>, IntakeError> {
    let mut data = Vec::new();
    while let Some(chunk) = field.try_next().await? {
        if data.len() + chunk.len() > limit {
            return Err(IntakeError::TooLarge {
                field: name.to_string(),
                limit,
            });
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

async fn skip_field(field: &mut Field) -> Result<(), MultipartError> {
    while field.try_next().await?.is_some() {}
    Ok(())
}

/// Collects `files` parts and the optional `min_confidence` field. File parts
/// without a filename (an empty file picker) are dropped here, so an empty
/// selection reaches the pipeline as an empty batch.
pub async fn read_upload(
    mut payload: Multipart,
    limits: UploadLimits,
) -> Result<UploadForm, IntakeError> {
    let mut files = Vec::new();
    let mut min_confidence = DEFAULT_MIN_CONFIDENCE;

    while let Some(mut field) = payload.try_next().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" => {
                let filename = field
                    .content_disposition()
                    .and_then(|cd| cd.get_filename())
                    .unwrap_or_default()
                    .to_string();
                let mime_type = field
                    .content_type()
                    .map(|mime| mime.essence_str().to_string())
                    .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
                let data = read_field(&mut field, &name, limits.file).await?;
                if filename.is_empty() {
                    continue;
                }
                files.push(UploadedFile {
                    filename,
                    mime_type,
                    data,
                });
            }
            "min_confidence" => {
                let raw = read_field(&mut field, &name, limits.text).await?;
                min_confidence = parse_min_confidence(&String::from_utf8_lossy(&raw))?;
            }
            _ => skip_field(&mut field).await?,
        }
    }

    Ok(UploadForm {
        files,
        min_confidence,
    })
}

async fn image_classify(ctx: web::Data<AppContext>, payload: Multipart) -> HttpResponse {
    let classifier = ctx.local_classifier.clone();
    classify_upload(ctx, payload, classifier).await
}

async fn image_classify_cloud_vision_api(
    ctx: web::Data<AppContext>,
    payload: Multipart,
) -> HttpResponse {
    let classifier = ctx.vision_classifier.clone();
    classify_upload(ctx, payload, classifier).await
}

/// Runs the batch on its own task so that a dropped request lets in-flight
/// items finish their current step instead of being cut off mid-write.
async fn classify_upload(
    ctx: web::Data<AppContext>,
    payload: Multipart,
    classifier: Arc<dyn Classifier>,
) -> HttpResponse {
    let form = match read_upload(payload, UploadLimits::default()).await {
        Ok(form) => form,
        Err(e) => {
            warn!("Rejected upload: {}", e);
            return error_response(e.status(), e);
        }
    };

    let batch = form.into_batch();
    let signal = CancelSignal::new();
    let guard = signal.cancel_on_drop();

    let task = actix_web::rt::spawn(async move {
        ctx.pipeline
            .ingest_cancellable(batch, classifier.as_ref(), &signal)
            .await
    });
    let joined = task.await;
    guard.disarm();

    match joined {
        Ok(Ok(result)) => HttpResponse::Ok().json(result),
        Ok(Err(Cancelled)) => error_response(StatusCode::SERVICE_UNAVAILABLE, Cancelled),
        Err(e) => {
            error!("Ingestion task failed: {:?}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Ingestion task failed")
        }
    }
}

async fn classification_results(ctx: web::Data<AppContext>) -> HttpResponse {
    let listed: Result<Vec<StoredRecord>, _> =
        ctx.pipeline.result_store().list_all().try_collect().await;

    match listed {
        Ok(mut records) => {
            records.sort_by(|a, b| b.record.created_at.cmp(&a.record.created_at));
            info!("classification_results: records={}", records.len());
            HttpResponse::Ok().json(ClassificationResults {
                bucket_name: ctx.pipeline.bucket_name().to_string(),
                records,
            })
        }
        Err(e) => {
            error!("Failed to list classification results: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to list classification results",
            )
        }
    }
}

async fn image_classify_classes(ctx: web::Data<AppContext>) -> HttpResponse {
    HttpResponse::Ok().json(VocabularyResponse {
        classes: ctx.classes.clone(),
    })
}
