use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::models::ErrorResponse;

/// Failures that abort startup. The service never serves traffic after one of these.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("artifact `{file}` not found in {dir}")]
    ArtifactMissing { file: String, dir: String },
    #[error("failed to download `{file}` from {repo}: {source}")]
    Download {
        repo: String,
        file: String,
        #[source]
        source: hf_hub::api::sync::ApiError,
    },
    #[error("failed to load model {model}: {source}")]
    ModelLoad {
        model: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to read label file {path}: {source}")]
    LabelsIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid label file: {0}")]
    LabelsFormat(String),
    #[error("registry is missing model {0}")]
    IncompleteRegistry(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model `{0}` not found")]
    NotFound(String),
}

/// Failures while preprocessing an image or running a model on it.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0:#}")]
    Inference(#[source] anyhow::Error),
    #[error("model produced an empty output")]
    EmptyOutput,
    #[error("model output has no comparable score ({0} values, all NaN)")]
    NoFiniteScore(usize),
    #[error("predicted index {index} is outside the label table ({classes} classes)")]
    LabelOutOfRange { index: usize, classes: usize },
}

/// Request-level failures, rendered as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid model selection")]
    UnknownModel(String),
    #[error("Image is missing")]
    MissingImage,
    #[error("Field `{0}` is missing")]
    MissingField(&'static str),
    #[error("Malformed form data: {0}")]
    MalformedForm(String),
    #[error("Field `{field}` exceeds the {limit} byte upload limit")]
    PayloadTooLarge { field: String, limit: usize },
    #[error("{0}")]
    Processing(String),
}

impl From<ClassifyError> for ApiError {
    fn from(err: ClassifyError) -> Self {
        ApiError::Processing(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for ApiError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        ApiError::MalformedForm(err.to_string())
    }
}

impl From<actix_web::error::BlockingError> for ApiError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        ApiError::Processing(err.to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingImage | ApiError::MissingField(_) | ApiError::MalformedForm(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            detail: self.to_string(),
        })
    }
}
