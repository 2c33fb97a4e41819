use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::jobs::transcode::FormError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Generic(#[from] anyhow::Error),
    #[error("failed to validate payload: {0}")]
    FailedValidation(#[from] FormError),
    #[error("failed to parse payload")]
    FailedJsonParse(#[from] JsonRejection),
    #[error("not found")]
    NotFound,
    #[error("error with environment configuration")]
    EnvConfig(#[from] std::env::VarError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            Self::Generic(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal server error: {}", err),
            ),
            Self::FailedValidation(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            Self::FailedJsonParse(err) => (
                StatusCode::BAD_REQUEST,
                format!("json parse failed: {}", err.body_text()),
            ),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".into()),
            Self::EnvConfig(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("environment variable error: {}", err),
            ),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
