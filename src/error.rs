use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Failures raised while resolving a URL or moving media bytes.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend could not turn the URL into a stream list.
    #[error("{0}")]
    Extraction(String),

    #[error("Format not found: {0}")]
    FormatNotFound(String),

    /// The byte transfer into the work directory failed.
    #[error("{0}")]
    Fetch(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Error kinds surfaced by the HTTP handlers.
///
/// The message is passed to the client verbatim as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Discovery(String),

    #[error("{0}")]
    Download(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Discovery(_) => StatusCode::BAD_REQUEST,
            Self::Download(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}
