//! Service-specific error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};

/// Errors returned by admin API handlers.
///
/// Logical misses (empty pool, double release) are ordinary responses and
/// never become an `Error`.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Pool(#[from] lease_pool::Error),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Pool(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            Error::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        match status {
            StatusCode::BAD_REQUEST => warn!(error = %self, "rejected admin request"),
            _ => error!(error = %self, status = status.as_u16(), "admin request failed"),
        }
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": self.to_string() }).to_string(),
        )
            .into_response()
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
