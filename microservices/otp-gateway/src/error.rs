//! Wire-level error taxonomy for the OTP gateway.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate prefix")]
    DuplicatePrefix,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("no caller-id route for destination: {0}")]
    NoCallerIdRoute(String),

    #[error("voice control plane disconnected")]
    AriDisconnected,

    #[error("call failed: {0}")]
    CallFailed(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("carrier http error: {0}")]
    Http(u16),

    #[error("database error: {0}")]
    Database(#[from] brivas_lumadb::LumaDbError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wire-level `error` code, per the taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::Forbidden => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::DuplicatePrefix => "duplicate_prefix",
            Error::ServiceUnavailable(_) => "service_unavailable",
            Error::NoCallerIdRoute(_) => "NO_CALLER_ID_ROUTE",
            Error::AriDisconnected => "ARI_DISCONNECTED",
            Error::CallFailed(_) => "CALL_FAILED",
            Error::NetworkError(_) => "NETWORK_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) | Error::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicatePrefix => StatusCode::CONFLICT,
            Error::ServiceUnavailable(_)
            | Error::NoCallerIdRoute(_)
            | Error::AriDisconnected
            | Error::CallFailed(_)
            | Error::NetworkError(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Http(code) => StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY),
            Error::Database(_) | Error::Internal(_) => {
                tracing::error!(error = %self, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
