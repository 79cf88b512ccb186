//! Gateway error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::store::StoreError;

/// Gateway errors.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request lacked the mandatory `companyId` parameter.
    #[error("missing companyId")]
    MissingCompanyId,

    /// No valid credential for the remote store.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The requested location has no configuration document.
    #[error("location not found: {0}")]
    LocationNotFound(String),

    /// The auth endpoint refused us.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote document store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl GatewayError {
    /// HTTP status for the control API.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCompanyId => StatusCode::BAD_REQUEST,
            Self::Unauthenticated | Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::LocationNotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::Auth) => StatusCode::UNAUTHORIZED,
            Self::Config(_)
            | Self::Http(_)
            | Self::Store(_)
            | Self::Io(_)
            | Self::Serialisation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal detail stays in the logs, not in responses.
        let message = match &self {
            Self::MissingCompanyId => "companyId is required".to_owned(),
            Self::Unauthenticated | Self::Auth(_) | Self::Store(StoreError::Auth) => {
                "unauthenticated".to_owned()
            }
            Self::LocationNotFound(name) => format!("location not found: {name}"),
            _ => "internal error".to_owned(),
        };

        (
            status,
            Json(serde_json::json!({ "success": false, "error": message })),
        )
            .into_response()
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            GatewayError::MissingCompanyId.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Unauthenticated.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::LocationNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::Config("bad".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
