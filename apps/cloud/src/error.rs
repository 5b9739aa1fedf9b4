//! Error types for the cloud relay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use canopy_bridge::BridgeError;
use canopy_db::DbError;

use crate::access::AccessError;
use crate::config::ConfigError;

/// Cloud relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Broker error: {0}")]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// An internal task has gone away.
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Access(AccessError::Auth(_)) => StatusCode::UNAUTHORIZED,
            RelayError::Access(AccessError::Denied(_)) => StatusCode::FORBIDDEN,
            RelayError::Access(AccessError::NotFound(_)) => StatusCode::NOT_FOUND,
            RelayError::Access(AccessError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Db(DbError::NotFound { .. }) => StatusCode::NOT_FOUND,
            RelayError::Bridge(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Db(_)
            | RelayError::Config(_)
            | RelayError::ChannelClosed(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RelayError::from(AccessError::Auth("x".into())).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RelayError::from(AccessError::Denied("s".into())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            RelayError::from(DbError::not_found("Site", "s")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::from(BridgeError::Unavailable).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::ChannelClosed("registry").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
