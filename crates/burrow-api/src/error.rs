//! API errors

use crate::models::ErrorResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use burrow_control::RegistryError;
use burrow_server_backend::BackendListenerError;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.")]
    InvalidSubdomain,

    #[error("Subdomain '{0}' is already in use")]
    SubdomainTaken(String),

    #[error("Tunnel capacity exceeded, try again later")]
    CapacityExceeded,

    #[error("Tunnel '{0}' not found")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidSubdomain => StatusCode::FORBIDDEN,
            ApiError::SubdomainTaken(_) => StatusCode::CONFLICT,
            ApiError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidIdentifier(reason) => {
                debug!("Rejected subdomain: {}", reason);
                ApiError::InvalidSubdomain
            }
            RegistryError::IdentifierTaken(id) => ApiError::SubdomainTaken(id),
            RegistryError::CapacityExceeded => ApiError::CapacityExceeded,
            RegistryError::Disconnected(id) => ApiError::NotFound(id),
        }
    }
}

impl From<BackendListenerError> for ApiError {
    fn from(err: BackendListenerError) -> Self {
        match err {
            BackendListenerError::Registry(err) => err.into(),
            other => {
                error!("Failed to open tunnel: {}", other);
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse {
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::IdentityError;

    #[test]
    fn test_registry_error_mapping() {
        let invalid: ApiError = RegistryError::InvalidIdentifier(IdentityError::EdgeHyphen).into();
        assert_eq!(invalid.status_code(), StatusCode::FORBIDDEN);

        let taken: ApiError = RegistryError::IdentifierTaken("demo".into()).into();
        assert_eq!(taken.status_code(), StatusCode::CONFLICT);

        let full: ApiError = RegistryError::CapacityExceeded.into();
        assert_eq!(full.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
