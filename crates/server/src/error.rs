use axum::Json;
use axum::http::StatusCode;
use serde_json::json;

/// The error taxonomy used across both the HTTP control plane and the socket
/// dispatcher. Socket handlers mostly drop malformed or unauthorized traffic
/// silently (see `dispatcher.rs`) rather than surfacing this type to a peer;
/// HTTP handlers map it to a status code via `error_response`.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Translate a `RelayError` into the HTTP status + JSON body the control
/// plane returns for it.
pub fn error_response(err: &RelayError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        RelayError::AuthFailed => StatusCode::UNAUTHORIZED,
        RelayError::Forbidden => StatusCode::FORBIDDEN,
        RelayError::NotFound => StatusCode::NOT_FOUND,
        RelayError::Malformed(_) => StatusCode::BAD_REQUEST,
        RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        RelayError::Conflict(_) => StatusCode::CONFLICT,
        RelayError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failed_maps_to_401() {
        let (status, _) = error_response(&RelayError::AuthFailed);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn forbidden_maps_to_403() {
        let (status, _) = error_response(&RelayError::Forbidden);
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let (status, _) = error_response(&RelayError::RateLimited {
            retry_after_secs: 60,
        });
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }
}
