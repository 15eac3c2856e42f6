//! HTTP surface: the admission guard in front of gated resources, the presence API used by the
//! wait page and the heartbeat client, and health.

mod cookies;
mod guard;
mod rate_limit;
mod routes;
mod server;

pub use cookies::{TOKEN_COOKIE, read_token, token_cookie};
pub use guard::{Admitted, admission_guard};
pub use rate_limit::{Decision, RateLimiter};
pub use routes::routes;
pub use server::serve;

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::admission::{Admission, AdmissionError};
use crate::clock::Clock;
use crate::model::ValidationError;
use crate::observability;

/// Shared by every handler and by the guard.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<Admission>,
    pub clock: Arc<dyn Clock>,
    pub cookie_secure: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(ValidationError::MissingToken) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Admission(AdmissionError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "admission store failure");
            metrics::counter!(observability::STORE_ERRORS_TOTAL).increment(1);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn error_status_codes() {
        assert_eq!(
            ApiError::from(ValidationError::MissingToken).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(ValidationError::MalformedToken).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ValidationError::InvalidResourceId).status(),
            StatusCode::BAD_REQUEST
        );
        let down = AdmissionError::Store(StoreError::Unavailable("down".into()));
        assert_eq!(
            ApiError::from(down).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
