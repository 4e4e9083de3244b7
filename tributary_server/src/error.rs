use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tributary_core::error as core_error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    /// Whether retrying the same request later may succeed.
    pub recoverable: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("missing x-user-id header")]
    MissingUserId,

    #[error("invalid x-user-id header: {0}")]
    InvalidUserId(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("{0}")]
    Core(#[from] tributary_core::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingUserId | ApiError::InvalidUserId(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(err) => match err {
                core_error::Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
                core_error::Error::NotFound(_) | core_error::Error::NotConnected(_) => {
                    StatusCode::NOT_FOUND
                }
                core_error::Error::Conflict(_)
                | core_error::Error::SyncInProgress(_)
                | core_error::Error::SyncPaused(_) => StatusCode::CONFLICT,
                core_error::Error::Unauthorized(_) | core_error::Error::WebhookSignature => {
                    StatusCode::UNAUTHORIZED
                }
                core_error::Error::TokenRefresh { .. } => StatusCode::FAILED_DEPENDENCY,
                core_error::Error::ProviderApi { .. } => StatusCode::BAD_GATEWAY,
                core_error::Error::ItemProcessing { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                core_error::Error::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
                core_error::Error::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                core_error::Error::Backend { .. } | core_error::Error::BackendMessage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn recoverable(&self) -> bool {
        match self {
            ApiError::Core(err) => err.is_recoverable(),
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            recoverable: self.recoverable(),
        };
        (code, Json(body)).into_response()
    }
}
