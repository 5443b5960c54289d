use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chat_core::SyncError;
use tracing;

/// Failure of an API request, rendered as `{ "error": ... }`.
#[derive(Debug)]
pub enum ApiError {
    Sync(SyncError),
    NotFound(String),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Sync(SyncError::Unauthenticated) => StatusCode::UNAUTHORIZED,
            ApiError::Sync(SyncError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
            ApiError::Sync(SyncError::SendFailed(_)) | ApiError::Sync(SyncError::FetchFailed(_)) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Sync(SyncError::SubscriptionFailed(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Sync(SyncError::StorageFailed(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Sync(e) => e.to_string(),
            ApiError::NotFound(what) => format!("{} not found", what),
            ApiError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError::Sync(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed with {}: {:?}", status, self);
        }
        let body = Json(serde_json::json!({ "error": self.message() }));
        (status, body).into_response()
    }
}
