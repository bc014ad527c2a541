use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::core::agent::AgentError;
use crate::core::encoder::EncodeError;
use crate::core::run::RunStatus;
use crate::core::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("run {0} not found")]
    NotFoundRun(String),
    #[error("invalid continuation: {0}")]
    InvalidContinuation(String),
    #[error("run {0} is already streaming")]
    ConflictingResume(String),
    #[error("illegal run transition {from} -> {to}")]
    IllegalTransition { from: RunStatus, to: RunStatus },
    #[error("agent failed: {0}")]
    Agent(#[from] AgentError),
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodeError),
    #[error("storage failed: {0}")]
    Storage(StoreError),
}

impl RelayError {
    /// Machine-readable code used both in HTTP error bodies and `error` chunks.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFoundRun(_) => "run_not_found",
            Self::InvalidContinuation(_) => "invalid_continuation",
            Self::ConflictingResume(_) => "conflicting_resume",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::Agent(_) => "agent_error",
            Self::Encoding(_) => "encoding_error",
            Self::Storage(_) => "storage_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFoundRun(_) => StatusCode::NOT_FOUND,
            Self::InvalidContinuation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ConflictingResume(_) | Self::IllegalTransition { .. } => StatusCode::CONFLICT,
            Self::Agent(_) | Self::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFoundRun(id),
            other => Self::Storage(other),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "code": self.code(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_run_not_found() {
        let err: RelayError = StoreError::NotFound("r1".into()).into();
        assert!(matches!(err, RelayError::NotFoundRun(ref id) if id == "r1"));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err: RelayError = StoreError::Unavailable("db locked".into()).into();
        assert_eq!(err.code(), "storage_error");
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn error_response_carries_code() {
        let resp = RelayError::ConflictingResume("r1".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"]["code"], "conflicting_resume");
        assert!(v["error"]["message"].as_str().unwrap().contains("r1"));
    }
}
