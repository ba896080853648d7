//! Error taxonomy for the control plane.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::model::JobStatus;
use crate::payload::PayloadError;

#[derive(Debug, Error)]
pub enum PanelError {
    /// Missing or unknown agent identity.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Signature mismatch, stale timestamp or replayed nonce.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("no free run of {size} ports in pool {pool_id}")]
    PortsExhausted { pool_id: String, size: u32 },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("port {protocol}/{port} already allocated on node {node_id}")]
    PortConflict { node_id: String, protocol: String, port: u16 },

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type PanelResult<T> = Result<T, PanelError>;

impl PanelError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) | Self::SignatureInvalid(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_)
            | Self::InvalidTransition { .. }
            | Self::PortsExhausted { .. }
            | Self::PortConflict { .. } => StatusCode::CONFLICT,
            Self::BadRequest(_) | Self::InvalidRange(_) | Self::Payload(_) => StatusCode::BAD_REQUEST,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Authentication failures and internal faults get a fixed message so
        // nothing about secrets or storage reaches the caller.
        let message = match &self {
            Self::Unauthenticated(_) => "unauthenticated".to_string(),
            Self::SignatureInvalid(_) => "signature invalid".to_string(),
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<serde_json::Error> for PanelError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadRequest(format!("malformed JSON body: {}", e))
    }
}
