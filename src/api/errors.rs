//! API Error Handling
//!
//! Structured error responses with HTTP status codes and request tracking.
//! Engine errors keep their stable code; their severity picks the status.

use crate::errors::{EngineError, ProtocolError, RoundError, Severity};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

/// Error body with structured information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code (CARD_NOT_FOUND, REVEAL_TOO_EARLY, BAD_REQUEST, ...)
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    BadRequest(String),
    Engine(EngineError),
}

impl ApiError {
    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    pub fn engine(request_id: String, error: EngineError) -> Self {
        Self {
            kind: ApiErrorKind::Engine(error),
            request_id,
        }
    }

    pub fn status(&self) -> StatusCode {
        match &self.kind {
            ApiErrorKind::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiErrorKind::Engine(e) => engine_status(e),
        }
    }
}

fn engine_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Round(RoundError::NoCurrentRound | RoundError::CardNotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Round(RoundError::InvalidCard(_)) | EngineError::Protocol(ProtocolError::InvalidRange { .. }) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::Protocol(ProtocolError::NoCommit { .. }) => StatusCode::NOT_FOUND,
        EngineError::Protocol(ProtocolError::EntropyUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        _ => match e.severity() {
            Severity::Retryable | Severity::Rejected => StatusCode::CONFLICT,
            Severity::Structural | Severity::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn engine_details(e: &EngineError) -> Option<serde_json::Value> {
    let severity = match e.severity() {
        Severity::Retryable => "retryable",
        Severity::Rejected => "rejected",
        Severity::Structural => "structural",
        Severity::Fatal => "fatal",
    };
    let mut details = serde_json::json!({ "severity": severity });
    if let EngineError::Protocol(ProtocolError::RevealTooEarly { remaining_ms, .. }) = e {
        details["retry_after_ms"] = serde_json::json!(remaining_ms);
    }
    Some(details)
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::BadRequest(msg) => write!(f, "[{}] Bad Request: {}", self.request_id, msg),
            ApiErrorKind::Engine(e) => write!(f, "[{}] {}: {}", self.request_id, e.code(), e),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message, details) = match &self.kind {
            ApiErrorKind::BadRequest(msg) => ("BAD_REQUEST", msg.clone(), None),
            ApiErrorKind::Engine(e) => {
                if e.is_alerting() {
                    tracing::error!(request_id = %self.request_id, code = e.code(), error = %e, "Structural engine error");
                }
                (e.code(), e.to_string(), engine_details(e))
            }
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id.clone(),
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::game::Phase;

    #[test]
    fn test_engine_errors_map_to_status() {
        let cases: Vec<(EngineError, StatusCode)> = vec![
            (RoundError::NoCurrentRound.into(), StatusCode::NOT_FOUND),
            (RoundError::InvalidCard("x".into()).into(), StatusCode::BAD_REQUEST),
            (
                RoundError::InvalidPhaseTransition { operation: "call_next", phase: Phase::Setup }.into(),
                StatusCode::CONFLICT,
            ),
            (ProtocolError::RevealTooEarly { round_id: 1, remaining_ms: 5 }.into(), StatusCode::CONFLICT),
            (
                StorageError::Conflict { entity: "round:1".into(), expected: 1, actual: 2 }.into(),
                StatusCode::CONFLICT,
            ),
            (RoundError::AlreadyCalled { round_id: 1, symbol: 3 }.into(), StatusCode::INTERNAL_SERVER_ERROR),
            (ProtocolError::EntropyUnavailable("gone".into()).into(), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::engine("r".into(), error).status(), status);
        }
    }

    #[test]
    fn test_retry_hint_in_details() {
        let err: EngineError = ProtocolError::RevealTooEarly { round_id: 1, remaining_ms: 40 }.into();
        let details = engine_details(&err).unwrap();
        assert_eq!(details["severity"], "retryable");
        assert_eq!(details["retry_after_ms"], 40);
    }
}
