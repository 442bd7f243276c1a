use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::wire::{FeedId, RoomId};

// ─── Internal taxonomy ──────────────────────────────────────────────────────

/// Every failure kind the gateway can produce.
///
/// Transport kinds (`LinkUnavailable`, `Connection`, `Timeout`) recover on
/// their own through the link's reconnect loop — callers retry later.
/// Everything else is the caller's responsibility to retry or abandon.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("the control link to the SFU is unavailable")]
    LinkUnavailable,

    #[error("control channel failure: {0}")]
    Connection(String),

    #[error("the SFU did not answer within the request timeout")]
    Timeout,

    #[error("room {0} does not exist")]
    RoomNotFound(RoomId),

    #[error("no live handle for feed {0}")]
    HandleNotFound(FeedId),

    #[error("room {0} already exists")]
    DuplicateRoom(RoomId),

    #[error("feed {0} is already registered")]
    FeedCollision(FeedId),

    #[error("'{display}' is already publishing in room {room_id}")]
    AlreadyJoined { room_id: RoomId, display: String },

    #[error("join rejected by the SFU: {0}")]
    JoinFailed(String),

    #[error("configure rejected by the SFU: {0}")]
    ConfigureFailed(String),

    #[error("start rejected by the SFU: {0}")]
    StartFailed(String),

    #[error("invalid room secret")]
    Unauthorized,

    /// Raw SFU rejection, before the orchestrator maps it to an
    /// operation-specific kind.
    #[error("the SFU rejected the request: {reason} (code {code})")]
    Rejected { code: u16, reason: String },

    #[error("malformed SFU reply: {0}")]
    Protocol(String),
}

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured API error that serializes to JSON.
///
/// ```json
/// {
///   "error": {
///     "code": "handle_not_found",
///     "message": "no live handle for feed 99",
///     "status": 404
///   }
/// }
/// ```
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Log according to severity.
        if self.status.is_server_error() {
            tracing::error!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        } else if self.status.is_client_error() {
            tracing::warn!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

impl ApiError {
    /// 400 Bad Request with a custom message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            code: "bad_request",
            message: msg.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    /// 500 Internal Server Error with a custom message.
    #[allow(dead_code)]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: "internal_error",
            message: msg.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ─── GatewayError → ApiError ────────────────────────────────────────────────

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        let (code, status) = match err {
            GatewayError::LinkUnavailable => ("link_unavailable", StatusCode::SERVICE_UNAVAILABLE),
            GatewayError::Connection(_) => ("connection_error", StatusCode::BAD_GATEWAY),
            GatewayError::Timeout => ("request_timeout", StatusCode::GATEWAY_TIMEOUT),
            GatewayError::RoomNotFound(_) => ("room_not_found", StatusCode::NOT_FOUND),
            GatewayError::HandleNotFound(_) => ("handle_not_found", StatusCode::NOT_FOUND),
            GatewayError::DuplicateRoom(_) => ("duplicate_room", StatusCode::CONFLICT),
            GatewayError::FeedCollision(_) => ("feed_collision", StatusCode::CONFLICT),
            GatewayError::AlreadyJoined { .. } => ("already_joined", StatusCode::CONFLICT),
            GatewayError::JoinFailed(_) => ("join_failed", StatusCode::BAD_GATEWAY),
            GatewayError::ConfigureFailed(_) => ("configure_failed", StatusCode::BAD_GATEWAY),
            GatewayError::StartFailed(_) => ("start_failed", StatusCode::BAD_GATEWAY),
            GatewayError::Unauthorized => ("unauthorized", StatusCode::UNAUTHORIZED),
            GatewayError::Rejected { .. } => ("sfu_rejected", StatusCode::BAD_GATEWAY),
            GatewayError::Protocol(_) => ("internal_error", StatusCode::INTERNAL_SERVER_ERROR),
        };
        Self {
            code,
            message,
            status,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;

    /// Helper: convert an `ApiError` into its JSON body string.
    async fn body_string(err: ApiError) -> String {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let json = body_string(GatewayError::HandleNotFound(99).into()).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"]["code"], "handle_not_found");
        assert_eq!(value["error"]["message"], "no live handle for feed 99");
        assert_eq!(value["error"]["status"], 404);
    }

    #[tokio::test]
    async fn status_code_is_set() {
        let response = ApiError::from(GatewayError::Unauthorized).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn conflict_kinds_are_409() {
        for err in [
            GatewayError::DuplicateRoom(1001),
            GatewayError::FeedCollision(5),
            GatewayError::AlreadyJoined {
                room_id: 1001,
                display: "Alice".into(),
            },
        ] {
            let api = ApiError::from(err);
            assert_eq!(api.status, StatusCode::CONFLICT);
        }
    }

    #[tokio::test]
    async fn transport_kinds_map_to_5xx() {
        assert_eq!(
            ApiError::from(GatewayError::LinkUnavailable).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(GatewayError::Timeout).status,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from(GatewayError::Connection("reset".into())).status,
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn sfu_reason_is_surfaced_verbatim() {
        let json = body_string(GatewayError::ConfigureFailed("bad sdp".into()).into()).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["error"]["code"], "configure_failed");
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("bad sdp"));
    }
}
