//! JSON response envelope shared by every API handler.

use axum::Json;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Wire envelope: `success` always present, exactly one of `message` or
/// `error` set.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                message: Some(message.into()),
                error: None,
            }),
        )
    }

    pub fn error(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: false,
                message: None,
                error: Some(error.into()),
            }),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_omits_error_field() {
        let (status, Json(body)) = ApiResponse::success("tunnel created");
        assert_eq!(status, StatusCode::OK);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "tunnel created");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn error_envelope_omits_message_field() {
        let (status, Json(body)) =
            ApiResponse::error(StatusCode::CONFLICT, "tunnel already exists: ssh");
        assert_eq!(status, StatusCode::CONFLICT);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "tunnel already exists: ssh");
        assert!(json.get("message").is_none());
    }
}
