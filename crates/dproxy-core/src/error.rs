use http::StatusCode;
use serde_json::{Value, json};

/// A data-plane rejection. Carries the status to answer with and the
/// `{"error":{"message","type"}}` payload pieces.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProxyError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request_error",
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            kind: "forbidden",
            message: message.into(),
        }
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            kind: "payload_too_large",
            message: message.into(),
        }
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            kind: "upstream_error",
            message: message.into(),
        }
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            kind: "upstream_timeout",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal_error",
            message: message.into(),
        }
    }

    pub fn body_json(&self) -> Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.kind,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_shape() {
        let err = ProxyError::bad_request("invalid json");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            err.body_json(),
            json!({"error": {"message": "invalid json", "type": "invalid_request_error"}})
        );
    }
}
