use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

// ─── PluginError ────────────────────────────────────────────────────────────

/// Structured request-surface error carrying the plugin's numeric code.
///
/// Serialized to clients as the standard event envelope:
///
/// ```json
/// {
///   "transcode": "event",
///   "error_code": 416,
///   "error": "No capture with id 42"
/// }
/// ```
#[derive(Debug, Clone)]
pub struct PluginError {
    pub code: u16,
    pub message: String,
}

impl PluginError {
    /// 411 — the request carried no message body.
    pub fn no_message() -> Self {
        Self {
            code: 411,
            message: "No message".into(),
        }
    }

    /// 412 — the message body is not a JSON object.
    pub fn invalid_json(msg: impl Into<String>) -> Self {
        Self {
            code: 412,
            message: msg.into(),
        }
    }

    /// 413 — the `request` verb is not recognized.
    pub fn invalid_request(verb: &str) -> Self {
        Self {
            code: 413,
            message: format!("Unknown request '{verb}'"),
        }
    }

    /// 414 — a field is present but malformed.
    pub fn invalid_element(msg: impl Into<String>) -> Self {
        Self {
            code: 414,
            message: msg.into(),
        }
    }

    /// 415 — a required field is absent.
    pub fn missing_element(field: &str) -> Self {
        Self {
            code: 415,
            message: format!("Missing element ({field})"),
        }
    }

    /// 416 — no capture entry with the requested id.
    pub fn not_found(id: u64) -> Self {
        Self {
            code: 416,
            message: format!("No capture with id {id}"),
        }
    }

    /// 417 — the capture exists but cannot be replayed (unreadable or
    /// incomplete MJR data).
    pub fn invalid_capture(msg: impl Into<String>) -> Self {
        Self {
            code: 417,
            message: msg.into(),
        }
    }

    /// 418 — the verb is not valid in the session's current state.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self {
            code: 418,
            message: msg.into(),
        }
    }

    /// 419 — the attached SDP is missing pieces or unparseable.
    pub fn invalid_sdp(msg: impl Into<String>) -> Self {
        Self {
            code: 419,
            message: msg.into(),
        }
    }

    /// 420 — a capture with the proposed id already exists.
    pub fn already_exists(id: u64) -> Self {
        Self {
            code: 420,
            message: format!("Capture {id} already exists"),
        }
    }

    /// 499 — anything without a more precise code.
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self {
            code: 499,
            message: msg.into(),
        }
    }

    /// The client-facing JSON envelope.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "transcode": "event",
            "error_code": self.code,
            "error": self.message,
        })
    }

    /// HTTP status used by the development front. Protocol errors map to
    /// client errors; 499 is the only server-side bucket.
    fn http_status(&self) -> StatusCode {
        match self.code {
            411 | 412 | 413 | 414 | 415 | 419 => StatusCode::BAD_REQUEST,
            416 => StatusCode::NOT_FOUND,
            417 | 418 | 420 => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for PluginError {}

// ─── IntoResponse ───────────────────────────────────────────────────────────

impl IntoResponse for PluginError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() {
            tracing::error!(code = self.code, "{}", self.message);
        } else {
            tracing::warn!(code = self.code, "{}", self.message);
        }
        (status, Json(self.envelope())).into_response()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let env = PluginError::not_found(42).envelope();
        assert_eq!(env["transcode"], "event");
        assert_eq!(env["error_code"], 416);
        assert_eq!(env["error"], "No capture with id 42");
    }

    #[test]
    fn missing_element_message() {
        let err = PluginError::missing_element("id");
        assert_eq!(err.code, 415);
        assert!(err.message.contains("id"));
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            PluginError::invalid_json("x").http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(PluginError::not_found(1).http_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            PluginError::already_exists(1).http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PluginError::unknown("x").http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn response_body_is_envelope() {
        use axum::body::to_bytes;

        let response = PluginError::already_exists(7).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error_code"], 420);
        assert!(value["error"].as_str().unwrap().contains('7'));
    }
}
