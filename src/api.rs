use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::engine::{Engine, MessageResponse};
use crate::error::PluginError;
use crate::host::{Jsep, SessionId};

// ---------------------------------------------------------------------------
// Development HTTP front
// ---------------------------------------------------------------------------
//
// A thin transport for exercising the plugin without a gateway: sessions
// are created over REST and request messages are posted to them. Media
// callbacks (`setup_media`, RTP ingest) have no HTTP equivalent — they
// belong to the embedding gateway. Asynchronous outcomes surface on the
// SSE stream.

// ─── DTOs ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

#[derive(Deserialize)]
pub struct MessageRequest {
    /// Client-chosen correlation id echoed on asynchronous events.
    #[serde(default)]
    pub transaction: Option<String>,
    pub body: serde_json::Value,
    #[serde(default)]
    pub jsep: Option<Jsep>,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum MessageReply {
    Sync(serde_json::Value),
    Ack { transcode: &'static str },
}

// ─── POST /v1/sessions ──────────────────────────────────────────────────────

pub async fn create_session(
    State(engine): State<Arc<Engine>>,
) -> Json<CreateSessionResponse> {
    let session_id = engine.create_session();
    info!(session = session_id, "session created over HTTP");
    Json(CreateSessionResponse { session_id })
}

// ─── DELETE /v1/sessions/:session_id ────────────────────────────────────────

pub async fn destroy_session(
    State(engine): State<Arc<Engine>>,
    Path(session_id): Path<SessionId>,
) -> Json<serde_json::Value> {
    engine.destroy_session(session_id).await;
    Json(serde_json::json!({ "destroyed": session_id }))
}

// ─── POST /v1/sessions/:session_id/message ──────────────────────────────────

pub async fn session_message(
    State(engine): State<Arc<Engine>>,
    Path(session_id): Path<SessionId>,
    body: Result<Json<MessageRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<MessageReply>, PluginError> {
    use axum::extract::rejection::JsonRejection;

    let Json(request) = body.map_err(|rejection| match rejection {
        JsonRejection::JsonSyntaxError(e) => PluginError::invalid_json(e.to_string()),
        JsonRejection::JsonDataError(e) => PluginError::invalid_json(e.to_string()),
        _ => PluginError::no_message(),
    })?;
    let transaction = request
        .transaction
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let response = engine
        .handle_message(session_id, &transaction, request.body, request.jsep)
        .await?;

    Ok(Json(match response {
        MessageResponse::Sync(value) => MessageReply::Sync(value),
        MessageResponse::Ack => MessageReply::Ack {
            transcode: "pending",
        },
    }))
}

// ─── GET /health ────────────────────────────────────────────────────────────

pub async fn health(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "captures": engine.catalog.list().len(),
        "rtmp_enabled": engine.config.rtmp.is_some(),
    }))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_reply_shape() {
        let reply = MessageReply::Ack {
            transcode: "pending",
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json, serde_json::json!({"transcode": "pending"}));
    }

    #[test]
    fn message_request_parses_with_jsep() {
        let raw = serde_json::json!({
            "transaction": "t-1",
            "body": { "request": "start" },
            "jsep": { "type": "answer", "sdp": "v=0\r\n" },
        });
        let parsed: MessageRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.transaction.as_deref(), Some("t-1"));
        assert_eq!(parsed.jsep.unwrap().kind, "answer");
    }

    #[test]
    fn message_request_jsep_optional() {
        let raw = serde_json::json!({ "body": { "request": "list" } });
        let parsed: MessageRequest = serde_json::from_value(raw).unwrap();
        assert!(parsed.jsep.is_none());
        assert!(parsed.transaction.is_none());
    }
}
