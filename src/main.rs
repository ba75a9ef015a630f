use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use recast::codecs::Medium;
use recast::{Config, Engine, HostTransport, Jsep, SessionId};

// ─── LogHost ────────────────────────────────────────────────────────────────

/// Host transport for the standalone binary: no gateway is attached, so
/// media is dropped and client-bound events are surfaced in the log. Real
/// deployments embed the engine next to the gateway's transport instead.
struct LogHost;

impl HostTransport for LogHost {
    fn relay_rtp(&self, _session: SessionId, _medium: Medium, _buf: &[u8]) {}

    fn relay_rtcp(&self, _session: SessionId, _medium: Medium, _buf: &[u8]) {}

    fn push_event(
        &self,
        session: SessionId,
        transaction: Option<&str>,
        body: serde_json::Value,
        jsep: Option<Jsep>,
    ) {
        info!(
            session,
            transaction = transaction.unwrap_or("-"),
            has_sdp = jsep.is_some(),
            "client event: {body}"
        );
    }

    fn close_peer(&self, session: SessionId) {
        debug!(session, "close_peer requested (no transport attached)");
    }
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Load .env before anything else so RECAST_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level = std::env::var("RECAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = Config::from_env();
    let bind_addr = cfg.bind_addr.clone();

    let engine = Engine::new(cfg, Arc::new(LogHost))
        .await
        .expect("failed to initialize the engine");

    let app = Router::new()
        // Health (no auth required)
        .route("/health", get(recast::api::health))
        // Sessions + request surface
        .route("/v1/sessions", post(recast::api::create_session))
        .route("/v1/sessions/:session_id", delete(recast::api::destroy_session))
        .route(
            "/v1/sessions/:session_id/message",
            post(recast::api::session_message),
        )
        // Server-Sent Events (real-time lifecycle stream)
        .route("/v1/events", get(recast::sse::sse_events))
        .layer(CorsLayer::permissive())
        .with_state(engine.clone());

    info!("recast listening on http://{bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("invalid bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .expect("http server failed");

    engine.shutdown().await;
}
