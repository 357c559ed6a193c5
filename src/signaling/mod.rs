#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;
pub mod relay;

use crate::auth::{self, AuthError};
use crate::config::ServerConfig;
use crate::identity::IdentityPool;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use self::relay::ConnectionTable;
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Everything a connection or route handler can reach.
pub struct AppState {
    pub(crate) config: ServerConfig,
    pub(crate) registry: RoomRegistry,
    pub(crate) identities: IdentityPool,
    pub(crate) connections: ConnectionTable,
    pub(crate) metrics: ServerMetrics,
    pub(crate) db: Option<PgPool>,
    pub(crate) connection_semaphore: Arc<Semaphore>,
}

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    state: Arc<AppState>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(
        config: ServerConfig,
        registry: RoomRegistry,
        identities: IdentityPool,
        metrics: ServerMetrics,
        db: Option<PgPool>,
    ) -> Self {
        if config.jwt_secret.is_some() {
            info!("JWT authentication enabled");
        } else {
            warn!("JWT_SECRET not set, WebSocket connections will be rejected");
        }
        info!("Max connections: {}", config.max_connections);

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));
        Self {
            state: Arc::new(AppState {
                config,
                registry,
                identities,
                connections: ConnectionTable::new(),
                metrics,
                db,
                connection_semaphore,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.state.registry
    }

    pub fn identities(&self) -> &IdentityPool {
        &self.state.identities
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.state.connections
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.state.metrics
    }

    pub fn db_pool(&self) -> Option<&PgPool> {
        self.state.db.as_ref()
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .nest("/api", crate::api::router())
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.state.registry.room_count();
    let participants = server.state.registry.total_participant_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "participants": participants,
    }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Response {
    // Check bearer token if METRICS_TOKEN is configured
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {}", expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.state.registry.room_count();
    let participants = server.state.registry.total_participant_count().await;
    let body = server.state.metrics.render_prometheus(rooms, participants);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization")?.to_str().ok()?.strip_prefix("Bearer ")
}

/// WebSocket upgrade handler. Authentication happens before the upgrade so
/// a bad token costs an HTTP status, never a socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SignalingServer>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let Some(secret) = server.state.config.jwt_secret.as_deref() else {
        return AuthError::NotConfigured.into_response();
    };
    // Browsers cannot set headers on WebSocket requests; accept the token
    // as a query parameter too
    let token = bearer_token(&headers).or(query.token.as_deref());
    let Some(token) = token else {
        return AuthError::MissingToken.into_response();
    };
    let user = match auth::authenticate(token, secret, server.state.db.as_ref()).await {
        Ok(user) => user,
        Err(e) => {
            warn!("WebSocket authentication failed: {}", e);
            return e.into_response();
        }
    };

    // Acquire connection permit (non-blocking)
    let permit = match server.state.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let state = server.state.clone();
    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, user, state, permit))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> SignalingServer {
        let config = ServerConfig {
            port: 3000,
            jwt_secret: Some("test-secret".to_string()),
            room_count: 4,
            room_capacity: 25,
            meeting_id_pool: 50,
            max_connections: 100,
            ice_servers: Vec::new(),
            database_url: None,
        };
        let metrics = ServerMetrics::new();
        let registry = RoomRegistry::new(config.room_count, config.room_capacity, metrics.clone());
        SignalingServer::new(config, registry, IdentityPool::new(), metrics, None)
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_health_reports_room_and_participant_counts() {
        let server = test_server();
        let Json(body) = health_handler(State(server)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rooms"], 4);
        assert_eq!(body["participants"], 0);
    }
}
