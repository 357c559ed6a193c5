#![forbid(unsafe_code)]

// API module - HTTP routes for rooms, meeting IDs and WebRTC bootstrap

use crate::auth::{self, AuthError, AuthUser};
use crate::identity::IdentityError;
use crate::room::{RoomSnapshot, RoomStats};
use crate::signaling::SignalingServer;
use crate::store;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

pub fn router() -> Router<SignalingServer> {
    Router::new()
        .route("/rooms", get(list_rooms))
        .route("/rooms/stats", get(room_stats))
        .route("/rooms/{number}", get(get_room))
        .route("/meeting-ids/generate", post(generate_meeting_ids))
        .route("/meeting-ids/stats", get(identity_stats))
        .route("/meeting-ids/validate/{meeting_id}", get(validate_meeting_id))
        .route("/meeting-ids/assign", post(assign_meeting_id))
        .route("/meeting-ids/release/{meeting_id}", post(release_meeting_id))
        .route("/webrtc/ice-servers", get(ice_servers))
}

/// Validate the bearer token and resolve the caller.
async fn require_auth(server: &SignalingServer, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
    let secret = server.config().jwt_secret.as_deref().ok_or(AuthError::NotConfigured)?;
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;
    auth::authenticate(token, secret, server.db_pool()).await
}

async fn require_admin(server: &SignalingServer, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
    let user = require_auth(server, headers).await?;
    if !user.role.is_admin() {
        return Err(AuthError::Forbidden);
    }
    Ok(user)
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn list_rooms(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Result<Json<Vec<RoomSnapshot>>, AuthError> {
    require_auth(&server, &headers).await?;
    Ok(Json(server.registry().list().await))
}

async fn room_stats(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Result<Json<Vec<RoomStats>>, AuthError> {
    require_auth(&server, &headers).await?;
    Ok(Json(server.registry().stats().await))
}

async fn get_room(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
    Path(number): Path<u8>,
) -> Result<Response, AuthError> {
    require_auth(&server, &headers).await?;
    match server.registry().get(number).await {
        Some(snapshot) => Ok(Json(snapshot).into_response()),
        None => Ok(error_json(StatusCode::NOT_FOUND, "Room not found")),
    }
}

#[derive(Deserialize)]
struct GenerateRequest {
    count: Option<usize>,
}

/// Top up the identity pool. The pool only ever grows toward the target, so
/// repeated calls are safe.
async fn generate_meeting_ids(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
    body: Option<Json<GenerateRequest>>,
) -> Result<Json<serde_json::Value>, AuthError> {
    let admin = require_admin(&server, &headers).await?;
    let target = body
        .and_then(|Json(request)| request.count)
        .unwrap_or(server.config().meeting_id_pool);

    let (minted, total) = server.identities().provision(target);
    store::save_new_identities(server.db_pool(), &minted).await;
    info!("{} generated {} meeting IDs ({} total)", admin.name, minted.len(), total);

    Ok(Json(json!({ "generated": minted.len(), "total": total })))
}

async fn identity_stats(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Result<Response, AuthError> {
    require_admin(&server, &headers).await?;
    Ok(Json(server.identities().stats()).into_response())
}

/// Public endpoint: clients check an ID before attempting to register with it.
async fn validate_meeting_id(
    State(server): State<SignalingServer>,
    Path(meeting_id): Path<String>,
) -> Response {
    match server.identities().validate(&meeting_id) {
        Some(assigned) => Json(json!({
            "valid": true,
            "meetingId": meeting_id,
            "isAssigned": assigned,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "valid": false, "error": "Meeting ID not found" })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignRequest {
    #[serde(default)]
    meeting_id: Option<String>,
    user_id: String,
}

/// Bind a meeting ID to a user. Without an explicit ID the pool picks any
/// free one.
async fn assign_meeting_id(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
    Json(request): Json<AssignRequest>,
) -> Result<Response, AuthError> {
    require_admin(&server, &headers).await?;

    let assigned = match request.meeting_id {
        Some(meeting_id) => match server.identities().assign(&meeting_id, &request.user_id) {
            Ok(identity) => identity,
            Err(e @ IdentityError::NotFound) => {
                return Ok(error_json(StatusCode::NOT_FOUND, &e.to_string()));
            }
            Err(e @ IdentityError::AlreadyAssigned) => {
                return Ok(error_json(StatusCode::CONFLICT, &e.to_string()));
            }
        },
        None => match server.identities().assign_any(&request.user_id) {
            Some(identity) => identity,
            None => return Ok(error_json(StatusCode::CONFLICT, "No meeting IDs available")),
        },
    };

    server.metrics().inc_identities_assigned();
    store::save_identity(server.db_pool(), &assigned).await;
    info!("Meeting ID {} assigned to user {}", assigned.token, request.user_id);

    Ok(Json(json!({ "meetingId": assigned.token, "userId": request.user_id })).into_response())
}

/// Unbind a meeting ID and evict any live session still using it.
async fn release_meeting_id(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
    Path(meeting_id): Path<String>,
) -> Result<Response, AuthError> {
    require_admin(&server, &headers).await?;

    match server.identities().release(&meeting_id) {
        Ok(previous) => {
            let rooms_affected = server.registry().leave_everywhere(&meeting_id).await;
            if !rooms_affected.is_empty() {
                store::record_leave(server.db_pool(), &meeting_id).await;
            }
            store::release_identity(server.db_pool(), &meeting_id).await;
            info!(
                "Meeting ID {} released (was assigned: {}, rooms affected: {})",
                meeting_id,
                previous.is_some(),
                rooms_affected.len()
            );
            Ok(Json(json!({
                "meetingId": meeting_id,
                "released": true,
                "roomsAffected": rooms_affected,
            }))
            .into_response())
        }
        Err(e @ IdentityError::NotFound) => Ok(error_json(StatusCode::NOT_FOUND, &e.to_string())),
        Err(e) => Ok(error_json(StatusCode::CONFLICT, &e.to_string())),
    }
}

/// STUN/TURN bootstrap for the client's RTCPeerConnection.
async fn ice_servers(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AuthError> {
    require_auth(&server, &headers).await?;
    Ok(Json(json!({ "iceServers": server.config().ice_servers })))
}
