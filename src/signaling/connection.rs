#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use crate::auth::AuthUser;
use crate::room::PendingParticipant;
use crate::signaling::AppState;
use crate::store;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_MEETING_ID_LEN: usize = 64;

/// Token bucket state. Refill is elapsed microseconds times the per-second
/// rate, kept in integer math to avoid float drift.
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = (self.tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            true
        } else {
            false
        }
    }
}

/// The gateway's view of one authenticated connection. Authoritative room
/// membership lives in the registry; this state gates transmit and relay
/// operations without a registry lookup.
struct Session {
    connection_id: String,
    user: AuthUser,
    current_room: Option<u8>,
    current_meeting_id: Option<String>,
    monitoring: HashSet<u8>,
}

impl Session {
    fn new(connection_id: String, user: AuthUser) -> Self {
        Self {
            connection_id,
            user,
            current_room: None,
            current_meeting_id: None,
            monitoring: HashSet::new(),
        }
    }
}

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(
    sender: &mpsc::Sender<Arc<String>>,
    msg: &ServerMessage,
) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection. The semaphore permit is held for
/// the connection's whole lifetime; dropping it is what frees the slot.
pub async fn handle_connection(
    socket: WebSocket,
    user: AuthUser,
    state: Arc<AppState>,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {} ({})", connection_id, user.name);

    state.metrics.inc_connections_total();
    let _conn_guard = state.metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    state.connections.register(&connection_id, tx.clone());

    // Clone for the send task
    let connection_id_clone = connection_id.clone();
    let send_metrics = state.metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", connection_id_clone);
    });

    let mut session = Session::new(connection_id.clone(), user);

    // Token bucket rate limiter state
    let mut limiter = RateLimiter::new();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                state.metrics.inc_messages_received();

                if !limiter.try_acquire() {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", connection_id);
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                        });
                    }
                    continue;
                }
                rate_limit_warned = false;

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let start = Instant::now();
                        let result = handle_client_message(client_msg, &mut session, &state, &tx).await;
                        state.metrics.observe_message_handling(start.elapsed());

                        if let Err(e) = result {
                            error!("Error handling message from {}: {}", connection_id, e);
                            state.metrics.inc_errors();
                            // If channel is closed, send task has exited — break
                            if tx.is_closed() {
                                break;
                            }
                            // Registry and gate errors carry client-facing text
                            let _ = send_json(&tx, &ServerMessage::Error {
                                message: e.to_string(),
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format: {}", e);
                        state.metrics.inc_errors();
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Invalid message format: {e}"),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", connection_id);
            }
        }
    }

    // Disconnect cleanup: drop monitor subscriptions, then vacate the room.
    // leave() reports whether this call removed the entry, keeping the
    // departure bookkeeping exactly-once when an explicit leave already ran.
    let monitored: Vec<u8> = session.monitoring.drain().collect();
    for room_number in monitored {
        state.registry.remove_monitor(room_number, &connection_id).await;
    }
    if let (Some(room_number), Some(meeting_id)) =
        (session.current_room.take(), session.current_meeting_id.take())
    {
        if state.registry.leave(room_number, &meeting_id).await {
            store::record_leave(state.db.as_ref(), &meeting_id).await;
        }
    }
    state.connections.deregister(&connection_id);

    // _conn_guard dropped here → dec_connections_active
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished: {}", connection_id);
}

/// Handle a single client message
async fn handle_client_message(
    message: ClientMessage,
    session: &mut Session,
    state: &AppState,
    sender: &mpsc::Sender<Arc<String>>,
) -> anyhow::Result<()> {
    match message {
        ClientMessage::JoinRoom { room_number, meeting_id } => {
            // A session already holding a room keeps its meeting ID, so a
            // second join is rejected by the registry's occupancy index
            // instead of silently moving the participant
            let meeting_id = session
                .current_meeting_id
                .clone()
                .or(meeting_id)
                .or_else(|| session.user.meeting_id.clone());
            let Some(meeting_id) = meeting_id else {
                anyhow::bail!("No meeting ID available");
            };
            if meeting_id.is_empty() || meeting_id.len() > MAX_MEETING_ID_LEN {
                anyhow::bail!("Invalid meeting ID: must be 1-{MAX_MEETING_ID_LEN} characters");
            }

            // The registry replies with the roster and announces the join
            // while it still holds the room lock
            let roster = state
                .registry
                .join(room_number, PendingParticipant {
                    user_id: session.user.id.clone(),
                    meeting_id: meeting_id.clone(),
                    name: session.user.name.clone(),
                    connection_id: session.connection_id.clone(),
                    sender: sender.clone(),
                })
                .await?;

            session.current_room = Some(room_number);
            session.current_meeting_id = Some(meeting_id.clone());

            if let Some(me) = roster.iter().find(|p| p.meeting_id == meeting_id) {
                store::record_join(state.db.as_ref(), room_number, &session.user.id, me).await;
            }
        }

        ClientMessage::LeaveRoom { room_number } => {
            // A session that never joined has nothing to leave
            let Some(meeting_id) = session.current_meeting_id.clone() else {
                return Ok(());
            };
            if state.registry.leave(room_number, &meeting_id).await {
                store::record_leave(state.db.as_ref(), &meeting_id).await;
            }
            if session.current_room == Some(room_number) {
                session.current_room = None;
                session.current_meeting_id = None;
            }
        }

        ClientMessage::PushToTalkStart { room_number } => {
            transmit(session, state, room_number, true).await?;
        }

        ClientMessage::PushToTalkEnd { room_number } => {
            transmit(session, state, room_number, false).await?;
        }

        ClientMessage::WebrtcOffer { target_connection_id, offer } => {
            let from_meeting_id = signal_source(session)?;
            forward(state, &target_connection_id, &ServerMessage::WebrtcOffer {
                from: session.connection_id.clone(),
                from_meeting_id,
                offer,
            });
        }

        ClientMessage::WebrtcAnswer { target_connection_id, answer } => {
            let from_meeting_id = signal_source(session)?;
            forward(state, &target_connection_id, &ServerMessage::WebrtcAnswer {
                from: session.connection_id.clone(),
                from_meeting_id,
                answer,
            });
        }

        ClientMessage::WebrtcIceCandidate { target_connection_id, candidate } => {
            let from_meeting_id = signal_source(session)?;
            forward(state, &target_connection_id, &ServerMessage::WebrtcIceCandidate {
                from: session.connection_id.clone(),
                from_meeting_id,
                candidate,
            });
        }

        ClientMessage::AdminMute { room_number, meeting_id, muted } => {
            require_admin(session)?;
            state
                .registry
                .set_muted(room_number, &meeting_id, muted, &session.user.name)
                .await?;
            store::record_muted(state.db.as_ref(), &meeting_id, muted).await;
            state.metrics.inc_admin_actions();
        }

        ClientMessage::AdminRemove { room_number, meeting_id } => {
            require_admin(session)?;
            if state
                .registry
                .remove(room_number, &meeting_id, &session.user.name)
                .await
            {
                store::record_leave(state.db.as_ref(), &meeting_id).await;
            }
            state.metrics.inc_admin_actions();
        }

        ClientMessage::AdminMonitor { room_number } => {
            require_admin(session)?;
            state
                .registry
                .add_monitor(room_number, &session.connection_id, sender.clone())
                .await?;
            session.monitoring.insert(room_number);
            state.metrics.inc_admin_actions();
            send_json(sender, &ServerMessage::MonitorStarted { room_number })?;
        }
    }

    Ok(())
}

/// Push-to-talk transitions only fan out for the room the session joined.
async fn transmit(
    session: &Session,
    state: &AppState,
    room_number: u8,
    speaking: bool,
) -> anyhow::Result<()> {
    if session.current_room != Some(room_number) {
        anyhow::bail!("Not in this room");
    }
    let Some(meeting_id) = session.current_meeting_id.as_deref() else {
        anyhow::bail!("Not in this room");
    };
    state
        .registry
        .broadcast_speaking(room_number, meeting_id, &session.user.name, speaking)
        .await;
    Ok(())
}

fn signal_source(session: &Session) -> anyhow::Result<String> {
    match session.current_meeting_id.clone() {
        Some(meeting_id) => Ok(meeting_id),
        None => anyhow::bail!("Not in a room"),
    }
}

/// Best-effort forward to a single connection. An unreachable target is the
/// WebRTC layer's problem to retry, not a session error.
fn forward(state: &AppState, target_connection_id: &str, message: &ServerMessage) {
    if state.connections.send_to(target_connection_id, message) {
        state.metrics.inc_signals_relayed();
    }
}

fn require_admin(session: &Session) -> anyhow::Result<()> {
    if !session.user.role.is_admin() {
        anyhow::bail!("Unauthorized");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::config::ServerConfig;
    use crate::identity::IdentityPool;
    use crate::metrics::ServerMetrics;
    use crate::room::RoomRegistry;
    use crate::signaling::relay::ConnectionTable;
    use serde_json::json;
    use tokio::sync::Semaphore;

    fn test_state() -> Arc<AppState> {
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
        Arc::new(AppState {
            registry: RoomRegistry::new(config.room_count, config.room_capacity, metrics.clone()),
            identities: IdentityPool::new(),
            connections: ConnectionTable::new(),
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            metrics,
            db: None,
            config,
        })
    }

    fn user(name: &str, role: Role, meeting_id: Option<&str>) -> AuthUser {
        AuthUser {
            id: format!("user-{name}"),
            name: name.to_string(),
            role,
            meeting_id: meeting_id.map(str::to_string),
        }
    }

    fn events(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    #[test]
    fn test_rate_limiter_allows_burst_then_denies() {
        let mut limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_rate_limiter_refills_over_time() {
        let mut limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            limiter.try_acquire();
        }
        assert!(!limiter.try_acquire());

        // Half a second at 100/s buys back ~50 tokens
        limiter.last_refill = Instant::now() - Duration::from_millis(500);
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_join_room_updates_session_and_replies() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut session =
            Session::new("conn-1".to_string(), user("Alice", Role::User, Some("SC-AAAA0001")));

        let message = ClientMessage::JoinRoom { room_number: 2, meeting_id: None };
        handle_client_message(message, &mut session, &state, &tx).await.unwrap();

        assert_eq!(session.current_room, Some(2));
        assert_eq!(session.current_meeting_id.as_deref(), Some("SC-AAAA0001"));

        let queued = events(&mut rx);
        assert_eq!(queued[0]["type"], "room-joined");
        assert_eq!(queued[0]["roomNumber"], 2);
    }

    #[tokio::test]
    async fn test_join_without_any_meeting_id_fails() {
        let state = test_state();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut session = Session::new("conn-1".to_string(), user("Alice", Role::User, None));

        let err = handle_client_message(
            ClientMessage::JoinRoom { room_number: 1, meeting_id: None },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "No meeting ID available");
        assert_eq!(session.current_room, None);
    }

    #[tokio::test]
    async fn test_second_join_keeps_original_room() {
        let state = test_state();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut session =
            Session::new("conn-1".to_string(), user("Alice", Role::User, Some("SC-AAAA0001")));

        handle_client_message(
            ClientMessage::JoinRoom { room_number: 1, meeting_id: None },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap();

        // The session's meeting ID wins over the client-provided one, so the
        // occupancy index rejects the hop
        let err = handle_client_message(
            ClientMessage::JoinRoom {
                room_number: 2,
                meeting_id: Some("SC-BBBB0002".to_string()),
            },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Meeting ID already active in another room");
        assert_eq!(session.current_room, Some(1));
        assert_eq!(state.registry.total_participant_count().await, 1);
    }

    #[tokio::test]
    async fn test_leave_room_without_membership_is_silent() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut session = Session::new("conn-1".to_string(), user("Alice", Role::User, None));

        handle_client_message(
            ClientMessage::LeaveRoom { room_number: 1 },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap();
        assert!(events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_explicit_leave_then_disconnect_departs_once() {
        let state = test_state();
        let (alice_tx, mut alice_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (bob_tx, _bob_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut alice =
            Session::new("conn-a".to_string(), user("Alice", Role::User, Some("SC-AAAA0001")));
        let mut bob =
            Session::new("conn-b".to_string(), user("Bob", Role::User, Some("SC-BBBB0002")));

        for (session, tx) in [(&mut alice, &alice_tx), (&mut bob, &bob_tx)] {
            handle_client_message(
                ClientMessage::JoinRoom { room_number: 3, meeting_id: None },
                session,
                &state,
                tx,
            )
            .await
            .unwrap();
        }
        let _ = events(&mut alice_rx);

        handle_client_message(
            ClientMessage::LeaveRoom { room_number: 3 },
            &mut bob,
            &state,
            &bob_tx,
        )
        .await
        .unwrap();

        // The explicit leave cleared the session, so disconnect cleanup has
        // no room to vacate; a stale retry reports nothing removed
        assert_eq!(bob.current_room, None);
        assert_eq!(bob.current_meeting_id, None);
        assert!(!state.registry.leave(3, "SC-BBBB0002").await);

        let departures: Vec<_> = events(&mut alice_rx)
            .into_iter()
            .filter(|e| e["type"] == "participant-left")
            .collect();
        assert_eq!(departures.len(), 1);
        assert_eq!(departures[0]["meetingId"], "SC-BBBB0002");
    }

    #[tokio::test]
    async fn test_push_to_talk_requires_membership_in_that_room() {
        let state = test_state();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut session =
            Session::new("conn-1".to_string(), user("Alice", Role::User, Some("SC-AAAA0001")));

        handle_client_message(
            ClientMessage::JoinRoom { room_number: 1, meeting_id: None },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap();

        let err = handle_client_message(
            ClientMessage::PushToTalkStart { room_number: 3 },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Not in this room");
    }

    #[tokio::test]
    async fn test_signal_relay_requires_a_room() {
        let state = test_state();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut session =
            Session::new("conn-1".to_string(), user("Alice", Role::User, Some("SC-AAAA0001")));

        let err = handle_client_message(
            ClientMessage::WebrtcOffer {
                target_connection_id: "conn-2".to_string(),
                offer: json!({"type": "offer", "sdp": "v=0"}),
            },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Not in a room");
    }

    #[tokio::test]
    async fn test_signal_relay_reaches_target_with_source_identity() {
        let state = test_state();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (target_tx, mut target_rx) = mpsc::channel(CHANNEL_CAPACITY);
        state.connections.register("conn-2", target_tx);

        let mut session =
            Session::new("conn-1".to_string(), user("Alice", Role::User, Some("SC-AAAA0001")));
        handle_client_message(
            ClientMessage::JoinRoom { room_number: 1, meeting_id: None },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap();

        handle_client_message(
            ClientMessage::WebrtcIceCandidate {
                target_connection_id: "conn-2".to_string(),
                candidate: json!({"candidate": "candidate:0 1 UDP 1 192.0.2.1 50000 typ host"}),
            },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap();

        let received = events(&mut target_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["type"], "webrtc-ice-candidate");
        assert_eq!(received[0]["from"], "conn-1");
        assert_eq!(received[0]["fromMeetingId"], "SC-AAAA0001");
    }

    #[tokio::test]
    async fn test_admin_operations_rejected_for_plain_users() {
        let state = test_state();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut session =
            Session::new("conn-1".to_string(), user("Alice", Role::User, Some("SC-AAAA0001")));

        let err = handle_client_message(
            ClientMessage::AdminMute {
                room_number: 1,
                meeting_id: "SC-BBBB0002".to_string(),
                muted: true,
            },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Unauthorized");
    }

    #[tokio::test]
    async fn test_admin_monitor_subscribes_and_confirms() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut session = Session::new("conn-admin".to_string(), user("Ops", Role::Admin, None));

        handle_client_message(
            ClientMessage::AdminMonitor { room_number: 1 },
            &mut session,
            &state,
            &tx,
        )
        .await
        .unwrap();
        assert!(session.monitoring.contains(&1));

        let queued = events(&mut rx);
        assert_eq!(queued[0]["type"], "monitor-started");
        assert_eq!(queued[0]["roomNumber"], 1);

        // Monitor now hears room traffic
        let (member_tx, _member_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut member =
            Session::new("conn-1".to_string(), user("Alice", Role::User, Some("SC-AAAA0001")));
        handle_client_message(
            ClientMessage::JoinRoom { room_number: 1, meeting_id: None },
            &mut member,
            &state,
            &member_tx,
        )
        .await
        .unwrap();

        let heard = events(&mut rx);
        assert!(heard.iter().any(|e| e["type"] == "participant-joined"));
    }
}
