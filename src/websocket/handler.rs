use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::{
    ClientMessage, ServerMessage, MSG_INITIAL_USERS, MSG_USER_JOINED, MSG_USER_LEFT, MSG_WELCOME,
};
use crate::{
    error::AppError,
    events::{SignalingEvent, SignalingPayload},
    models::Session,
    services::user::fallback_participant,
    state::AppState,
};

/// RFC 6455 close code sent when a client delivers unparseable JSON.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// How long the writer may keep draining its queue after the reader stops.
const WRITER_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

// ============================================================================
// Connection lifecycle
// ============================================================================

/// Per-connection protocol state. Transitions are one-directional and made
/// from the connection's own task only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
}

struct ConnectionLifecycle {
    session_id: Uuid,
    state: ConnectionState,
}

impl ConnectionLifecycle {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: ConnectionState::Connecting,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(self.state <= next, "connection state may only advance");
        tracing::trace!(
            session_id = %self.session_id,
            from = ?self.state,
            to = ?next,
            "Connection state transition"
        );
        self.state = next;
    }

    fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }
}

// ============================================================================
// Query params
// ============================================================================

/// The session id rides in the query string because WebSocket upgrades are
/// plain GET requests and cannot reliably carry custom headers from browsers.
#[derive(Debug, serde::Deserialize)]
pub struct WsParams {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
}

// ============================================================================
// Upgrade handler
// ============================================================================

/// GET /ws?sessionId=<id> — upgrade to a WebSocket connection.
///
/// The session is looked up before the upgrade is accepted; unknown or
/// expired sessions get a plain 401 without an upgrade attempt.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let session = match state.sessions.get(params.session_id).await {
        Ok(session) => session,
        Err(AppError::NotFound(_)) => {
            return (StatusCode::UNAUTHORIZED, "Unknown or expired session").into_response();
        }
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, session, state))
}

// ============================================================================
// Connection task
// ============================================================================

async fn handle_socket(socket: WebSocket, session: Session, state: AppState) {
    let mut lifecycle = ConnectionLifecycle::new(session.id);
    // The session lookup already succeeded in the upgrade handler.
    lifecycle.transition(ConnectionState::Authenticated);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Welcome sequence: `welcome` then `initial_users`, written on the raw
    // socket BEFORE hub registration. No broadcast can reach this connection
    // until it is registered, which makes the ordering structural.
    let welcome = ServerMessage::new(
        MSG_WELCOME,
        json!({
            "session_id": session.id,
            "user_id": session.user_id,
            "map_id": session.map_id,
            "heartbeat_interval_secs": state.config.heartbeat_interval.as_secs(),
        }),
    );
    if ws_sender
        .send(Message::Text(welcome.to_json()))
        .await
        .is_err()
    {
        return;
    }

    let initial_users = build_initial_users(&state, &session).await;
    if ws_sender
        .send(Message::Text(initial_users.to_json()))
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::channel::<String>(state.config.ws_write_queue_size);
    let generation = state
        .hub
        .add(session.id, session.user_id, session.map_id, tx)
        .await;
    lifecycle.transition(ConnectionState::Active);

    // Existing clients learn about the newcomer only after the welcome
    // sequence went out.
    announce_user_joined(&state, &session).await;

    // The reader sets a close frame here for the writer to send on exit.
    let close_frame: Arc<Mutex<Option<CloseFrame<'static>>>> = Arc::new(Mutex::new(None));

    // Writer task: drains the bounded queue onto the socket in enqueue order
    // and keeps the connection alive with periodic pings. Exits when the
    // queue closes (hub removal) or the socket dies, draining whatever is
    // already queued first.
    let ping_interval = state.config.heartbeat_interval;
    let writer_close_frame = close_frame.clone();
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ping.tick().await;

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(msg) => {
                        if ws_sender.send(Message::Text(msg)).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                }
            }
        }

        let frame = writer_close_frame.lock().ok().and_then(|mut slot| slot.take());
        let _ = ws_sender.send(Message::Close(frame)).await;
    });

    // Reader loop: parse inbound frames and dispatch to services. Any frame
    // (including pongs) counts as liveness; silence beyond the timeout
    // closes the connection.
    let idle_timeout = state.config.heartbeat_timeout;
    while lifecycle.is_active() {
        match tokio::time::timeout(idle_timeout, ws_receiver.next()).await {
            Err(_) => {
                tracing::debug!(
                    session_id = %session.id,
                    "No inbound traffic within the heartbeat timeout; closing"
                );
                lifecycle.transition(ConnectionState::Closing);
            }
            Ok(None) => lifecycle.transition(ConnectionState::Closing),
            Ok(Some(Err(e))) => {
                tracing::debug!(
                    session_id = %session.id,
                    error = ?e,
                    "WebSocket receive error; closing connection"
                );
                lifecycle.transition(ConnectionState::Closing);
            }
            Ok(Some(Ok(frame))) => match frame {
                Message::Text(text) => {
                    if let MessageOutcome::CloseProtocolError =
                        handle_client_message(&state, &session, &text).await
                    {
                        if let Ok(mut slot) = close_frame.lock() {
                            *slot = Some(CloseFrame {
                                code: CLOSE_PROTOCOL_ERROR,
                                reason: "malformed JSON".into(),
                            });
                        }
                        lifecycle.transition(ConnectionState::Closing);
                    }
                }
                Message::Close(_) => lifecycle.transition(ConnectionState::Closing),
                // Axum answers Ping frames itself; Pong frames only matter
                // as liveness, which the timeout wrapper already observed.
                _ => {}
            },
        }
    }

    // Teardown: unregister (which closes the queue and lets the writer
    // drain), then announce the departure unless a replacement connection
    // took over the session in the meantime.
    state.hub.remove(session.id, generation).await;
    if tokio::time::timeout(WRITER_DRAIN_DEADLINE, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    if !state.hub.is_connected(session.id).await {
        announce_user_left(&state, &session).await;
    }
}

// ============================================================================
// Inbound message handling
// ============================================================================

enum MessageOutcome {
    Continue,
    /// Unparseable JSON: the connection is closed with a protocol-error
    /// close code rather than left half-alive.
    CloseProtocolError,
}

async fn handle_client_message(
    state: &AppState,
    session: &Session,
    text: &str,
) -> MessageOutcome {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return MessageOutcome::CloseProtocolError,
    };

    let msg = match serde_json::from_value::<ClientMessage>(value.clone()) {
        Ok(msg) => msg,
        Err(_) => {
            // Valid JSON, unknown or malformed type: log and ignore.
            tracing::debug!(
                session_id = %session.id,
                msg_type = ?value.get("type"),
                "Ignoring unrecognized client message"
            );
            return MessageOutcome::Continue;
        }
    };

    match msg {
        ClientMessage::Heartbeat => {
            if let Err(e) = state.sessions.heartbeat(session.id).await {
                tracing::debug!(session_id = %session.id, error = ?e, "Heartbeat failed");
            }
        }
        ClientMessage::AvatarMove { position } => {
            // Per-message validation and rate-limit failures are dropped
            // silently; the client converges from authoritative state.
            if let Err(e) = state.sessions.update_position(session.id, position).await {
                tracing::debug!(session_id = %session.id, error = ?e, "Avatar move rejected");
            }
        }
        ClientMessage::PoiJoin { poi_id } => {
            if let Err(e) = state.pois.join(poi_id, session.user_id).await {
                send_targeted_error(state, session.id, "poi_join", poi_id, &e).await;
            }
        }
        ClientMessage::PoiLeave { poi_id } => {
            if let Err(e) = state.pois.leave(poi_id, session.user_id).await {
                send_targeted_error(state, session.id, "poi_leave", poi_id, &e).await;
            }
        }
        ClientMessage::PoiCallOffer {
            poi_id,
            to_user_id,
            sdp,
        } => {
            relay_signal(
                state,
                session,
                poi_id,
                to_user_id,
                SignalingPayload::PoiCallOffer { sdp },
            )
            .await;
        }
        ClientMessage::PoiCallAnswer {
            poi_id,
            to_user_id,
            sdp,
        } => {
            relay_signal(
                state,
                session,
                poi_id,
                to_user_id,
                SignalingPayload::PoiCallAnswer { sdp },
            )
            .await;
        }
        ClientMessage::PoiCallIceCandidate {
            poi_id,
            to_user_id,
            candidate,
        } => {
            relay_signal(
                state,
                session,
                poi_id,
                to_user_id,
                SignalingPayload::PoiCallIceCandidate { candidate },
            )
            .await;
        }
    }

    MessageOutcome::Continue
}

/// Join/leave rejections are reported back to the requesting client only.
async fn send_targeted_error(
    state: &AppState,
    session_id: Uuid,
    action: &str,
    poi_id: Uuid,
    error: &AppError,
) {
    let msg = ServerMessage::error(
        error.code(),
        &error.to_string(),
        json!({ "action": action, "poi_id": poi_id }),
    );
    state.hub.send_to_session(session_id, &msg.to_json()).await;
}

// ============================================================================
// Signaling relay
// ============================================================================

/// Relay a WebRTC signal between two members of the same POI.
///
/// Both the sender and the recipient must currently be members; anything
/// else is dropped without an error to the sender. This membership gate is
/// the boundary that keeps call traffic inside the POI.
async fn relay_signal(
    state: &AppState,
    session: &Session,
    poi_id: Uuid,
    to_user_id: Uuid,
    payload: SignalingPayload,
) {
    let sender_is_member = state
        .membership
        .is_member(poi_id, session.user_id)
        .await
        .unwrap_or(false);
    let recipient_is_member = state
        .membership
        .is_member(poi_id, to_user_id)
        .await
        .unwrap_or(false);

    if !sender_is_member || !recipient_is_member {
        tracing::debug!(
            poi_id = %poi_id,
            from_user_id = %session.user_id,
            to_user_id = %to_user_id,
            kind = payload.event_type(),
            "Dropping signal outside POI membership"
        );
        return;
    }

    let event = SignalingEvent {
        poi_id,
        map_id: session.map_id,
        from_user_id: session.user_id,
        to_user_id,
        timestamp: Utc::now(),
        payload,
    };
    state.bus.publish_signaling(&event).await;
}

// ============================================================================
// Presence announcements
// ============================================================================

/// The `initial_users` roster: every other live session on the map, enriched
/// with display info so the client can render avatars immediately.
async fn build_initial_users(state: &AppState, session: &Session) -> ServerMessage {
    let sessions = match state.sessions.list_by_map(session.map_id).await {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::warn!(
                map_id = %session.map_id,
                error = ?e,
                "Failed to list presence for initial_users; sending empty roster"
            );
            Vec::new()
        }
    };

    let others: Vec<&Session> = sessions.iter().filter(|s| s.id != session.id).collect();
    let user_ids: Vec<Uuid> = others.iter().map(|s| s.user_id).collect();
    let infos = state.users.infos_for(&user_ids).await.unwrap_or_default();

    let users: Vec<serde_json::Value> = others
        .iter()
        .map(|s| {
            let info = infos
                .get(&s.user_id)
                .cloned()
                .unwrap_or_else(|| fallback_participant(s.user_id));
            json!({
                "session_id": s.id,
                "user_id": s.user_id,
                "position": s.position,
                "display_name": info.display_name,
                "avatar_url": info.avatar_url,
            })
        })
        .collect();

    ServerMessage::new(MSG_INITIAL_USERS, json!({ "users": users }))
}

async fn announce_user_joined(state: &AppState, session: &Session) {
    let info = state.users.participant_info(session.user_id).await;
    let msg = ServerMessage::new(
        MSG_USER_JOINED,
        json!({
            "session_id": session.id,
            "user_id": session.user_id,
            "position": session.position,
            "display_name": info.display_name,
            "avatar_url": info.avatar_url,
        }),
    );
    state
        .hub
        .broadcast_to_map(session.map_id, &msg.to_json(), Some(session.id))
        .await;
}

async fn announce_user_left(state: &AppState, session: &Session) {
    let msg = ServerMessage::new(
        MSG_USER_LEFT,
        json!({ "session_id": session.id, "user_id": session.user_id }),
    );
    state
        .hub
        .broadcast_to_map(session.map_id, &msg.to_json(), Some(session.id))
        .await;
}
