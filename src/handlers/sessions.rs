use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{CreateSessionRequest, Session, UpdateAvatarRequest},
    state::AppState,
};

/// POST /api/sessions — create a session and its presence record.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> AppResult<(StatusCode, Json<Session>)> {
    let session = state.sessions.create(req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<Session>> {
    Ok(Json(state.sessions.get(session_id).await?))
}

/// PUT /api/sessions/:id/avatar — move the avatar; broadcasts to the map.
pub async fn update_avatar(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<UpdateAvatarRequest>,
) -> AppResult<Json<Session>> {
    let session = state
        .sessions
        .update_position(session_id, req.position)
        .await?;
    Ok(Json(session))
}

/// POST /api/sessions/:id/heartbeat — renew the presence TTL.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.sessions.heartbeat(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/sessions/:id — end the session. Publishes nothing; the hub's
/// unregister path announces the departure when the socket closes.
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.sessions.end(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/maps/:map_id/sessions — live presence on a map.
pub async fn list_map_sessions(
    State(state): State<AppState>,
    Path(map_id): Path<Uuid>,
) -> AppResult<Json<Vec<Session>>> {
    Ok(Json(state.sessions.list_by_map(map_id).await?))
}
