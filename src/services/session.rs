use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{AppError, AppResult};
use crate::events::{MapEvent, MapEventPayload};
use crate::models::{CreateSessionRequest, LatLng, Session};
use crate::services::UserService;
use crate::store::presence::PresenceStore;
use crate::store::rate_limit::{RateLimitAction, RateLimiter};

/// Session lifecycle: creation, avatar moves, heartbeats, teardown. The
/// presence store owns the authoritative TTL'd record; this service wraps it
/// with validation, rate limiting and event publication.
#[derive(Clone)]
pub struct SessionService {
    pool: PgPool,
    presence: PresenceStore,
    limiter: RateLimiter,
    bus: EventBus,
    users: UserService,
}

impl SessionService {
    pub fn new(
        pool: PgPool,
        presence: PresenceStore,
        limiter: RateLimiter,
        bus: EventBus,
        users: UserService,
    ) -> Self {
        Self {
            pool,
            presence,
            limiter,
            bus,
            users,
        }
    }

    pub async fn create(&self, req: CreateSessionRequest) -> AppResult<Session> {
        self.limiter
            .check(req.user_id, RateLimitAction::CreateSession)
            .await?;

        if let Some(position) = req.initial_position {
            position.validate()?;
        }

        let map_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM maps WHERE id = $1)")
            .bind(req.map_id)
            .fetch_one(&self.pool)
            .await?;
        if !map_exists {
            return Err(AppError::NotFound("Map not found".into()));
        }

        self.users.ensure_guest(req.user_id).await?;

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: req.user_id,
            map_id: req.map_id,
            position: req.initial_position.unwrap_or(LatLng::new(0.0, 0.0)),
            created_at: now,
            last_active: now,
        };
        self.presence.put(&session).await?;

        tracing::info!(
            session_id = %session.id,
            user_id = %session.user_id,
            map_id = %session.map_id,
            "Session created"
        );
        Ok(session)
    }

    /// Move the avatar: validates bounds, renews the TTL atomically with the
    /// position write, then announces the move to the rest of the map. The
    /// event is only published after the store mutation succeeded.
    pub async fn update_position(&self, session_id: Uuid, position: LatLng) -> AppResult<Session> {
        position.validate()?;

        let session = self.presence.get(session_id).await?;
        self.limiter
            .check(session.user_id, RateLimitAction::UpdateAvatar)
            .await?;

        self.presence.update_position(session_id, position).await?;

        self.bus
            .publish_map_event(&MapEvent::new(
                session.map_id,
                MapEventPayload::AvatarMoved {
                    session_id,
                    user_id: session.user_id,
                    position,
                },
            ))
            .await;

        Ok(Session {
            position,
            last_active: Utc::now(),
            ..session
        })
    }

    pub async fn heartbeat(&self, session_id: Uuid) -> AppResult<()> {
        self.presence.heartbeat(session_id).await
    }

    pub async fn get(&self, session_id: Uuid) -> AppResult<Session> {
        self.presence.get(session_id).await
    }

    pub async fn list_by_map(&self, map_id: Uuid) -> AppResult<Vec<Session>> {
        self.presence.list_by_map(map_id).await
    }

    /// Drop the presence record. Publishes nothing: `user_left` belongs to
    /// the hub's unregister path, which fires when the socket actually
    /// closes. Ending a session under a live socket just lets the peer
    /// observe the expiry.
    pub async fn end(&self, session_id: Uuid) -> AppResult<()> {
        self.presence.remove(session_id).await
    }
}
