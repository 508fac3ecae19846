use std::collections::HashMap;

use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::models::{ParticipantInfo, UpdateProfileRequest, User};
use crate::store::rate_limit::{RateLimitAction, RateLimiter};

/// Read-mostly access to user records: enrichment lookups for events, guest
/// upserts so anonymous principals always resolve, and the one profile
/// mutation the core exposes.
#[derive(Clone)]
pub struct UserService {
    pool: PgPool,
    limiter: RateLimiter,
}

impl UserService {
    pub fn new(pool: PgPool, limiter: RateLimiter) -> Self {
        Self { pool, limiter }
    }

    /// Create a guest row for an unknown principal. Anonymous users mint
    /// their id client-side; the row exists so display-name enrichment and
    /// POI foreign keys always resolve.
    pub async fn ensure_guest(&self, user_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO users (id, display_name, account_type, role)
             VALUES ($1, $2, 'guest', 'user')
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(user_id)
        .bind(guest_display_name(user_id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, user_id: Uuid) -> AppResult<User> {
        sqlx::query_as::<_, User>(
            "SELECT id, display_name, avatar_url, account_type, role, created_at, updated_at
             FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))
    }

    /// Enrichment info for one user. Falls back to a placeholder rather than
    /// failing: the triggering operation has already succeeded and the event
    /// should still carry a renderable name.
    pub async fn participant_info(&self, user_id: Uuid) -> ParticipantInfo {
        match self.infos_for(&[user_id]).await {
            Ok(mut infos) => infos
                .remove(&user_id)
                .unwrap_or_else(|| fallback_participant(user_id)),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = ?e,
                    "Failed to fetch user for event enrichment; using placeholder"
                );
                fallback_participant(user_id)
            }
        }
    }

    /// Batch enrichment lookup. Missing users are simply absent from the map.
    pub async fn infos_for(&self, user_ids: &[Uuid]) -> AppResult<HashMap<Uuid, ParticipantInfo>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(Uuid, String, Option<String>)> = sqlx::query_as(
            "SELECT id, display_name, avatar_url FROM users WHERE id = ANY($1)",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, display_name, avatar_url)| {
                (
                    user_id,
                    ParticipantInfo {
                        user_id,
                        display_name,
                        avatar_url,
                    },
                )
            })
            .collect())
    }

    /// Update display name and/or avatar URL. Rate-limited per user.
    pub async fn update_profile(
        &self,
        user_id: Uuid,
        req: UpdateProfileRequest,
    ) -> AppResult<User> {
        self.limiter
            .check(user_id, RateLimitAction::UpdateProfile)
            .await?;
        req.validate()?;
        if req.display_name.is_none() && req.avatar_url.is_none() {
            return Err(AppError::Validation(
                "At least one field (display_name or avatar_url) must be provided".into(),
            ));
        }

        sqlx::query_as::<_, User>(
            "UPDATE users
             SET display_name = COALESCE($1, display_name),
                 avatar_url   = COALESCE($2, avatar_url),
                 updated_at   = NOW()
             WHERE id = $3
             RETURNING id, display_name, avatar_url, account_type, role, created_at, updated_at",
        )
        .bind(req.display_name)
        .bind(req.avatar_url)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))
    }
}

fn guest_display_name(user_id: Uuid) -> String {
    let short = user_id.simple().to_string();
    format!("Guest-{}", &short[..6])
}

/// Placeholder enrichment for a user whose row is missing: still renderable,
/// never blocks an event.
pub fn fallback_participant(user_id: Uuid) -> ParticipantInfo {
    ParticipantInfo {
        user_id,
        display_name: guest_display_name(user_id),
        avatar_url: None,
    }
}
