use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use crate::bus::EventBus;
use crate::error::{AppError, AppResult, ConflictKind};
use crate::events::{MapEvent, MapEventPayload};
use crate::models::{
    haversine_meters, CreatePoiRequest, LatLng, MapBounds, ParticipantInfo, Poi, PoiDto,
    UpdatePoiRequest, UserRole,
};
use crate::services::user::fallback_participant;
use crate::services::UserService;
use crate::store::membership::{JoinResult, LeaveOutcome, MembershipStore};
use crate::store::rate_limit::{RateLimitAction, RateLimiter};

const POI_COLUMNS: &str = "id, map_id, name, description, lat, lng, created_by, \
                           max_participants, image_url, thumbnail_url, created_at, updated_at";

/// Result of a successful join, for the HTTP/WS response to the caller. The
/// rest of the map learns about it through the published events.
#[derive(Debug, serde::Serialize)]
pub struct JoinedPoi {
    pub poi_id: Uuid,
    pub user_id: Uuid,
    pub current_count: i64,
}

#[derive(Debug, serde::Serialize)]
pub struct LeftPoi {
    pub poi_id: Uuid,
    pub user_id: Uuid,
    pub current_count: i64,
}

/// POI lifecycle and membership orchestration. Rows live in Postgres; the
/// member sets, the user->POI reverse index and the discussion timer live in
/// the membership store. Every mutation publishes its event only after the
/// store write has succeeded.
#[derive(Clone)]
pub struct PoiService {
    pool: PgPool,
    membership: MembershipStore,
    limiter: RateLimiter,
    bus: EventBus,
    users: UserService,
    proximity_meters: f64,
    default_max_participants: i32,
}

impl PoiService {
    pub fn new(
        pool: PgPool,
        membership: MembershipStore,
        limiter: RateLimiter,
        bus: EventBus,
        users: UserService,
        proximity_meters: f64,
        default_max_participants: i32,
    ) -> Self {
        Self {
            pool,
            membership,
            limiter,
            bus,
            users,
            proximity_meters,
            default_max_participants,
        }
    }

    pub fn membership(&self) -> &MembershipStore {
        &self.membership
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    pub async fn create(&self, req: CreatePoiRequest, created_by: Uuid) -> AppResult<PoiDto> {
        self.limiter
            .check(created_by, RateLimitAction::CreatePoi)
            .await?;
        req.validate()?;
        req.position.validate()?;

        let map_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM maps WHERE id = $1)")
            .bind(req.map_id)
            .fetch_one(&self.pool)
            .await?;
        if !map_exists {
            return Err(AppError::NotFound("Map not found".into()));
        }

        self.check_proximity(req.map_id, req.position).await?;
        self.users.ensure_guest(created_by).await?;

        let max_participants = req.max_participants.unwrap_or(self.default_max_participants);
        let poi = sqlx::query_as::<_, Poi>(&format!(
            "INSERT INTO pois (id, map_id, name, description, lat, lng, created_by,
                               max_participants, image_url, thumbnail_url)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {POI_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(req.map_id)
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.position.lat)
        .bind(req.position.lng)
        .bind(created_by)
        .bind(max_participants)
        .bind(&req.image_url)
        .bind(&req.thumbnail_url)
        .fetch_one(&self.pool)
        .await?;

        let dto = PoiDto::from_poi(poi, 0);
        self.bus
            .publish_map_event(&MapEvent::new(
                dto.map_id,
                MapEventPayload::PoiCreated { poi: dto.clone() },
            ))
            .await;

        tracing::info!(poi_id = %dto.id, map_id = %dto.map_id, "POI created");
        Ok(dto)
    }

    pub async fn get(&self, poi_id: Uuid) -> AppResult<PoiDto> {
        let poi = self.fetch(poi_id).await?;
        let count = self.membership.count(poi_id).await?;
        Ok(PoiDto::from_poi(poi, count))
    }

    /// POIs on a map, optionally clipped to a viewport, enriched with live
    /// participant counts in one batched read.
    pub async fn list(&self, map_id: Uuid, bounds: Option<MapBounds>) -> AppResult<Vec<PoiDto>> {
        let pois = sqlx::query_as::<_, Poi>(&format!(
            "SELECT {POI_COLUMNS} FROM pois WHERE map_id = $1 ORDER BY created_at ASC"
        ))
        .bind(map_id)
        .fetch_all(&self.pool)
        .await?;

        let pois: Vec<Poi> = match bounds {
            Some(bounds) => pois
                .into_iter()
                .filter(|poi| bounds.contains(poi.position()))
                .collect(),
            None => pois,
        };

        let ids: Vec<Uuid> = pois.iter().map(|poi| poi.id).collect();
        let counts = self.membership.counts_for(&ids).await?;

        Ok(pois
            .into_iter()
            .zip(counts)
            .map(|(poi, count)| PoiDto::from_poi(poi, count))
            .collect())
    }

    pub async fn update(
        &self,
        poi_id: Uuid,
        req: UpdatePoiRequest,
        requester: Uuid,
    ) -> AppResult<PoiDto> {
        self.limiter
            .check(requester, RateLimitAction::UpdatePoi)
            .await?;
        req.validate()?;

        let poi = self.fetch(poi_id).await?;
        self.authorize(&poi, requester).await?;

        let updated = sqlx::query_as::<_, Poi>(&format!(
            "UPDATE pois
             SET name             = COALESCE($1, name),
                 description      = COALESCE($2, description),
                 max_participants = COALESCE($3, max_participants),
                 image_url        = COALESCE($4, image_url),
                 thumbnail_url    = COALESCE($5, thumbnail_url),
                 updated_at       = NOW()
             WHERE id = $6
             RETURNING {POI_COLUMNS}"
        ))
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.max_participants)
        .bind(&req.image_url)
        .bind(&req.thumbnail_url)
        .bind(poi_id)
        .fetch_one(&self.pool)
        .await?;

        let count = self.membership.count(poi_id).await?;
        let dto = PoiDto::from_poi(updated, count);
        self.bus
            .publish_map_event(&MapEvent::new(
                dto.map_id,
                MapEventPayload::PoiUpdated { poi: dto.clone() },
            ))
            .await;
        Ok(dto)
    }

    /// Delete a POI. Current members are walked through the normal leave
    /// path first, so observers see the same `poi_left` / timer sequence a
    /// voluntary exodus would produce, then the row and the deletion event.
    pub async fn delete(&self, poi_id: Uuid, requester: Uuid) -> AppResult<()> {
        self.limiter
            .check(requester, RateLimitAction::DeletePoi)
            .await?;

        let poi = self.fetch(poi_id).await?;
        self.authorize(&poi, requester).await?;

        for user_id in self.membership.members(poi_id).await? {
            let outcome = self.membership.leave(poi_id, user_id, Utc::now()).await?;
            self.publish_left(&poi, user_id, &outcome).await;
        }
        self.membership.clear(poi_id).await?;

        sqlx::query("DELETE FROM pois WHERE id = $1")
            .bind(poi_id)
            .execute(&self.pool)
            .await?;

        self.bus
            .publish_map_event(&MapEvent::new(
                poi.map_id,
                MapEventPayload::PoiDeleted { poi_id },
            ))
            .await;

        tracing::info!(poi_id = %poi_id, map_id = %poi.map_id, "POI deleted");
        Ok(())
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Join a POI. The membership store enforces capacity and the single-POI
    /// rule in one atomic unit; this method owns the event choreography:
    /// `poi_left` for any prior POI strictly before `poi_joined` for the new
    /// one, and the discussion-timer transition last.
    pub async fn join(&self, poi_id: Uuid, user_id: Uuid) -> AppResult<JoinedPoi> {
        self.limiter.check(user_id, RateLimitAction::JoinPoi).await?;

        let poi = self.fetch(poi_id).await?;
        self.users.ensure_guest(user_id).await?;

        let now = Utc::now();
        let outcome = match self
            .membership
            .join(poi_id, user_id, poi.max_participants as i64, now)
            .await?
        {
            JoinResult::Full { .. } => {
                return Err(AppError::Conflict(
                    ConflictKind::Full,
                    "POI is at capacity".into(),
                ));
            }
            JoinResult::AlreadyMember { .. } => {
                return Err(AppError::Conflict(
                    ConflictKind::AlreadyMember,
                    "Already a member of this POI".into(),
                ));
            }
            JoinResult::Joined(outcome) => outcome,
        };

        // Announce the departure from the prior POI first; observers must
        // never see the user in two POIs.
        if let Some(prior_poi) = outcome.prior_poi {
            self.bus
                .publish_map_event(&MapEvent::new(
                    poi.map_id,
                    MapEventPayload::PoiLeft {
                        poi_id: prior_poi,
                        user_id,
                        current_count: outcome.prior_count.unwrap_or(0),
                    },
                ))
                .await;
            if let Some(accumulated_ms) = outcome.prior_timer_accumulated_ms {
                self.publish_timer(poi.map_id, prior_poi, false, None, accumulated_ms)
                    .await;
            }
        }

        // Self-describing join: the full enriched participant list plus the
        // newcomer singled out, so recipients render without extra lookups.
        let member_ids = self.membership.members(poi_id).await?;
        let mut infos = match self.users.infos_for(&member_ids).await {
            Ok(infos) => infos,
            Err(e) => {
                tracing::warn!(
                    poi_id = %poi_id,
                    error = ?e,
                    "Failed to enrich participant list; falling back to ids"
                );
                Default::default()
            }
        };
        let joining_user = match infos.get(&user_id) {
            Some(info) => info.clone(),
            None => self.users.participant_info(user_id).await,
        };
        let participants: Vec<ParticipantInfo> = member_ids
            .iter()
            .map(|id| infos.remove(id).unwrap_or_else(|| fallback_participant(*id)))
            .collect();

        self.bus
            .publish_map_event(&MapEvent::new(
                poi.map_id,
                MapEventPayload::PoiJoined {
                    poi_id,
                    user_id,
                    current_count: outcome.new_count,
                    participants,
                    joining_user,
                },
            ))
            .await;

        if let Some(started_at) = outcome.timer_started_at {
            self.publish_timer(
                poi.map_id,
                poi_id,
                true,
                Some(started_at),
                outcome.timer_accumulated_ms,
            )
            .await;
        }

        Ok(JoinedPoi {
            poi_id,
            user_id,
            current_count: outcome.new_count,
        })
    }

    /// Leave a POI. Leaving a POI you are not in is a no-op that reports the
    /// unchanged count and publishes nothing.
    pub async fn leave(&self, poi_id: Uuid, user_id: Uuid) -> AppResult<LeftPoi> {
        self.limiter
            .check(user_id, RateLimitAction::LeavePoi)
            .await?;

        let poi = self.fetch(poi_id).await?;
        let outcome = self.membership.leave(poi_id, user_id, Utc::now()).await?;
        if outcome.removed {
            self.publish_left(&poi, user_id, &outcome).await;
        }

        Ok(LeftPoi {
            poi_id,
            user_id,
            current_count: outcome.new_count,
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn fetch(&self, poi_id: Uuid) -> AppResult<Poi> {
        sqlx::query_as::<_, Poi>(&format!("SELECT {POI_COLUMNS} FROM pois WHERE id = $1"))
            .bind(poi_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("POI not found".into()))
    }

    /// The minimum-distance rule: a new POI closer than the threshold to any
    /// existing POI on the same map is a conflict. Exactly at the threshold
    /// is allowed.
    async fn check_proximity(&self, map_id: Uuid, position: LatLng) -> AppResult<()> {
        let existing: Vec<(f64, f64)> = sqlx::query_as(
            "SELECT lat, lng FROM pois WHERE map_id = $1",
        )
        .bind(map_id)
        .fetch_all(&self.pool)
        .await?;

        for (lat, lng) in existing {
            let distance = haversine_meters(position, LatLng::new(lat, lng));
            if distance < self.proximity_meters {
                return Err(AppError::Conflict(
                    ConflictKind::DuplicateLocation,
                    format!(
                        "Another POI is {:.0}m away; minimum distance is {:.0}m",
                        distance, self.proximity_meters
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Creator or a sufficiently senior role. Admins outrank users but not
    /// superadmins: a requester other than the creator needs a role above
    /// `user` and at least the creator's.
    async fn authorize(&self, poi: &Poi, requester: Uuid) -> AppResult<()> {
        if poi.created_by == requester {
            return Ok(());
        }
        let requester_role = self.users.get(requester).await?.role();
        if requester_role == UserRole::User {
            return Err(AppError::Forbidden(
                "Only the creator or an admin can modify this POI".into(),
            ));
        }
        let creator_role = match self.users.get(poi.created_by).await {
            Ok(creator) => creator.role(),
            Err(AppError::NotFound(_)) => UserRole::User,
            Err(e) => return Err(e),
        };
        if requester_role >= creator_role {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "Cannot modify a POI created by a more privileged user".into(),
            ))
        }
    }

    async fn publish_left(&self, poi: &Poi, user_id: Uuid, outcome: &LeaveOutcome) {
        self.bus
            .publish_map_event(&MapEvent::new(
                poi.map_id,
                MapEventPayload::PoiLeft {
                    poi_id: poi.id,
                    user_id,
                    current_count: outcome.new_count,
                },
            ))
            .await;
        if let Some(accumulated_ms) = outcome.timer_accumulated_ms {
            self.publish_timer(poi.map_id, poi.id, false, None, accumulated_ms)
                .await;
        }
    }

    async fn publish_timer(
        &self,
        map_id: Uuid,
        poi_id: Uuid,
        is_active: bool,
        started_at: Option<chrono::DateTime<Utc>>,
        accumulated_ms: i64,
    ) {
        self.bus
            .publish_map_event(&MapEvent::new(
                map_id,
                MapEventPayload::DiscussionTimerUpdate {
                    poi_id,
                    is_active,
                    started_at,
                    accumulated_ms,
                },
            ))
            .await;
    }
}
