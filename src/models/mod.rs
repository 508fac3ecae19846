use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};

// ============================================================================
// Geography
// ============================================================================

/// A WGS84 coordinate pair. Serialized as `{ "lat": .., "lng": .. }` in every
/// API payload and event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Bounds check. The poles and the antimeridian are valid positions;
    /// anything beyond them is not.
    pub fn validate(&self) -> AppResult<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::Validation(format!(
                "latitude {} out of range [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::Validation(format!(
                "longitude {} out of range [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }
}

/// Rectangular viewport filter for POI listings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MapBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl MapBounds {
    pub fn contains(&self, point: LatLng) -> bool {
        point.lat >= self.min_lat
            && point.lat <= self.max_lat
            && point.lng >= self.min_lng
            && point.lng <= self.max_lng
    }
}

/// Great-circle distance in meters between two coordinates.
pub fn haversine_meters(a: LatLng, b: LatLng) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

// ============================================================================
// User models
// ============================================================================

/// Role precedence for POI authorization: user < admin < superadmin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UserRole {
    User,
    Admin,
    Superadmin,
}

impl UserRole {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "admin" => UserRole::Admin,
            "superadmin" => UserRole::Superadmin,
            _ => UserRole::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
            UserRole::Superadmin => "superadmin",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// "guest" or "full".
    pub account_type: String,
    /// "user", "admin" or "superadmin" (see [`UserRole`]).
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn role(&self) -> UserRole {
        UserRole::parse(&self.role)
    }
}

/// Enriched participant entry carried on join events and participant lists,
/// so clients can render a peer's name without a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 64, message = "display name must be 1-64 characters"))]
    pub display_name: Option<String>,
    #[validate(length(max = 500, message = "avatar URL too long"))]
    pub avatar_url: Option<String>,
}

// ============================================================================
// Map models
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Map {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Session models (presence records — authoritative copy lives in Redis)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub map_id: Uuid,
    pub position: LatLng,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: Uuid,
    pub map_id: Uuid,
    pub initial_position: Option<LatLng>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAvatarRequest {
    pub position: LatLng,
}

// ============================================================================
// POI models
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Poi {
    pub id: Uuid,
    pub map_id: Uuid,
    pub name: String,
    pub description: String,
    pub lat: f64,
    pub lng: f64,
    pub created_by: Uuid,
    pub max_participants: i32,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Poi {
    pub fn position(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }
}

/// POI as exposed over the API and in events: nested position plus the live
/// participant count from the membership store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoiDto {
    pub id: Uuid,
    pub map_id: Uuid,
    pub name: String,
    pub description: String,
    pub position: LatLng,
    pub created_by: Uuid,
    pub max_participants: i32,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub participant_count: i64,
    pub created_at: DateTime<Utc>,
}

impl PoiDto {
    pub fn from_poi(poi: Poi, participant_count: i64) -> Self {
        PoiDto {
            id: poi.id,
            map_id: poi.map_id,
            name: poi.name,
            description: poi.description,
            position: LatLng::new(poi.lat, poi.lng),
            created_by: poi.created_by,
            max_participants: poi.max_participants,
            image_url: poi.image_url,
            thumbnail_url: poi.thumbnail_url,
            participant_count,
            created_at: poi.created_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePoiRequest {
    pub map_id: Uuid,
    #[validate(length(min = 1, max = 120, message = "name must be 1-120 characters"))]
    pub name: String,
    #[validate(length(max = 2000, message = "description too long"))]
    #[serde(default)]
    pub description: String,
    pub position: LatLng,
    #[validate(range(min = 1, max = 50, message = "max_participants must be 1-50"))]
    pub max_participants: Option<i32>,
    #[validate(length(max = 500, message = "image URL too long"))]
    pub image_url: Option<String>,
    #[validate(length(max = 500, message = "thumbnail URL too long"))]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdatePoiRequest {
    #[validate(length(min = 1, max = 120, message = "name must be 1-120 characters"))]
    pub name: Option<String>,
    #[validate(length(max = 2000, message = "description too long"))]
    pub description: Option<String>,
    #[validate(range(min = 1, max = 50, message = "max_participants must be 1-50"))]
    pub max_participants: Option<i32>,
    #[validate(length(max = 500, message = "image URL too long"))]
    pub image_url: Option<String>,
    #[validate(length(max = 500, message = "thumbnail URL too long"))]
    pub thumbnail_url: Option<String>,
}
