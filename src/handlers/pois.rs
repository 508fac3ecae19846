use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::Principal,
    error::{AppError, AppResult},
    models::{CreatePoiRequest, MapBounds, PoiDto, UpdatePoiRequest},
    services::poi::{JoinedPoi, LeftPoi},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ListPoisParams {
    pub map_id: Uuid,
    pub min_lat: Option<f64>,
    pub max_lat: Option<f64>,
    pub min_lng: Option<f64>,
    pub max_lng: Option<f64>,
}

impl ListPoisParams {
    /// All four corners or none; a partial viewport is a client bug.
    fn bounds(&self) -> AppResult<Option<MapBounds>> {
        match (self.min_lat, self.max_lat, self.min_lng, self.max_lng) {
            (Some(min_lat), Some(max_lat), Some(min_lng), Some(max_lng)) => {
                Ok(Some(MapBounds {
                    min_lat,
                    max_lat,
                    min_lng,
                    max_lng,
                }))
            }
            (None, None, None, None) => Ok(None),
            _ => Err(AppError::Validation(
                "Bounds require all of min_lat, max_lat, min_lng, max_lng".into(),
            )),
        }
    }
}

/// GET /api/pois?map_id=...&min_lat=... — list POIs with live counts.
pub async fn list_pois(
    State(state): State<AppState>,
    Query(params): Query<ListPoisParams>,
) -> AppResult<Json<Vec<PoiDto>>> {
    let bounds = params.bounds()?;
    Ok(Json(state.pois.list(params.map_id, bounds).await?))
}

/// POST /api/pois
pub async fn create_poi(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<CreatePoiRequest>,
) -> AppResult<(StatusCode, Json<PoiDto>)> {
    let poi = state.pois.create(req, principal.user_id()).await?;
    Ok((StatusCode::CREATED, Json(poi)))
}

/// GET /api/pois/:id
pub async fn get_poi(
    State(state): State<AppState>,
    Path(poi_id): Path<Uuid>,
) -> AppResult<Json<PoiDto>> {
    Ok(Json(state.pois.get(poi_id).await?))
}

/// PUT /api/pois/:id — creator or admin only.
pub async fn update_poi(
    State(state): State<AppState>,
    principal: Principal,
    Path(poi_id): Path<Uuid>,
    Json(req): Json<UpdatePoiRequest>,
) -> AppResult<Json<PoiDto>> {
    let poi = state.pois.update(poi_id, req, principal.user_id()).await?;
    Ok(Json(poi))
}

/// DELETE /api/pois/:id — creator or admin only; members are auto-left.
pub async fn delete_poi(
    State(state): State<AppState>,
    principal: Principal,
    Path(poi_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.pois.delete(poi_id, principal.user_id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/pois/:id/join
pub async fn join_poi(
    State(state): State<AppState>,
    principal: Principal,
    Path(poi_id): Path<Uuid>,
) -> AppResult<Json<JoinedPoi>> {
    Ok(Json(state.pois.join(poi_id, principal.user_id()).await?))
}

/// POST /api/pois/:id/leave — a no-op (with the unchanged count) when the
/// caller is not a member.
pub async fn leave_poi(
    State(state): State<AppState>,
    principal: Principal,
    Path(poi_id): Path<Uuid>,
) -> AppResult<Json<LeftPoi>> {
    Ok(Json(state.pois.leave(poi_id, principal.user_id()).await?))
}
