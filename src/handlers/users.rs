use axum::{extract::State, Json};

use crate::{
    auth::Principal,
    error::AppResult,
    models::{UpdateProfileRequest, User},
    state::AppState,
};

/// PUT /api/users/profile — update the caller's display name / avatar.
pub async fn update_profile(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<UpdateProfileRequest>,
) -> AppResult<Json<User>> {
    let user = state.users.update_profile(principal.user_id(), req).await?;
    Ok(Json(user))
}
