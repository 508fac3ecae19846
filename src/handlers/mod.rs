pub mod pois;
pub mod sessions;
pub mod users;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::store;

/// GET /health — liveness of both backing stores.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ok = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = ?e, "Health check: database query failed");
            false
        }
    };

    let redis_ok = match store::health_check(&state.redis).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = ?e, "Health check: redis ping failed");
            false
        }
    };

    let healthy = db_ok && redis_ok;
    let http_status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "breakoutglobe-server",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "ok" } else { "unavailable" },
            "redis": if redis_ok { "ok" } else { "unavailable" },
        })),
    )
}
