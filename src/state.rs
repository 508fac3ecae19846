use std::sync::Arc;

use sqlx::PgPool;

use crate::bus::EventBus;
use crate::config::Config;
use crate::services::{PoiService, SessionService, UserService};
use crate::store::membership::MembershipStore;
use crate::store::presence::PresenceStore;
use crate::store::rate_limit::RateLimiter;
use crate::websocket::ConnectionManager;

/// Shared application state passed to all handlers and extractors.
///
/// Everything here is cheaply cloneable (pools, `Arc`s, channel handles), so
/// cloning `AppState` per request is inexpensive.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    /// Owner of every live WebSocket.
    pub hub: ConnectionManager,
    pub bus: EventBus,
    pub presence: PresenceStore,
    pub membership: MembershipStore,
    pub sessions: SessionService,
    pub pois: PoiService,
    pub users: UserService,
    /// Shared Redis command connection, kept for health checks.
    pub redis: redis::aio::ConnectionManager,
}

impl AppState {
    /// Wire the stores and services together. Used by `main` and by the
    /// integration test harness.
    pub fn build(config: Config, pool: PgPool, redis: redis::aio::ConnectionManager) -> Self {
        let config = Arc::new(config);
        let presence = PresenceStore::new(redis.clone(), config.session_inactivity);
        let membership = MembershipStore::new(redis.clone());
        let limiter = RateLimiter::new(redis.clone(), config.rate_limits.clone());
        let bus = EventBus::new(redis.clone());
        let users = UserService::new(pool.clone(), limiter.clone());
        let sessions = SessionService::new(
            pool.clone(),
            presence.clone(),
            limiter.clone(),
            bus.clone(),
            users.clone(),
        );
        let pois = PoiService::new(
            pool.clone(),
            membership.clone(),
            limiter,
            bus.clone(),
            users.clone(),
            config.poi_proximity_meters,
            config.poi_default_max_participants,
        );

        AppState {
            pool,
            config,
            hub: ConnectionManager::new(),
            bus,
            presence,
            membership,
            sessions,
            pois,
            users,
            redis,
        }
    }
}
