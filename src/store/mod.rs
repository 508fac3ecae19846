pub mod membership;
pub mod presence;
pub mod rate_limit;

use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::AppResult;

/// Open the Redis client used for pub/sub subscriptions. The same client
/// also seeds the multiplexed [`ConnectionManager`] used for commands.
pub fn create_client(redis_url: &str) -> AppResult<redis::Client> {
    Ok(redis::Client::open(redis_url)?)
}

/// Build the shared command connection. Reconnects transparently after
/// network blips; individual commands during an outage fail as `Transient`.
pub async fn create_connection(client: &redis::Client) -> AppResult<ConnectionManager> {
    info!("🔌 Connecting to Redis...");
    let conn = ConnectionManager::new(client.clone()).await?;
    info!("✅ Redis connection established");
    Ok(conn)
}

pub async fn health_check(conn: &ConnectionManager) -> AppResult<()> {
    let mut conn = conn.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}
