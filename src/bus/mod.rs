use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::events::{map_channel, signaling_channel, MapEvent, SignalingEvent};

/// Publish side of the cross-instance event fabric (Redis pub/sub).
///
/// Publishing is strictly best-effort: by the time an event is published the
/// originating write is already committed to the stores, so a publish failure
/// is logged and swallowed — the stores are the source of truth and clients
/// recover by re-reading.
#[derive(Clone)]
pub struct EventBus {
    conn: ConnectionManager,
}

impl EventBus {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn publish_map_event(&self, event: &MapEvent) {
        let channel = map_channel(event.map_id);
        match serde_json::to_string(event) {
            Ok(json) => self.publish(&channel, json).await,
            Err(e) => {
                tracing::error!(
                    channel = %channel,
                    error = ?e,
                    "Failed to serialize map event; this is a programming error"
                );
            }
        }
    }

    pub async fn publish_signaling(&self, event: &SignalingEvent) {
        let channel = signaling_channel(event.poi_id);
        match serde_json::to_string(event) {
            Ok(json) => self.publish(&channel, json).await,
            Err(e) => {
                tracing::error!(
                    channel = %channel,
                    error = ?e,
                    "Failed to serialize signaling event; this is a programming error"
                );
            }
        }
    }

    async fn publish(&self, channel: &str, payload: String) {
        let mut conn = self.conn.clone();
        let result: Result<i64, _> = conn.publish(channel, payload).await;
        if let Err(e) = result {
            tracing::warn!(
                channel = %channel,
                error = ?e,
                "Event publish failed; subscribers will converge on the next event"
            );
        }
    }
}
