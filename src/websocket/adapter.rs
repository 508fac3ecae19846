use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use super::connection_manager::ConnectionManager;
use super::events::ServerMessage;
use crate::events::{
    MapEvent, MapEventPayload, SignalingEvent, MAP_CHANNEL_PATTERN, SIGNALING_CHANNEL_PATTERN,
};

/// Bridge from the bus to the hub: subscribes to every map and signaling
/// channel, translates each bus event into a client message and picks its
/// recipients. One subscriber task per instance; the loop resubscribes after
/// any connection failure.
pub fn spawn(client: redis::Client, hub: ConnectionManager) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match subscribe_and_pump(&client, &hub).await {
                Ok(()) => tracing::warn!("Event subscription stream ended; resubscribing"),
                Err(e) => tracing::warn!(error = ?e, "Event subscription failed; retrying"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

async fn subscribe_and_pump(
    client: &redis::Client,
    hub: &ConnectionManager,
) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(MAP_CHANNEL_PATTERN).await?;
    pubsub.psubscribe(SIGNALING_CHANNEL_PATTERN).await?;
    tracing::info!("📡 Subscribed to map and signaling channels");

    let mut stream = pubsub.into_on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_owned();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(channel = %channel, error = ?e, "Undecodable bus payload");
                continue;
            }
        };
        dispatch(hub, &channel, &payload).await;
    }
    Ok(())
}

async fn dispatch(hub: &ConnectionManager, channel: &str, payload: &str) {
    if channel.ends_with(":events") {
        match serde_json::from_str::<MapEvent>(payload) {
            Ok(event) => deliver_map_event(hub, &event).await,
            Err(e) => {
                tracing::debug!(channel = %channel, error = ?e, "Unparseable map event");
            }
        }
    } else if channel.ends_with(":signaling") {
        match serde_json::from_str::<SignalingEvent>(payload) {
            Ok(event) => deliver_signal(hub, &event).await,
            Err(e) => {
                tracing::debug!(channel = %channel, error = ?e, "Unparseable signaling event");
            }
        }
    } else {
        tracing::debug!(channel = %channel, "Message on unexpected channel");
    }
}

// ============================================================================
// Map events → map-wide broadcast
// ============================================================================

async fn deliver_map_event(hub: &ConnectionManager, event: &MapEvent) {
    let (msg, exclude_session) = map_event_message(event);
    hub.broadcast_to_map(event.map_id, &msg.to_json(), exclude_session)
        .await;
}

/// Every map event fans out to the whole map. Avatar moves exclude the
/// originating session — that client already rendered its own move.
fn map_event_message(event: &MapEvent) -> (ServerMessage, Option<Uuid>) {
    let exclude_session = match &event.payload {
        MapEventPayload::AvatarMoved { session_id, .. } => Some(*session_id),
        _ => None,
    };

    let tagged = serde_json::to_value(&event.payload).unwrap_or(Value::Null);
    let kind = tagged["type"].as_str().unwrap_or("unknown").to_owned();
    let mut data = match tagged.get("payload") {
        Some(Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    data.insert("map_id".to_owned(), json!(event.map_id));
    data.insert("timestamp".to_owned(), json!(event.timestamp));

    (ServerMessage::new(kind, Value::Object(data)), exclude_session)
}

// ============================================================================
// Signaling events → targeted delivery
// ============================================================================

async fn deliver_signal(hub: &ConnectionManager, event: &SignalingEvent) {
    let msg = signal_message(event);
    let delivered = hub
        .send_to_user_on_map(event.map_id, event.to_user_id, &msg.to_json())
        .await;
    if delivered == 0 {
        // The recipient is connected to another instance (its adapter will
        // deliver) or went offline; signals are never buffered.
        tracing::trace!(
            poi_id = %event.poi_id,
            to_user_id = %event.to_user_id,
            "No local connection for signal recipient"
        );
    }
}

fn signal_message(event: &SignalingEvent) -> ServerMessage {
    let tagged = serde_json::to_value(&event.payload).unwrap_or(Value::Null);
    let kind = tagged["type"].as_str().unwrap_or("unknown").to_owned();
    let mut data = match tagged.get("payload") {
        Some(Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    data.insert("poi_id".to_owned(), json!(event.poi_id));
    data.insert("map_id".to_owned(), json!(event.map_id));
    data.insert("from_user_id".to_owned(), json!(event.from_user_id));
    data.insert("timestamp".to_owned(), json!(event.timestamp));

    ServerMessage::new(kind, Value::Object(data))
}
