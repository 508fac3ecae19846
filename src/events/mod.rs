use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{LatLng, ParticipantInfo, PoiDto};

// ============================================================================
// Channel naming
// ============================================================================

/// Map-scoped domain events: everyone on the map cares.
pub fn map_channel(map_id: Uuid) -> String {
    format!("map:{map_id}:events")
}

/// POI-scoped signaling: call offers must never reach users outside the POI.
pub fn signaling_channel(poi_id: Uuid) -> String {
    format!("poi:{poi_id}:signaling")
}

pub const MAP_CHANNEL_PATTERN: &str = "map:*:events";
pub const SIGNALING_CHANNEL_PATTERN: &str = "poi:*:signaling";

// ============================================================================
// Map events
// ============================================================================

/// Envelope for every event on a map channel. Events are self-describing:
/// join events carry the full participant list and count, so a consumer that
/// missed an intermediate event still converges on the next one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapEvent {
    pub map_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: MapEventPayload,
}

impl MapEvent {
    pub fn new(map_id: Uuid, payload: MapEventPayload) -> Self {
        Self {
            map_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MapEventPayload {
    AvatarMoved {
        session_id: Uuid,
        user_id: Uuid,
        position: LatLng,
    },
    PoiCreated {
        poi: PoiDto,
    },
    PoiUpdated {
        poi: PoiDto,
    },
    PoiDeleted {
        poi_id: Uuid,
    },
    PoiJoined {
        poi_id: Uuid,
        user_id: Uuid,
        current_count: i64,
        /// Everyone in the POI at publish time, enriched for rendering.
        participants: Vec<ParticipantInfo>,
        /// The newcomer, duplicated out of `participants` so recipients never
        /// have to correlate against a possibly-stale list to name the peer.
        joining_user: ParticipantInfo,
    },
    PoiLeft {
        poi_id: Uuid,
        user_id: Uuid,
        current_count: i64,
    },
    DiscussionTimerUpdate {
        poi_id: Uuid,
        is_active: bool,
        started_at: Option<DateTime<Utc>>,
        accumulated_ms: i64,
    },
}

impl MapEventPayload {
    /// Wire name, identical on the bus and in client messages.
    pub fn event_type(&self) -> &'static str {
        match self {
            MapEventPayload::AvatarMoved { .. } => "avatar_moved",
            MapEventPayload::PoiCreated { .. } => "poi_created",
            MapEventPayload::PoiUpdated { .. } => "poi_updated",
            MapEventPayload::PoiDeleted { .. } => "poi_deleted",
            MapEventPayload::PoiJoined { .. } => "poi_joined",
            MapEventPayload::PoiLeft { .. } => "poi_left",
            MapEventPayload::DiscussionTimerUpdate { .. } => "discussion_timer_update",
        }
    }
}

// ============================================================================
// Signaling events
// ============================================================================

/// A relayed WebRTC signal. SDP and ICE payloads are opaque to the server;
/// only the addressing is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingEvent {
    pub poi_id: Uuid,
    pub map_id: Uuid,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: SignalingPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalingPayload {
    PoiCallOffer { sdp: serde_json::Value },
    PoiCallAnswer { sdp: serde_json::Value },
    PoiCallIceCandidate { candidate: serde_json::Value },
}

impl SignalingPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            SignalingPayload::PoiCallOffer { .. } => "poi_call_offer",
            SignalingPayload::PoiCallAnswer { .. } => "poi_call_answer",
            SignalingPayload::PoiCallIceCandidate { .. } => "poi_call_ice_candidate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channels_are_scoped_by_id() {
        let id = Uuid::nil();
        assert_eq!(
            map_channel(id),
            "map:00000000-0000-0000-0000-000000000000:events"
        );
        assert_eq!(
            signaling_channel(id),
            "poi:00000000-0000-0000-0000-000000000000:signaling"
        );
    }

    #[test]
    fn map_event_serializes_with_snake_case_type_tag() {
        let event = MapEvent::new(
            Uuid::nil(),
            MapEventPayload::PoiLeft {
                poi_id: Uuid::nil(),
                user_id: Uuid::nil(),
                current_count: 3,
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "poi_left");
        assert_eq!(value["payload"]["current_count"], 3);
        assert!(value["map_id"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn poi_joined_event_is_self_describing() {
        let who = ParticipantInfo {
            user_id: Uuid::nil(),
            display_name: "Ada".into(),
            avatar_url: None,
        };
        let event = MapEvent::new(
            Uuid::nil(),
            MapEventPayload::PoiJoined {
                poi_id: Uuid::nil(),
                user_id: Uuid::nil(),
                current_count: 2,
                participants: vec![who.clone()],
                joining_user: who,
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "poi_joined");
        assert_eq!(value["payload"]["joining_user"]["display_name"], "Ada");
        assert_eq!(value["payload"]["participants"][0]["display_name"], "Ada");
    }

    #[test]
    fn map_event_round_trips() {
        let event = MapEvent::new(
            Uuid::new_v4(),
            MapEventPayload::AvatarMoved {
                session_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                position: LatLng::new(10.5, -20.25),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: MapEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.map_id, event.map_id);
        match back.payload {
            MapEventPayload::AvatarMoved { position, .. } => {
                assert_eq!(position, LatLng::new(10.5, -20.25));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn signaling_event_keeps_sdp_opaque() {
        let event = SignalingEvent {
            poi_id: Uuid::nil(),
            map_id: Uuid::nil(),
            from_user_id: Uuid::nil(),
            to_user_id: Uuid::nil(),
            timestamp: Utc::now(),
            payload: SignalingPayload::PoiCallOffer {
                sdp: json!({ "type": "offer", "sdp": "v=0\r\n..." }),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "poi_call_offer");
        assert_eq!(value["payload"]["sdp"]["type"], "offer");

        let back: SignalingEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.payload.event_type(), "poi_call_offer");
    }
}
