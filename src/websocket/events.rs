use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::LatLng;

// ── Server-to-client message type strings ────────────────────────────────────

pub const MSG_WELCOME: &str = "welcome";
pub const MSG_INITIAL_USERS: &str = "initial_users";
pub const MSG_USER_JOINED: &str = "user_joined";
pub const MSG_USER_LEFT: &str = "user_left";
pub const MSG_ERROR: &str = "error";

/// Envelope for every server→client frame: `{ "type": ..., "data": ... }`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl ServerMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Targeted failure report (used for join/leave rejections; most other
    /// per-message failures are dropped silently).
    pub fn error(code: &str, message: &str, context: Value) -> Self {
        Self::new(
            MSG_ERROR,
            serde_json::json!({ "code": code, "message": message, "context": context }),
        )
    }

    pub fn to_json(&self) -> String {
        // Serialization of a ServerMessage cannot fail: the payload is
        // already a Value. The fallback keeps the signature infallible.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

/// Client→server frames. Unknown `type` values fail to parse here and are
/// logged-and-ignored by the handler; malformed JSON never reaches this type.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Heartbeat,
    AvatarMove {
        position: LatLng,
    },
    PoiJoin {
        poi_id: Uuid,
    },
    PoiLeave {
        poi_id: Uuid,
    },
    PoiCallOffer {
        poi_id: Uuid,
        to_user_id: Uuid,
        sdp: Value,
    },
    PoiCallAnswer {
        poi_id: Uuid,
        to_user_id: Uuid,
        sdp: Value,
    },
    PoiCallIceCandidate {
        poi_id: Uuid,
        to_user_id: Uuid,
        candidate: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heartbeat_parses_without_data() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Heartbeat));
    }

    #[test]
    fn avatar_move_parses_position() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"avatar_move","data":{"position":{"lat":51.5,"lng":-0.12}}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::AvatarMove { position } => {
                assert_eq!(position, LatLng::new(51.5, -0.12));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn call_offer_parses_addressing_and_keeps_sdp_opaque() {
        let poi = Uuid::new_v4();
        let to = Uuid::new_v4();
        let raw = json!({
            "type": "poi_call_offer",
            "data": { "poi_id": poi, "to_user_id": to, "sdp": {"type": "offer", "sdp": "v=0"} }
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::PoiCallOffer {
                poi_id,
                to_user_id,
                sdp,
            } => {
                assert_eq!(poi_id, poi);
                assert_eq!(to_user_id, to);
                assert_eq!(sdp["type"], "offer");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"time_travel","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn server_message_envelope_shape() {
        let msg = ServerMessage::new(MSG_WELCOME, json!({ "session_id": "abc" }));
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["data"]["session_id"], "abc");
    }

    #[test]
    fn error_message_carries_code_and_context() {
        let msg = ServerMessage::error("POI_FULL", "POI is at capacity", json!({"poi_id": "x"}));
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "POI_FULL");
        assert_eq!(value["data"]["context"]["poi_id"], "x");
    }
}
