use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{LatLng, Session};

/// Authoritative presence: per-session Redis hash with a TTL equal to the
/// inactivity window, plus a per-map index set for O(active sessions)
/// enumeration. The hash is the primary record; the index is pruned lazily
/// when a listed session's hash has expired.
#[derive(Clone)]
pub struct PresenceStore {
    conn: ConnectionManager,
    ttl: Duration,
    touch_script: Script,
}

fn session_key(session_id: Uuid) -> String {
    format!("presence:session:{session_id}")
}

fn map_key(map_id: Uuid) -> String {
    format!("presence:map:{map_id}")
}

// Renew the TTL and apply the field updates in one atomic unit, but only if
// the record still exists — a touch must never resurrect an expired session.
//
// KEYS[1] session hash; ARGV[1] ttl_ms, ARGV[2] last_active, then optional
// ARGV[3] lat, ARGV[4] lng.
const TOUCH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'last_active', ARGV[2])
if ARGV[3] then
  redis.call('HSET', KEYS[1], 'lat', ARGV[3], 'lng', ARGV[4])
end
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return 1
"#;

impl PresenceStore {
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self {
            conn,
            ttl,
            touch_script: Script::new(TOUCH_SCRIPT),
        }
    }

    /// Record a session with a fresh TTL and index it under its map.
    pub async fn put(&self, session: &Session) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let key = session_key(session.id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                &key,
                &[
                    ("user_id", session.user_id.to_string()),
                    ("map_id", session.map_id.to_string()),
                    ("lat", session.position.lat.to_string()),
                    ("lng", session.position.lng.to_string()),
                    ("created_at", session.created_at.to_rfc3339()),
                    ("last_active", session.last_active.to_rfc3339()),
                ],
            )
            .ignore()
            .pexpire(&key, self.ttl.as_millis() as i64)
            .ignore()
            .sadd(map_key(session.map_id), session.id.to_string())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Renew the TTL and advance `last_active`. `NotFound` if expired/absent.
    pub async fn heartbeat(&self, session_id: Uuid) -> AppResult<()> {
        self.touch(session_id, None).await
    }

    /// Update the avatar position, renewing the TTL in the same atomic unit.
    pub async fn update_position(&self, session_id: Uuid, position: LatLng) -> AppResult<()> {
        self.touch(session_id, Some(position)).await
    }

    async fn touch(&self, session_id: Uuid, position: Option<LatLng>) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.touch_script.key(session_key(session_id));
        invocation
            .arg(self.ttl.as_millis() as i64)
            .arg(Utc::now().to_rfc3339());
        if let Some(pos) = position {
            invocation.arg(pos.lat.to_string()).arg(pos.lng.to_string());
        }
        let updated: i64 = invocation.invoke_async(&mut conn).await?;
        if updated == 0 {
            return Err(AppError::NotFound("Session not found".into()));
        }
        Ok(())
    }

    pub async fn get(&self, session_id: Uuid) -> AppResult<Session> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(session_key(session_id)).await?;
        parse_session(session_id, &fields)
            .ok_or_else(|| AppError::NotFound("Session not found".into()))
    }

    /// All live sessions on a map. Index entries whose primary record has
    /// expired are removed from the index as a side effect.
    pub async fn list_by_map(&self, map_id: Uuid) -> AppResult<Vec<Session>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(map_key(map_id)).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            if let Ok(session_id) = Uuid::parse_str(id) {
                pipe.hgetall(session_key(session_id));
            } else {
                pipe.hgetall(format!("presence:session:{id}"));
            }
        }
        let records: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut sessions = Vec::with_capacity(records.len());
        let mut stale: Vec<String> = Vec::new();
        for (raw_id, fields) in ids.iter().zip(records.iter()) {
            match Uuid::parse_str(raw_id)
                .ok()
                .and_then(|id| parse_session(id, fields))
            {
                Some(session) => sessions.push(session),
                None => stale.push(raw_id.clone()),
            }
        }

        if !stale.is_empty() {
            let _: i64 = conn.srem(map_key(map_id), stale).await.unwrap_or(0);
        }

        Ok(sessions)
    }

    /// Idempotent removal of the record and its index entry.
    pub async fn remove(&self, session_id: Uuid) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(session_key(session_id)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic().del(session_key(session_id)).ignore();
        if let Some(map_id) = fields.get("map_id").and_then(|m| Uuid::parse_str(m).ok()) {
            pipe.srem(map_key(map_id), session_id.to_string()).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

/// Decode a session hash. `None` for an empty or mangled record, which the
/// callers treat as expired.
fn parse_session(session_id: Uuid, fields: &HashMap<String, String>) -> Option<Session> {
    if fields.is_empty() {
        return None;
    }
    let user_id = Uuid::parse_str(fields.get("user_id")?).ok()?;
    let map_id = Uuid::parse_str(fields.get("map_id")?).ok()?;
    let lat: f64 = fields.get("lat")?.parse().ok()?;
    let lng: f64 = fields.get("lng")?.parse().ok()?;
    let created_at = parse_timestamp(fields.get("created_at")?)?;
    let last_active = parse_timestamp(fields.get("last_active")?)?;

    Some(Session {
        id: session_id,
        user_id,
        map_id,
        position: LatLng::new(lat, lng),
        created_at,
        last_active,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert(
            "user_id".into(),
            "1f3c7a10-0000-0000-0000-000000000001".into(),
        );
        fields.insert(
            "map_id".into(),
            "1f3c7a10-0000-0000-0000-000000000002".into(),
        );
        fields.insert("lat".into(), "48.8566".into());
        fields.insert("lng".into(), "2.3522".into());
        fields.insert("created_at".into(), "2026-01-01T10:00:00+00:00".into());
        fields.insert("last_active".into(), "2026-01-01T10:05:00+00:00".into());
        fields
    }

    #[test]
    fn parse_session_round_trips_all_fields() {
        let id = Uuid::new_v4();
        let session = parse_session(id, &sample_fields()).unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.position, LatLng::new(48.8566, 2.3522));
        assert!(session.last_active > session.created_at);
    }

    #[test]
    fn parse_session_treats_empty_hash_as_expired() {
        assert!(parse_session(Uuid::new_v4(), &HashMap::new()).is_none());
    }

    #[test]
    fn parse_session_rejects_mangled_records() {
        let mut fields = sample_fields();
        fields.insert("lat".into(), "not-a-number".into());
        assert!(parse_session(Uuid::new_v4(), &fields).is_none());

        let mut fields = sample_fields();
        fields.remove("map_id");
        assert!(parse_session(Uuid::new_v4(), &fields).is_none());
    }

    #[test]
    fn keys_are_namespaced_by_kind() {
        let id = Uuid::nil();
        assert!(session_key(id).starts_with("presence:session:"));
        assert!(map_key(id).starts_with("presence:map:"));
    }
}
