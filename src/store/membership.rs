use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppResult;

fn members_key(poi_id: Uuid) -> String {
    format!("poi:{poi_id}:members")
}

fn timer_key(poi_id: Uuid) -> String {
    format!("poi:{poi_id}:timer")
}

/// Reverse index: user id -> the one POI they are currently in.
const CURRENT_POI_KEY: &str = "poimember:current";

// Atomic join. One script holds the whole invariant: the capacity check and
// the member add are a single unit (first writer wins), and a user joining a
// new POI is removed from their prior POI's set before being added, so the
// single-POI rule can never be observed violated. Discussion-timer
// transitions on both POIs happen inside the same unit.
//
// KEYS: [1] target members set, [2] current-POI hash, [3] target timer hash
// ARGV: [1] poi id, [2] user id, [3] max participants, [4] now (unix ms)
//
// Returns: { status, prior_poi, new_count, prior_count, timer_started,
//            timer_accumulated_ms, prior_paused, prior_accumulated_ms }
//   status: 1 = joined, 0 = already a member, -1 = full
//
// Prior-POI keys are derived inside the script, which requires a
// non-clustered Redis.
const JOIN_SCRIPT: &str = r#"
local count = redis.call('SCARD', KEYS[1])
if redis.call('SISMEMBER', KEYS[1], ARGV[2]) == 1 then
  return {0, '', count, -1, 0, 0, 0, 0}
end
if count >= tonumber(ARGV[3]) then
  return {-1, '', count, -1, 0, 0, 0, 0}
end

local now = tonumber(ARGV[4])
local prior = redis.call('HGET', KEYS[2], ARGV[2])
if prior == ARGV[1] then
  prior = false
end
local prior_count = -1
local prior_paused = 0
local prior_accumulated = 0
if prior then
  local prior_members = 'poi:' .. prior .. ':members'
  redis.call('SREM', prior_members, ARGV[2])
  prior_count = redis.call('SCARD', prior_members)
  local prior_timer = 'poi:' .. prior .. ':timer'
  if prior_count == 1 then
    local started = redis.call('HGET', prior_timer, 'started_at_ms')
    if started then
      prior_accumulated = tonumber(redis.call('HGET', prior_timer, 'accumulated_ms') or '0')
        + (now - tonumber(started))
      redis.call('HDEL', prior_timer, 'started_at_ms')
      redis.call('HSET', prior_timer, 'accumulated_ms', prior_accumulated)
      prior_paused = 1
    end
  elseif prior_count == 0 then
    redis.call('DEL', prior_timer)
  end
end

redis.call('SADD', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[2], ARGV[1])
local new_count = redis.call('SCARD', KEYS[1])

local timer_started = 0
local timer_accumulated = 0
if new_count == 2 and not redis.call('HGET', KEYS[3], 'started_at_ms') then
  redis.call('HSET', KEYS[3], 'started_at_ms', now)
  timer_started = 1
  timer_accumulated = tonumber(redis.call('HGET', KEYS[3], 'accumulated_ms') or '0')
end

return {1, prior or '', new_count, prior_count, timer_started, timer_accumulated,
        prior_paused, prior_accumulated}
"#;

// Atomic leave, symmetric to join. A 2->1 transition pauses the timer and
// accumulates the elapsed run; reaching 0 resets the timer state entirely.
//
// KEYS: [1] members set, [2] current-POI hash, [3] timer hash
// ARGV: [1] poi id, [2] user id, [3] now (unix ms)
//
// Returns: { removed, new_count, paused, accumulated_ms }
const LEAVE_SCRIPT: &str = r#"
if redis.call('SREM', KEYS[1], ARGV[2]) == 0 then
  return {0, redis.call('SCARD', KEYS[1]), 0, 0}
end
if redis.call('HGET', KEYS[2], ARGV[2]) == ARGV[1] then
  redis.call('HDEL', KEYS[2], ARGV[2])
end

local count = redis.call('SCARD', KEYS[1])
local paused = 0
local accumulated = 0
if count == 1 then
  local started = redis.call('HGET', KEYS[3], 'started_at_ms')
  if started then
    accumulated = tonumber(redis.call('HGET', KEYS[3], 'accumulated_ms') or '0')
      + (tonumber(ARGV[3]) - tonumber(started))
    redis.call('HDEL', KEYS[3], 'started_at_ms')
    redis.call('HSET', KEYS[3], 'accumulated_ms', accumulated)
    paused = 1
  end
elseif count == 0 then
  redis.call('DEL', KEYS[3])
end

return {1, count, paused, accumulated}
"#;

/// What an attempted join did. `Full` and `AlreadyMember` carry the count
/// observed inside the atomic unit so callers can report it without a
/// second read.
#[derive(Debug)]
pub enum JoinResult {
    Joined(JoinOutcome),
    Full { count: i64 },
    AlreadyMember { count: i64 },
}

#[derive(Debug)]
pub struct JoinOutcome {
    /// POI the user was atomically removed from, if they were in one.
    pub prior_poi: Option<Uuid>,
    pub new_count: i64,
    /// Member count of the prior POI after removal.
    pub prior_count: Option<i64>,
    /// Set when this join was the 1->2 transition on the target POI.
    pub timer_started_at: Option<DateTime<Utc>>,
    /// Accumulated run carried over from earlier sessions of the timer,
    /// meaningful when `timer_started_at` is set.
    pub timer_accumulated_ms: i64,
    /// Set when leaving the prior POI was its 2->1 transition.
    pub prior_timer_accumulated_ms: Option<i64>,
}

#[derive(Debug)]
pub struct LeaveOutcome {
    pub removed: bool,
    pub new_count: i64,
    /// Set when this leave was the 2->1 transition.
    pub timer_accumulated_ms: Option<i64>,
}

/// Per-POI discussion timer as read back for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct DiscussionTimer {
    pub is_active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub accumulated_ms: i64,
}

/// POI membership sets with capacity, the user -> POI reverse index, and the
/// derived discussion-timer state, all held in Redis and mutated through
/// single Lua scripts so joins are linearizable across instances.
#[derive(Clone)]
pub struct MembershipStore {
    conn: ConnectionManager,
    join_script: Script,
    leave_script: Script,
}

impl MembershipStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            join_script: Script::new(JOIN_SCRIPT),
            leave_script: Script::new(LEAVE_SCRIPT),
        }
    }

    pub async fn join(
        &self,
        poi_id: Uuid,
        user_id: Uuid,
        max_participants: i64,
        now: DateTime<Utc>,
    ) -> AppResult<JoinResult> {
        let mut conn = self.conn.clone();
        let mut invocation = self.join_script.key(members_key(poi_id));
        invocation
            .key(CURRENT_POI_KEY)
            .key(timer_key(poi_id))
            .arg(poi_id.to_string())
            .arg(user_id.to_string())
            .arg(max_participants)
            .arg(now.timestamp_millis());

        #[allow(clippy::type_complexity)]
        let (status, prior, new_count, prior_count, timer_started, timer_acc, prior_paused, prior_acc): (
            i64,
            String,
            i64,
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = invocation.invoke_async(&mut conn).await?;

        Ok(match status {
            1 => JoinResult::Joined(JoinOutcome {
                prior_poi: Uuid::parse_str(&prior).ok(),
                new_count,
                prior_count: (prior_count >= 0).then_some(prior_count),
                timer_started_at: (timer_started == 1).then_some(now),
                timer_accumulated_ms: timer_acc,
                prior_timer_accumulated_ms: (prior_paused == 1).then_some(prior_acc),
            }),
            -1 => JoinResult::Full { count: new_count },
            _ => JoinResult::AlreadyMember { count: new_count },
        })
    }

    pub async fn leave(
        &self,
        poi_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<LeaveOutcome> {
        let mut conn = self.conn.clone();
        let mut invocation = self.leave_script.key(members_key(poi_id));
        invocation
            .key(CURRENT_POI_KEY)
            .key(timer_key(poi_id))
            .arg(poi_id.to_string())
            .arg(user_id.to_string())
            .arg(now.timestamp_millis());

        let (removed, new_count, paused, accumulated): (i64, i64, i64, i64) =
            invocation.invoke_async(&mut conn).await?;

        Ok(LeaveOutcome {
            removed: removed == 1,
            new_count,
            timer_accumulated_ms: (paused == 1).then_some(accumulated),
        })
    }

    pub async fn count(&self, poi_id: Uuid) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(members_key(poi_id)).await?)
    }

    /// Member counts for a batch of POIs, in input order.
    pub async fn counts_for(&self, poi_ids: &[Uuid]) -> AppResult<Vec<i64>> {
        if poi_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for poi_id in poi_ids {
            pipe.scard(members_key(*poi_id));
        }
        Ok(pipe.query_async(&mut conn).await?)
    }

    pub async fn members(&self, poi_id: Uuid) -> AppResult<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers(members_key(poi_id)).await?;
        Ok(raw
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }

    pub async fn is_member(&self, poi_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn
            .sismember(members_key(poi_id), user_id.to_string())
            .await?)
    }

    pub async fn current_poi(&self, user_id: Uuid) -> AppResult<Option<Uuid>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(CURRENT_POI_KEY, user_id.to_string()).await?;
        Ok(raw.and_then(|id| Uuid::parse_str(&id).ok()))
    }

    pub async fn timer(&self, poi_id: Uuid) -> AppResult<DiscussionTimer> {
        let mut conn = self.conn.clone();
        let (started_at_ms, accumulated_ms): (Option<i64>, Option<i64>) = redis::pipe()
            .hget(timer_key(poi_id), "started_at_ms")
            .hget(timer_key(poi_id), "accumulated_ms")
            .query_async(&mut conn)
            .await?;

        Ok(DiscussionTimer {
            is_active: started_at_ms.is_some(),
            started_at: started_at_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            accumulated_ms: accumulated_ms.unwrap_or(0),
        })
    }

    /// Drop every membership key for a POI. Used after a delete cascade has
    /// already walked the members through the normal leave path.
    pub async fn clear(&self, poi_id: Uuid) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(members_key(poi_id))
            .ignore()
            .del(timer_key(poi_id))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
