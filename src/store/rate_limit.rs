use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Domain actions subject to per-user sliding-window limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RateLimitAction {
    CreateSession,
    UpdateAvatar,
    CreatePoi,
    JoinPoi,
    LeavePoi,
    UpdatePoi,
    DeletePoi,
    UpdateProfile,
}

impl RateLimitAction {
    pub const ALL: [RateLimitAction; 8] = [
        RateLimitAction::CreateSession,
        RateLimitAction::UpdateAvatar,
        RateLimitAction::CreatePoi,
        RateLimitAction::JoinPoi,
        RateLimitAction::LeavePoi,
        RateLimitAction::UpdatePoi,
        RateLimitAction::DeletePoi,
        RateLimitAction::UpdateProfile,
    ];

    /// `update_avatar` -> `UPDATE_AVATAR`, for `RATE_LIMIT_*` env overrides.
    pub fn env_suffix(self) -> String {
        self.to_string().to_uppercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub count: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn per_minute(count: u32) -> Self {
        Self {
            count,
            window: Duration::from_secs(60),
        }
    }

    pub fn defaults() -> HashMap<RateLimitAction, RateLimitRule> {
        HashMap::from([
            (RateLimitAction::CreateSession, RateLimitRule::per_minute(10)),
            (RateLimitAction::UpdateAvatar, RateLimitRule::per_minute(60)),
            (RateLimitAction::CreatePoi, RateLimitRule::per_minute(30)),
            (RateLimitAction::JoinPoi, RateLimitRule::per_minute(30)),
            (RateLimitAction::LeavePoi, RateLimitRule::per_minute(30)),
            (RateLimitAction::UpdatePoi, RateLimitRule::per_minute(30)),
            (RateLimitAction::DeletePoi, RateLimitRule::per_minute(30)),
            (RateLimitAction::UpdateProfile, RateLimitRule::per_minute(5)),
        ])
    }
}

// Sliding-window check: prune, count, admit-and-record or deny. One script so
// two racing requests cannot both slip under the limit.
//
// KEYS: [1] the (user, action) sorted set
// ARGV: [1] now ms, [2] window ms, [3] limit, [4] unique member
//
// Returns {allowed, retry_after_ms}. When denied, retry_after is the expiry
// of the OLDEST in-window entry, not a fixed offset from now.
const CHECK_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], window)
  return {1, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local retry = tonumber(oldest[2]) + window - now
if retry < 0 then
  retry = 0
end
return {0, retry}
"#;

fn counter_key(user_id: Uuid, action: RateLimitAction) -> String {
    format!("ratelimit:{user_id}:{action}")
}

/// Round a millisecond wait up to whole seconds for the Retry-After contract.
fn retry_after_secs(retry_ms: i64) -> u64 {
    if retry_ms <= 0 {
        0
    } else {
        ((retry_ms as u64) + 999) / 1000
    }
}

/// Per-(user, action) sliding-window limiter over Redis sorted sets. Shared
/// across instances, so the window holds regardless of which instance serves
/// a request.
#[derive(Clone)]
pub struct RateLimiter {
    conn: ConnectionManager,
    policy: Arc<HashMap<RateLimitAction, RateLimitRule>>,
    check_script: Script,
}

impl RateLimiter {
    pub fn new(conn: ConnectionManager, policy: HashMap<RateLimitAction, RateLimitRule>) -> Self {
        Self {
            conn,
            policy: Arc::new(policy),
            check_script: Script::new(CHECK_SCRIPT),
        }
    }

    /// Admit or deny one request. Denials carry the seconds until the oldest
    /// in-window entry expires.
    pub async fn check(&self, user_id: Uuid, action: RateLimitAction) -> AppResult<()> {
        let rule = self.policy.get(&action).copied().ok_or_else(|| {
            tracing::error!(%action, "No rate-limit rule configured; denying");
            AppError::Internal
        })?;

        let mut conn = self.conn.clone();
        let mut invocation = self.check_script.key(counter_key(user_id, action));
        invocation
            .arg(Utc::now().timestamp_millis())
            .arg(rule.window.as_millis() as i64)
            .arg(rule.count as i64)
            .arg(Uuid::new_v4().to_string());

        let (allowed, retry_ms): (i64, i64) = invocation.invoke_async(&mut conn).await?;
        if allowed == 1 {
            return Ok(());
        }

        Err(AppError::RateLimited {
            retry_after: retry_after_secs(retry_ms),
        })
    }
}
