use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::store::rate_limit::{RateLimitAction, RateLimitRule};

/// Runtime configuration, loaded once at startup from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub is_dev: bool,
    pub allowed_origins: Vec<String>,

    /// Presence TTL: a session with no heartbeat for this long is gone.
    pub session_inactivity: Duration,
    /// Server-initiated WS ping cadence while a connection is idle.
    pub heartbeat_interval: Duration,
    /// Total idle time (no pong, no inbound frame) before a connection is
    /// unregistered.
    pub heartbeat_timeout: Duration,
    /// Minimum distance between two POIs on the same map, in meters.
    pub poi_proximity_meters: f64,
    pub poi_default_max_participants: i32,
    /// Bound of the per-connection outbound queue; overflowing it closes
    /// that connection.
    pub ws_write_queue_size: usize,

    /// Per-action sliding-window limits, keyed by domain action.
    pub rate_limits: HashMap<RateLimitAction, RateLimitRule>,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        let is_dev = env::var("APP_ENV").as_deref() != Ok("production");
        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_owned())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env_or("SERVER_PORT", 8080),
            is_dev,
            allowed_origins,
            session_inactivity: Duration::from_secs(env_or("SESSION_INACTIVITY_SECONDS", 1800)),
            heartbeat_interval: Duration::from_secs(env_or("HEARTBEAT_INTERVAL_SECONDS", 30)),
            heartbeat_timeout: Duration::from_secs(env_or("HEARTBEAT_TIMEOUT_SECONDS", 60)),
            poi_proximity_meters: env_or("POI_PROXIMITY_METERS", 100.0),
            poi_default_max_participants: env_or("POI_DEFAULT_MAX_PARTICIPANTS", 10),
            ws_write_queue_size: env_or("WS_WRITE_QUEUE_SIZE", 64),
            rate_limits: rate_limits_from_env(),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

/// Parse an env var, falling back to `default` when unset or unparseable.
fn env_or<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Build the per-action rate-limit table: defaults, overridable per action
/// with `RATE_LIMIT_<ACTION>=count/window_seconds` (e.g.
/// `RATE_LIMIT_UPDATE_AVATAR=120/60`).
fn rate_limits_from_env() -> HashMap<RateLimitAction, RateLimitRule> {
    let mut limits = RateLimitRule::defaults();
    for (action, rule) in limits.iter_mut() {
        let var = format!("RATE_LIMIT_{}", action.env_suffix());
        if let Some(parsed) = env::var(&var).ok().and_then(|v| parse_rule(&v)) {
            *rule = parsed;
        }
    }
    limits
}

/// Parse a `count/window_seconds` pair. Returns `None` for anything that is
/// not two positive integers separated by a slash.
pub(crate) fn parse_rule(raw: &str) -> Option<RateLimitRule> {
    let (count, window) = raw.split_once('/')?;
    let count: u32 = count.trim().parse().ok()?;
    let window_secs: u64 = window.trim().parse().ok()?;
    if count == 0 || window_secs == 0 {
        return None;
    }
    Some(RateLimitRule {
        count,
        window: Duration::from_secs(window_secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rule_accepts_count_slash_seconds() {
        let rule = parse_rule("30/60").unwrap();
        assert_eq!(rule.count, 30);
        assert_eq!(rule.window, Duration::from_secs(60));
    }

    #[test]
    fn parse_rule_tolerates_whitespace() {
        let rule = parse_rule(" 5 / 120 ").unwrap();
        assert_eq!(rule.count, 5);
        assert_eq!(rule.window, Duration::from_secs(120));
    }

    #[test]
    fn parse_rule_rejects_garbage() {
        assert!(parse_rule("").is_none());
        assert!(parse_rule("60").is_none());
        assert!(parse_rule("a/b").is_none());
        assert!(parse_rule("0/60").is_none());
        assert!(parse_rule("60/0").is_none());
    }

    #[test]
    fn default_policy_covers_every_action() {
        let limits = RateLimitRule::defaults();
        for action in RateLimitAction::ALL {
            assert!(limits.contains_key(&action), "missing default for {action}");
        }
    }

    #[test]
    fn default_policy_matches_documented_limits() {
        let limits = RateLimitRule::defaults();
        assert_eq!(limits[&RateLimitAction::UpdateAvatar].count, 60);
        assert_eq!(limits[&RateLimitAction::CreateSession].count, 10);
        assert_eq!(limits[&RateLimitAction::JoinPoi].count, 30);
        assert_eq!(limits[&RateLimitAction::UpdateProfile].count, 5);
        for rule in limits.values() {
            assert_eq!(rule.window, Duration::from_secs(60));
        }
    }
}
