//! Sliding-window request throttling keyed by client identity.
//!
//! The counters live in Redis so the quota holds across horizontally
//! scaled instances: each key gets a counter per fixed window, and the
//! previous window's count is weighted by its remaining overlap with the
//! sliding interval. When no `REDIS_URL` is configured the limiter falls
//! back to an in-process sliding log, which is only correct for a single
//! instance.

use chrono::Utc;
use once_cell::sync::Lazy;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};

static STORE: OnceCell<ConnectionManager> = OnceCell::const_new();

static MEMORY_LIMITER: Lazy<MemoryLimiter> =
    Lazy::new(|| MemoryLimiter::new(RateLimitConfig::from_env()));

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Throttled,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        Self {
            max_requests: std::env::var("RATE_LIMIT_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
            window_secs: std::env::var("RATE_LIMIT_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }
}

/// Connect the shared counter store. Called once at startup when
/// `REDIS_URL` is configured.
pub async fn init_store(redis_url: &str) -> Result<(), redis::RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(500));

    let client = redis::Client::open(redis_url)?;
    let conn = client.get_connection_manager_with_config(config).await?;

    let _ = STORE.set(conn);
    tracing::info!("Rate-limit counter store connected");

    Ok(())
}

/// Ping the counter store, returning the round-trip time.
pub async fn store_ping() -> Result<Duration, redis::RedisError> {
    let conn = STORE.get().ok_or_else(|| {
        redis::RedisError::from((
            redis::ErrorKind::ClientError,
            "rate-limit store not initialized",
        ))
    })?;

    let start = std::time::Instant::now();
    let mut conn = conn.clone();
    redis::cmd("PING").query_async::<String>(&mut conn).await?;

    Ok(start.elapsed())
}

/// Check whether a request from `key` is within quota.
///
/// Store errors fail open with an error log: a broken Redis must not take
/// every mutating endpoint down with it.
pub async fn check(key: &str) -> Decision {
    #[cfg(test)]
    {
        let _ = key;
        return Decision::Allowed; // Bypass in tests so validation and credentials are exercised
    }

    #[cfg(not(test))]
    {
        let config = RateLimitConfig::from_env();
        if let Some(conn) = STORE.get() {
            match check_shared(conn.clone(), key, config).await {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::error!("rate-limit store error: {}", e);
                    Decision::Allowed
                }
            }
        } else {
            MEMORY_LIMITER.check(key).await
        }
    }
}

/// Weighted two-window counter against the shared store.
#[cfg_attr(test, allow(dead_code))]
async fn check_shared(
    mut conn: ConnectionManager,
    key: &str,
    config: RateLimitConfig,
) -> Result<Decision, redis::RedisError> {
    let now = Utc::now().timestamp() as u64;
    let window = config.window_secs.max(1);
    let index = now / window;

    let current_key = format!("ratelimit:{}:{}", key, index);
    let previous_key = format!("ratelimit:{}:{}", key, index.wrapping_sub(1));

    // Counters expire after two windows so stale keys clean themselves up.
    let (current, previous): (u64, Option<u64>) = redis::pipe()
        .atomic()
        .incr(&current_key, 1u64)
        .expire(&current_key, (window * 2) as i64)
        .ignore()
        .get(&previous_key)
        .query_async(&mut conn)
        .await?;

    let elapsed_in_window = now % window;
    let overlap = (window - elapsed_in_window) as f64 / window as f64;
    let weighted = current as f64 + previous.unwrap_or(0) as f64 * overlap;

    if weighted > config.max_requests as f64 {
        Ok(Decision::Throttled)
    } else {
        Ok(Decision::Allowed)
    }
}

/// In-process sliding log, used when no shared store is configured.
pub struct MemoryLimiter {
    config: RateLimitConfig,
    hits: RwLock<HashMap<String, Vec<i64>>>,
}

impl MemoryLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            hits: RwLock::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> Decision {
        self.check_at(key, Utc::now().timestamp_millis()).await
    }

    /// Check against an explicit clock. Timestamps older than the window
    /// are dropped on every call so memory stays proportional to the
    /// number of *active* keys rather than every key seen since startup.
    pub async fn check_at(&self, key: &str, now_ms: i64) -> Decision {
        let window_ms = self.config.window_secs as i64 * 1000;
        let mut hits = self.hits.write().await;

        hits.retain(|_, stamps| stamps.last().is_some_and(|t| now_ms - *t < window_ms));

        let stamps = hits.entry(key.to_string()).or_default();
        stamps.retain(|t| now_ms - *t < window_ms);

        if stamps.len() as u64 >= self.config.max_requests {
            return Decision::Throttled;
        }

        stamps.push(now_ms);
        Decision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u64, window_secs: u64) -> MemoryLimiter {
        MemoryLimiter::new(RateLimitConfig {
            max_requests,
            window_secs,
        })
    }

    #[tokio::test]
    async fn test_quota_exhausted_within_window() {
        let limiter = limiter(3, 60);
        let now = 1_000_000;
        for i in 0..3 {
            assert_eq!(
                limiter.check_at("alice", now + i).await,
                Decision::Allowed,
                "request {} should be within quota",
                i + 1
            );
        }
        assert_eq!(limiter.check_at("alice", now + 10).await, Decision::Throttled);
    }

    #[tokio::test]
    async fn test_window_elapse_allows_again() {
        let limiter = limiter(2, 60);
        let now = 1_000_000;
        assert_eq!(limiter.check_at("k", now).await, Decision::Allowed);
        assert_eq!(limiter.check_at("k", now + 1).await, Decision::Allowed);
        assert_eq!(limiter.check_at("k", now + 2).await, Decision::Throttled);

        let later = now + 60_001;
        assert_eq!(limiter.check_at("k", later).await, Decision::Allowed);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(1, 60);
        let now = 1_000_000;
        assert_eq!(limiter.check_at("alice", now).await, Decision::Allowed);
        assert_eq!(limiter.check_at("bob", now).await, Decision::Allowed);
        assert_eq!(limiter.check_at("alice", now + 1).await, Decision::Throttled);
    }

    #[tokio::test]
    async fn test_throttled_request_does_not_extend_window() {
        let limiter = limiter(1, 60);
        let now = 1_000_000;
        assert_eq!(limiter.check_at("k", now).await, Decision::Allowed);
        // Repeated throttled attempts must not push the reset point out.
        for i in 1..10 {
            assert_eq!(limiter.check_at("k", now + i).await, Decision::Throttled);
        }
        assert_eq!(limiter.check_at("k", now + 60_001).await, Decision::Allowed);
    }

    #[tokio::test]
    async fn test_init_store_invalid_url_errors() {
        let result = init_store("not-a-redis-url").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_store_ping_fails_without_store() {
        let result = store_ping().await;
        assert!(result.is_err());
    }

    #[test]
    fn test_config_from_env_has_sane_defaults() {
        let config = RateLimitConfig::from_env();
        assert!(config.max_requests >= 1);
        assert!(config.window_secs >= 1);
    }
}
