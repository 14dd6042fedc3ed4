//! Shared Redis connection plumbing.
//!
//! One `ConnectionManager` per process, guarded by a Tokio mutex and injected
//! into the broker adapter. The manager reconnects on its own after
//! transport errors; callers just observe the failed command as a retryable
//! error.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{error, info};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Connect to Redis and verify the connection with a PING.
pub async fn connect(redis_url: &str) -> Result<SharedConnectionManager> {
    let client = Client::open(redis_url).context("failed to construct Redis client")?;
    let mut manager = ConnectionManager::new(client)
        .await
        .context("failed to initialize Redis connection manager")?;

    let pong: String = redis::cmd("PING")
        .query_async(&mut manager)
        .await
        .context("Redis PING failed during startup")?;
    if pong != "PONG" {
        anyhow::bail!("unexpected Redis PING response: {pong}");
    }

    info!("Redis connection established");
    Ok(Arc::new(Mutex::new(manager)))
}

// Redis command timeout configuration
const DEFAULT_REDIS_COMMAND_TIMEOUT_MS: u64 = 3_000;
const MIN_REDIS_COMMAND_TIMEOUT_MS: u64 = 500;

/// Command timeout from `REDIS_COMMAND_TIMEOUT_MS`, resolved once.
pub fn redis_command_timeout() -> Duration {
    static TIMEOUT: OnceCell<Duration> = OnceCell::new();
    *TIMEOUT.get_or_init(|| {
        let ms = std::env::var("REDIS_COMMAND_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REDIS_COMMAND_TIMEOUT_MS)
            .max(MIN_REDIS_COMMAND_TIMEOUT_MS);

        info!("Redis command timeout set to {}ms", ms);
        Duration::from_millis(ms)
    })
}

/// Wrap a non-blocking Redis command with the configured timeout.
///
/// Blocking stream reads size their own timeout from the requested block
/// duration instead; see [`with_deadline`].
pub async fn with_timeout<F, T>(future: F) -> Result<T, RedisError>
where
    F: std::future::Future<Output = Result<T, RedisError>>,
{
    with_deadline(redis_command_timeout(), future).await
}

/// Wrap a Redis command with an explicit deadline.
pub async fn with_deadline<F, T>(deadline: Duration, future: F) -> Result<T, RedisError>
where
    F: std::future::Future<Output = Result<T, RedisError>>,
{
    match timeout(deadline, future).await {
        Ok(res) => res,
        Err(_) => {
            error!("Redis command timed out after {:?}", deadline);
            Err(RedisError::from((
                redis::ErrorKind::IoError,
                "redis command timed out",
            )))
        }
    }
}
