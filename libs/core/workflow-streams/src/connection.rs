//! Redis connection bootstrap
//!
//! A single [`ConnectionManager`] is shared by every component. The manager
//! reconnects on its own once established; only the first connection is
//! retried here, with capped exponential backoff.
//!
//! Blocking stream reads get a second manager of their own, see
//! [`connect_reader`].

use crate::config::{ReconnectPolicy, RedisSettings};
use crate::error::StreamError;
use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Headroom of the reader's response timeout over the block timeout
const READER_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// Connect once and verify the connection with PING
pub async fn connect_once(settings: &RedisSettings) -> Result<ConnectionManager, StreamError> {
    open_manager(settings, ConnectionManagerConfig::new()).await
}

async fn open_manager(
    settings: &RedisSettings,
    config: ConnectionManagerConfig,
) -> Result<ConnectionManager, StreamError> {
    let client = Client::open(settings.connection_url())?;
    let manager = ConnectionManager::new_with_config(client, config).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    Ok(manager)
}

/// Connect to Redis, retrying per the settings' reconnect policy
///
/// Exhausting the policy yields [`StreamError::ConnectionFailed`] carrying
/// the last error.
pub async fn connect(settings: &RedisSettings) -> Result<ConnectionManager, StreamError> {
    info!(address = %settings.display_address(), "Connecting to Redis");

    let manager = retry_with_backoff(|| connect_once(settings), &settings.reconnect)
        .await
        .map_err(|e| {
            StreamError::ConnectionFailed(format!(
                "{} after {} retries: {}",
                settings.display_address(),
                settings.reconnect.max_retries,
                e
            ))
        })?;

    info!(address = %settings.display_address(), "Connected to Redis");
    Ok(manager)
}

/// Connect the manager used for `XREADGROUP ... BLOCK <block_ms>`
///
/// A blocked read holds its connection until data arrives or the block
/// expires, so it cannot share the multiplexed manager; the reader's
/// response timeout is set past the block timeout.
pub async fn connect_reader(
    settings: &RedisSettings,
    block_ms: u64,
) -> Result<ConnectionManager, StreamError> {
    let timeout = reader_response_timeout(block_ms);
    debug!(address = %settings.display_address(), ?timeout, "Connecting blocking reader");

    retry_with_backoff(
        || {
            open_manager(
                settings,
                ConnectionManagerConfig::new().set_response_timeout(Some(timeout)),
            )
        },
        &settings.reconnect,
    )
    .await
    .map_err(|e| {
        StreamError::ConnectionFailed(format!(
            "reader for {}: {}",
            settings.display_address(),
            e
        ))
    })
}

fn reader_response_timeout(block_ms: u64) -> Duration {
    Duration::from_millis(block_ms) + READER_TIMEOUT_MARGIN
}

/// Round-trip a PING on an existing connection
pub async fn ping(redis: &ConnectionManager) -> Result<(), StreamError> {
    let mut conn = redis.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}

/// Retry an async operation with exponential backoff
pub(crate) async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    policy: &ReconnectPolicy,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} retries", attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                attempt += 1;

                if attempt > policy.max_retries {
                    warn!("Operation failed after {} attempts: {}", attempt, e);
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt);
                let delay = if policy.use_jitter {
                    apply_jitter(delay)
                } else {
                    delay
                };

                warn!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, policy.max_retries, e, delay
                );

                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

/// Scale a delay to 50-100% of its value
fn apply_jitter(delay: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let random_factor =
        (RandomState::new().hash_one(std::time::SystemTime::now()) % 50) as f64 / 100.0 + 0.5;

    (delay as f64 * random_factor) as u64
}
