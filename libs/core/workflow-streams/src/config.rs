//! Stream and connection configuration
//!
//! [`StreamSettings`] drives naming, trimming and the consumer loop cadence.
//! [`RedisSettings`] describes where the store lives; its password is pulled
//! through a [`SecretResolver`] rather than kept in plain config.

use core_config::secrets::{EnvSecretResolver, ExposeSecret, SecretResolver, SecretString};
use core_config::{env_or_default, env_parse, env_parse_optional, ConfigError, FromEnv};
use std::time::Duration;
use uuid::Uuid;

/// Default stream name prefix; the execution id is appended
pub const DEFAULT_STREAM_PREFIX: &str = "workflow:events:";

/// Consumer group shared by every consumer in a deployment
pub const CONSUMER_GROUP: &str = "workflow-processors";

/// Suffix appended to a source stream to name its dead letter stream
pub const DLQ_SUFFIX: &str = ":dlq";

/// Stream field holding the serialized workflow event
pub const EVENT_FIELD: &str = "event";

/// Configuration for publishing and consuming workflow event streams
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Prefix prepended to the execution id to form the stream key
    pub stream_prefix: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Unique consumer ID (auto-generated if not provided)
    pub consumer_id: String,

    /// Approximate maximum stream length (MAXLEN ~)
    pub max_length: usize,

    /// Blocking read timeout for new messages (None = non-blocking)
    ///
    /// Only honoured on a handle with a dedicated reader connection.
    pub block_timeout_ms: Option<u64>,

    /// Minimum idle time before a pending message can be claimed
    pub claim_idle_ms: u64,

    /// How often the consumer loop attempts to claim stale messages
    pub claim_interval_ms: u64,

    /// Batch size for reading messages
    pub batch_size: usize,

    /// Delivery count at which a failing message is moved to the DLQ
    pub max_retries: u32,

    /// Delay between consumer loop cycles
    pub poll_interval_ms: u64,

    /// Delay after a cycle that hit a transport error
    pub error_backoff_ms: u64,
}

impl StreamSettings {
    /// Create settings with the documented defaults
    pub fn new() -> Self {
        Self {
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            consumer_group: CONSUMER_GROUP.to_string(),
            consumer_id: generate_consumer_id(),
            max_length: 1000,
            block_timeout_ms: Some(5000),
            claim_idle_ms: 30_000,
            claim_interval_ms: 10_000,
            batch_size: 10,
            max_retries: 3,
            poll_interval_ms: 100,
            error_backoff_ms: 1000,
        }
    }

    /// Stream key for an execution
    pub fn stream_name(&self, execution_id: &str) -> String {
        format!("{}{}", self.stream_prefix, execution_id)
    }

    /// Dead letter stream key for an execution
    pub fn dlq_stream_name(&self, execution_id: &str) -> String {
        dlq_stream_for(&self.stream_name(execution_id))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_millis(self.claim_interval_ms)
    }

    /// Set the stream prefix
    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    /// Set the consumer ID
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    /// Set the maximum stream length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set the blocking timeout (None for non-blocking)
    pub fn with_blocking(mut self, timeout_ms: Option<u64>) -> Self {
        self.block_timeout_ms = timeout_ms;
        self
    }

    /// Set the claim idle threshold
    pub fn with_claim_idle_ms(mut self, idle_ms: u64) -> Self {
        self.claim_idle_ms = idle_ms;
        self
    }

    /// Set how often stale messages are claimed
    pub fn with_claim_interval_ms(mut self, interval_ms: u64) -> Self {
        self.claim_interval_ms = interval_ms;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Set the error backoff
    pub fn with_error_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.error_backoff_ms = backoff_ms;
        self
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Load StreamSettings from environment variables
///
/// Environment variables (all optional):
/// - `WORKFLOW_STREAM_PREFIX` (default `workflow:events:`)
/// - `WORKFLOW_STREAM_CONSUMER_ID` (default `consumer-<pid>-<random>`)
/// - `WORKFLOW_STREAM_MAX_LENGTH` (default 1000)
/// - `WORKFLOW_STREAM_BLOCK_TIMEOUT_MS` (default 5000, `0` disables blocking)
/// - `WORKFLOW_STREAM_CLAIM_IDLE_MS` (default 30000)
/// - `WORKFLOW_STREAM_CLAIM_INTERVAL_MS` (default 10000)
/// - `WORKFLOW_STREAM_BATCH_SIZE` (default 10)
/// - `WORKFLOW_STREAM_MAX_RETRIES` (default 3)
/// - `WORKFLOW_STREAM_POLL_INTERVAL_MS` (default 100)
/// - `WORKFLOW_STREAM_ERROR_BACKOFF_MS` (default 1000)
impl FromEnv for StreamSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new();

        let block_timeout_ms = env_parse("WORKFLOW_STREAM_BLOCK_TIMEOUT_MS", 5000u64)?;
        let consumer_id = std::env::var("WORKFLOW_STREAM_CONSUMER_ID")
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or(defaults.consumer_id);

        Ok(Self {
            stream_prefix: env_or_default("WORKFLOW_STREAM_PREFIX", DEFAULT_STREAM_PREFIX),
            consumer_group: defaults.consumer_group,
            consumer_id,
            max_length: env_parse("WORKFLOW_STREAM_MAX_LENGTH", defaults.max_length)?,
            block_timeout_ms: (block_timeout_ms > 0).then_some(block_timeout_ms),
            claim_idle_ms: env_parse("WORKFLOW_STREAM_CLAIM_IDLE_MS", defaults.claim_idle_ms)?,
            claim_interval_ms: env_parse(
                "WORKFLOW_STREAM_CLAIM_INTERVAL_MS",
                defaults.claim_interval_ms,
            )?,
            batch_size: env_parse("WORKFLOW_STREAM_BATCH_SIZE", defaults.batch_size)?.max(1),
            max_retries: env_parse("WORKFLOW_STREAM_MAX_RETRIES", defaults.max_retries)?.max(1),
            poll_interval_ms: env_parse(
                "WORKFLOW_STREAM_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
            )?,
            error_backoff_ms: env_parse(
                "WORKFLOW_STREAM_ERROR_BACKOFF_MS",
                defaults.error_backoff_ms,
            )?,
        })
    }
}

/// Dead letter stream key for a source stream
pub fn dlq_stream_for(stream: &str) -> String {
    format!("{}{}", stream, DLQ_SUFFIX)
}

/// Generate a per-process consumer identity: `consumer-<pid>-<random>`
pub fn generate_consumer_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("consumer-{}-{}", std::process::id(), &random[..8])
}

/// Backoff policy for establishing the initial Redis connection
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of retry attempts after the first failure
    pub max_retries: u32,

    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,

    /// Whether to add jitter to prevent thundering herd
    pub use_jitter: bool,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn with_max_delay(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        self.initial_delay_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_delay_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 100,
            max_delay_ms: 3000,
            use_jitter: true,
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub database: Option<u8>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub reconnect: ReconnectPolicy,
}

impl RedisSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            database: None,
            username: None,
            password: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Build settings from a `redis://` URL as handed out by test containers
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let parse_err = |details: String| ConfigError::ParseError {
            key: "redis url".to_string(),
            details,
        };
        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| parse_err(format!("expected redis:// scheme in '{}'", url)))?;
        let (authority, db) = match rest.split_once('/') {
            Some((authority, db)) if !db.is_empty() => (
                authority,
                Some(db.parse::<u8>().map_err(|e| parse_err(e.to_string()))?),
            ),
            Some((authority, _)) => (authority, None),
            None => (rest, None),
        };
        let host_port = authority.rsplit('@').next().unwrap_or(authority);
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>().map_err(|e| parse_err(e.to_string()))?,
            ),
            None => (host_port.to_string(), 6379),
        };

        let mut settings = Self::new(host, port);
        settings.database = db;
        Ok(settings)
    }

    pub fn with_password(mut self, password: SecretString) -> Self {
        self.password = Some(password);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Load settings, resolving the password through `secrets`
    ///
    /// Environment variables:
    /// - `REDIS_HOST` (default `127.0.0.1`), `REDIS_PORT` (default 6379)
    /// - `REDIS_DB`, `REDIS_USERNAME` (optional)
    /// - `REDIS_PASSWORD` (looked up via the resolver)
    /// - `REDIS_CONNECT_MAX_RETRIES`, `REDIS_CONNECT_INITIAL_DELAY_MS`,
    ///   `REDIS_CONNECT_MAX_DELAY_MS`
    pub fn from_env_with(secrets: &dyn SecretResolver) -> Result<Self, ConfigError> {
        let defaults = ReconnectPolicy::default();

        Ok(Self {
            host: env_or_default("REDIS_HOST", "127.0.0.1"),
            port: env_parse("REDIS_PORT", 6379u16)?,
            database: env_parse_optional("REDIS_DB")?,
            username: std::env::var("REDIS_USERNAME").ok().filter(|u| !u.is_empty()),
            password: secrets.resolve("REDIS_PASSWORD")?,
            reconnect: ReconnectPolicy {
                max_retries: env_parse("REDIS_CONNECT_MAX_RETRIES", defaults.max_retries)?,
                initial_delay_ms: env_parse(
                    "REDIS_CONNECT_INITIAL_DELAY_MS",
                    defaults.initial_delay_ms,
                )?,
                max_delay_ms: env_parse("REDIS_CONNECT_MAX_DELAY_MS", defaults.max_delay_ms)?,
                use_jitter: true,
            },
        })
    }

    /// Connection URL including credentials. Do not log the result.
    pub fn connection_url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(password)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(password.expose_secret())
            ),
            (None, Some(password)) => format!(":{}@", urlencoding::encode(password.expose_secret())),
            (Some(user), None) => format!("{}@", urlencoding::encode(user)),
            (None, None) => String::new(),
        };
        let db = self
            .database
            .map(|db| format!("/{}", db))
            .unwrap_or_default();
        format!("redis://{}{}:{}{}", auth, self.host, self.port, db)
    }

    /// Address safe to log (no credentials)
    pub fn display_address(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database.unwrap_or(0))
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self::new("127.0.0.1", 6379)
    }
}

impl FromEnv for RedisSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(&EnvSecretResolver)
    }
}
