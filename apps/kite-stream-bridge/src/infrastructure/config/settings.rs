//! Bridge Configuration Settings
//!
//! Configuration types for the ingestion bridge, loaded from environment
//! variables. `BridgeConfig::from_lookup` takes the variable source as a
//! closure so tests never touch the process environment.

use std::time::Duration;

use crate::domain::ticks::{InstrumentToken, SubscriptionMode};

/// NIFTY 50, NIFTY BANK and INDIA VIX.
pub const DEFAULT_INSTRUMENTS: [u32; 3] = [256_265, 260_105, 264_969];

/// Default ticker endpoint.
pub const DEFAULT_TICKER_URL: &str = "wss://ws.kite.trade";

/// Default Redis endpoint (state store and Celery broker).
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";

/// Default Celery task that receives tick batches.
pub const DEFAULT_CELERY_TASK: &str = "zerodha_api.amqp.main.cache_on_redis";

/// Kite API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    access_token: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, access_token: String) -> Self {
        Self {
            api_key,
            access_token,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the access token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Ticker connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Ticker endpoint without query string.
    pub url: String,
    /// Interval between client pings.
    pub ping_interval: Duration,
    /// Silence after which the connection is considered stale.
    pub stale_timeout: Duration,
    /// Deadline for the first frame after the upgrade.
    pub auth_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Live period after which backoff starts over.
    pub stability_threshold: Duration,
    /// Malformed frames in a row that tear the connection down.
    pub max_consecutive_malformed: u32,
    /// Tokens per outbound subscribe/unsubscribe/mode command.
    pub max_tokens_per_message: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_TICKER_URL.to_string(),
            ping_interval: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            stability_threshold: Duration::from_secs(30),
            max_consecutive_malformed: 10,
            max_tokens_per_message: 200,
        }
    }
}

/// Subscription registry settings.
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    /// Instruments seeded into the registry at start.
    pub default_instruments: Vec<InstrumentToken>,
    /// Mode for seeded and remotely requested instruments.
    pub default_mode: SubscriptionMode,
    /// Registry capacity (Kite allows 3000 per connection).
    pub max_instruments: usize,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            default_instruments: DEFAULT_INSTRUMENTS.map(InstrumentToken::new).to_vec(),
            default_mode: SubscriptionMode::Full,
            max_instruments: 3000,
        }
    }
}

/// Broadcast hub settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Capacity of the tick broadcast channel.
    pub hub_capacity: usize,
    /// Capacity of the control message channel.
    pub control_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            hub_capacity: 16_384,
            control_capacity: 1_024,
        }
    }
}

/// State sync settings.
#[derive(Debug, Clone)]
pub struct StateSyncSettings {
    /// Flusher period; each token is written at most once per period.
    pub flush_interval: Duration,
    /// Write lag beyond which health reports degraded.
    pub lag_degraded: Duration,
}

impl Default for StateSyncSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(250),
            lag_degraded: Duration::from_secs(5),
        }
    }
}

/// Overflow behaviour when the dispatch buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered event.
    #[default]
    DropOldest,
    /// Wait for room up to the timeout, then drop the incoming event.
    BlockWithTimeout(Duration),
}

impl OverflowPolicy {
    /// Parse the policy name; `block` uses the given timeout.
    #[must_use]
    pub fn parse(s: &str, block_timeout: Duration) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" => Some(Self::DropOldest),
            "block" | "block-with-timeout" => Some(Self::BlockWithTimeout(block_timeout)),
            _ => None,
        }
    }

    /// Policy name for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::BlockWithTimeout(_) => "block_with_timeout",
        }
    }
}

/// Task dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Buffered events before the overflow policy applies.
    pub capacity: usize,
    /// Events per batch.
    pub batch_size: usize,
    /// Flush a partial batch after this long.
    pub flush_interval: Duration,
    /// Bound on a single enqueue.
    pub flush_timeout: Duration,
    /// Consecutive failed flushes before the dispatcher reports degraded.
    pub degraded_after_failures: u32,
    /// What to do when the buffer is full.
    pub overflow: OverflowPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: 200,
            flush_interval: Duration::from_millis(500),
            flush_timeout: Duration::from_secs(2),
            degraded_after_failures: 3,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Celery broker settings.
#[derive(Debug, Clone)]
pub struct CelerySettings {
    /// Broker list the messages are pushed onto.
    pub queue: String,
    /// Registered task name on the workers.
    pub task_name: String,
}

impl Default for CelerySettings {
    fn default() -> Self {
        Self {
            queue: "celery".to_string(),
            task_name: DEFAULT_CELERY_TASK.to_string(),
        }
    }
}

/// Server port and control settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
    /// Redis control flag poll period.
    pub control_poll_interval: Duration,
    /// Grace period for draining the dispatcher on stop.
    pub drain_grace: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            control_poll_interval: Duration::from_secs(1),
            drain_grace: Duration::from_secs(5),
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// API credentials.
    pub credentials: Credentials,
    /// Redis connection URL.
    pub redis_url: String,
    /// Ticker connection settings.
    pub websocket: WebSocketSettings,
    /// Registry settings.
    pub subscriptions: SubscriptionSettings,
    /// Broadcast hub settings.
    pub broadcast: BroadcastSettings,
    /// State sync settings.
    pub state_sync: StateSyncSettings,
    /// Dispatcher settings.
    pub dispatch: DispatchSettings,
    /// Celery settings.
    pub celery: CelerySettings,
    /// Server settings.
    pub server: ServerSettings,
}

impl BridgeConfig {
    /// Configuration with defaults for everything but the credentials.
    #[must_use]
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            websocket: WebSocketSettings::default(),
            subscriptions: SubscriptionSettings::default(),
            broadcast: BroadcastSettings::default(),
            state_sync: StateSyncSettings::default(),
            dispatch: DispatchSettings::default(),
            celery: CelerySettings::default(),
            server: ServerSettings::default(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// value cannot be interpreted.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// Unparseable numeric values fall back to their defaults; unparseable
    /// enumerations and instrument lists are errors.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or empty, or an
    /// enumeration or instrument list is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource(lookup);

        let api_key = env.required("KITE_API_KEY")?;
        let access_token = env.required("KITE_ACCESS_TOKEN")?;

        let ws_defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            url: env.get("KITE_TICKER_URL").unwrap_or(ws_defaults.url),
            ping_interval: env.duration_secs("BRIDGE_PING_INTERVAL_SECS", ws_defaults.ping_interval),
            stale_timeout: env.duration_secs("BRIDGE_STALE_TIMEOUT_SECS", ws_defaults.stale_timeout),
            auth_timeout: env.duration_secs("BRIDGE_AUTH_TIMEOUT_SECS", ws_defaults.auth_timeout),
            reconnect_delay_initial: env.duration_millis(
                "BRIDGE_RECONNECT_DELAY_INITIAL_MS",
                ws_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "BRIDGE_RECONNECT_DELAY_MAX_SECS",
                ws_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse_or(
                "BRIDGE_RECONNECT_DELAY_MULTIPLIER",
                ws_defaults.reconnect_delay_multiplier,
            ),
            stability_threshold: env.duration_secs(
                "BRIDGE_STABILITY_THRESHOLD_SECS",
                ws_defaults.stability_threshold,
            ),
            max_consecutive_malformed: env.parse_or(
                "BRIDGE_MAX_CONSECUTIVE_MALFORMED",
                ws_defaults.max_consecutive_malformed,
            ),
            max_tokens_per_message: env.parse_or(
                "BRIDGE_MAX_TOKENS_PER_MESSAGE",
                ws_defaults.max_tokens_per_message,
            ),
        };

        let sub_defaults = SubscriptionSettings::default();
        let default_mode = match env.get("BRIDGE_DEFAULT_MODE") {
            Some(raw) => SubscriptionMode::from_str_case_insensitive(&raw).ok_or(
                ConfigError::InvalidValue {
                    key: "BRIDGE_DEFAULT_MODE".to_string(),
                    value: raw,
                },
            )?,
            None => sub_defaults.default_mode,
        };
        let default_instruments = match env.get("BRIDGE_DEFAULT_INSTRUMENTS") {
            Some(raw) => parse_instrument_list(&raw).ok_or(ConfigError::InvalidValue {
                key: "BRIDGE_DEFAULT_INSTRUMENTS".to_string(),
                value: raw,
            })?,
            None => sub_defaults.default_instruments,
        };
        let subscriptions = SubscriptionSettings {
            default_instruments,
            default_mode,
            max_instruments: env.parse_or("BRIDGE_MAX_INSTRUMENTS", sub_defaults.max_instruments),
        };

        let broadcast_defaults = BroadcastSettings::default();
        let broadcast = BroadcastSettings {
            hub_capacity: env.parse_or("BRIDGE_HUB_CAPACITY", broadcast_defaults.hub_capacity),
            control_capacity: broadcast_defaults.control_capacity,
        };

        let state_defaults = StateSyncSettings::default();
        let state_sync = StateSyncSettings {
            flush_interval: env.duration_millis(
                "BRIDGE_STATE_FLUSH_INTERVAL_MS",
                state_defaults.flush_interval,
            ),
            lag_degraded: env
                .duration_millis("BRIDGE_STATE_LAG_DEGRADED_MS", state_defaults.lag_degraded),
        };

        let dispatch_defaults = DispatchSettings::default();
        let block_timeout =
            env.duration_millis("BRIDGE_DISPATCH_BLOCK_TIMEOUT_MS", Duration::from_millis(50));
        let overflow = match env.get("BRIDGE_DISPATCH_OVERFLOW") {
            Some(raw) => {
                OverflowPolicy::parse(&raw, block_timeout).ok_or(ConfigError::InvalidValue {
                    key: "BRIDGE_DISPATCH_OVERFLOW".to_string(),
                    value: raw,
                })?
            }
            None => dispatch_defaults.overflow,
        };
        let dispatch = DispatchSettings {
            capacity: env.parse_or("BRIDGE_DISPATCH_CAPACITY", dispatch_defaults.capacity),
            batch_size: env.parse_or("BRIDGE_DISPATCH_BATCH_SIZE", dispatch_defaults.batch_size),
            flush_interval: env.duration_millis(
                "BRIDGE_DISPATCH_FLUSH_INTERVAL_MS",
                dispatch_defaults.flush_interval,
            ),
            flush_timeout: env.duration_millis(
                "BRIDGE_DISPATCH_FLUSH_TIMEOUT_MS",
                dispatch_defaults.flush_timeout,
            ),
            degraded_after_failures: env.parse_or(
                "BRIDGE_DISPATCH_DEGRADED_AFTER",
                dispatch_defaults.degraded_after_failures,
            ),
            overflow,
        };

        let celery_defaults = CelerySettings::default();
        let celery = CelerySettings {
            queue: env.get("CELERY_QUEUE").unwrap_or(celery_defaults.queue),
            task_name: env.get("CELERY_TASK_NAME").unwrap_or(celery_defaults.task_name),
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            health_port: env.parse_or("BRIDGE_HEALTH_PORT", server_defaults.health_port),
            control_poll_interval: env.duration_millis(
                "BRIDGE_CONTROL_POLL_MS",
                server_defaults.control_poll_interval,
            ),
            drain_grace: env.duration_secs("BRIDGE_DRAIN_GRACE_SECS", server_defaults.drain_grace),
        };

        Ok(Self {
            credentials: Credentials::new(api_key, access_token),
            redis_url: env.get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            websocket,
            subscriptions,
            broadcast,
            state_sync,
            dispatch,
            celery,
            server,
        })
    }

    /// Check cross-field bounds.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first violated bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = &self.websocket;
        if ws.max_tokens_per_message == 0 {
            return Err(invalid("BRIDGE_MAX_TOKENS_PER_MESSAGE", "must be positive"));
        }
        if ws.ping_interval.is_zero() || ws.ping_interval >= ws.stale_timeout {
            return Err(invalid(
                "BRIDGE_PING_INTERVAL_SECS",
                "must be positive and shorter than the stale timeout",
            ));
        }
        if ws.auth_timeout.is_zero() {
            return Err(invalid("BRIDGE_AUTH_TIMEOUT_SECS", "must be positive"));
        }
        if ws.reconnect_delay_initial.is_zero()
            || ws.reconnect_delay_initial > ws.reconnect_delay_max
        {
            return Err(invalid(
                "BRIDGE_RECONNECT_DELAY_INITIAL_MS",
                "must be positive and not above the maximum delay",
            ));
        }
        if !ws.reconnect_delay_multiplier.is_finite() || ws.reconnect_delay_multiplier < 1.0 {
            return Err(invalid("BRIDGE_RECONNECT_DELAY_MULTIPLIER", "must be >= 1.0"));
        }
        if ws.max_consecutive_malformed == 0 {
            return Err(invalid("BRIDGE_MAX_CONSECUTIVE_MALFORMED", "must be positive"));
        }

        let subs = &self.subscriptions;
        if subs.max_instruments == 0 {
            return Err(invalid("BRIDGE_MAX_INSTRUMENTS", "must be positive"));
        }
        if subs.default_instruments.len() > subs.max_instruments {
            return Err(invalid(
                "BRIDGE_DEFAULT_INSTRUMENTS",
                "more instruments than BRIDGE_MAX_INSTRUMENTS",
            ));
        }

        if self.broadcast.hub_capacity == 0 {
            return Err(invalid("BRIDGE_HUB_CAPACITY", "must be positive"));
        }
        if self.state_sync.flush_interval.is_zero() {
            return Err(invalid("BRIDGE_STATE_FLUSH_INTERVAL_MS", "must be positive"));
        }

        let dispatch = &self.dispatch;
        if dispatch.capacity == 0 {
            return Err(invalid("BRIDGE_DISPATCH_CAPACITY", "must be positive"));
        }
        if dispatch.batch_size == 0 || dispatch.batch_size > dispatch.capacity {
            return Err(invalid(
                "BRIDGE_DISPATCH_BATCH_SIZE",
                "must be positive and not above the dispatch capacity",
            ));
        }
        if dispatch.flush_interval.is_zero() || dispatch.flush_timeout.is_zero() {
            return Err(invalid(
                "BRIDGE_DISPATCH_FLUSH_INTERVAL_MS",
                "flush interval and timeout must be positive",
            ));
        }
        if self.celery.queue.is_empty() || self.celery.task_name.is_empty() {
            return Err(invalid("CELERY_QUEUE", "queue and task name cannot be empty"));
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be interpreted.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// A setting violates a bound.
    #[error("invalid setting {key}: {reason}")]
    Invalid {
        /// Variable name of the setting.
        key: String,
        /// Violated bound.
        reason: String,
    },
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Comma-separated instrument tokens; `None` if any entry is not a `u32`.
fn parse_instrument_list(raw: &str) -> Option<Vec<InstrumentToken>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().ok().map(InstrumentToken::new))
        .collect()
}

struct EnvSource<F>(F);

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const CREDS: [(&str, &str); 2] = [("KITE_API_KEY", "key123"), ("KITE_ACCESS_TOKEN", "tok456")];

    #[test]
    fn credentials_redacted_debug() {
        let creds = Credentials::new("key123".to_string(), "secret456".to_string());
        let debug = format!("{creds:?}");
        assert!(!debug.contains("key123"));
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn missing_credentials_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "KITE_API_KEY"));

        let err = BridgeConfig::from_lookup(lookup(&[
            ("KITE_API_KEY", "k"),
            ("KITE_ACCESS_TOKEN", ""),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(k) if k == "KITE_ACCESS_TOKEN"));
    }

    #[test]
    fn defaults_applied() {
        let config = BridgeConfig::from_lookup(lookup(&CREDS)).unwrap();

        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.websocket.stale_timeout, Duration::from_secs(10));
        assert_eq!(config.websocket.ping_interval, Duration::from_secs(5));
        assert_eq!(config.websocket.max_tokens_per_message, 200);
        assert_eq!(config.subscriptions.max_instruments, 3000);
        assert_eq!(config.subscriptions.default_mode, SubscriptionMode::Full);
        assert_eq!(
            config.subscriptions.default_instruments,
            vec![
                InstrumentToken::new(256_265),
                InstrumentToken::new(260_105),
                InstrumentToken::new(264_969)
            ]
        );
        assert_eq!(config.broadcast.hub_capacity, 16_384);
        assert_eq!(config.dispatch.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.celery.queue, "celery");
        assert_eq!(config.server.health_port, 8083);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_parsed() {
        let mut pairs = CREDS.to_vec();
        pairs.extend([
            ("BRIDGE_DEFAULT_INSTRUMENTS", "101, 102"),
            ("BRIDGE_DEFAULT_MODE", "LTP"),
            ("BRIDGE_DISPATCH_OVERFLOW", "block"),
            ("BRIDGE_DISPATCH_BLOCK_TIMEOUT_MS", "75"),
            ("BRIDGE_STATE_FLUSH_INTERVAL_MS", "100"),
            ("CELERY_QUEUE", "ticks"),
        ]);
        let config = BridgeConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(
            config.subscriptions.default_instruments,
            vec![InstrumentToken::new(101), InstrumentToken::new(102)]
        );
        assert_eq!(config.subscriptions.default_mode, SubscriptionMode::Ltp);
        assert_eq!(
            config.dispatch.overflow,
            OverflowPolicy::BlockWithTimeout(Duration::from_millis(75))
        );
        assert_eq!(config.state_sync.flush_interval, Duration::from_millis(100));
        assert_eq!(config.celery.queue, "ticks");
    }

    #[test]
    fn unparseable_number_falls_back() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("BRIDGE_HEALTH_PORT", "not-a-port"));
        let config = BridgeConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.server.health_port, 8083);
    }

    #[test]
    fn invalid_enumerations_rejected() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("BRIDGE_DEFAULT_MODE", "snapquote"));
        assert!(matches!(
            BridgeConfig::from_lookup(lookup(&pairs)),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut pairs = CREDS.to_vec();
        pairs.push(("BRIDGE_DEFAULT_INSTRUMENTS", "101,abc"));
        assert!(matches!(
            BridgeConfig::from_lookup(lookup(&pairs)),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn validate_rejects_bad_bounds() {
        let mut config = BridgeConfig::with_credentials(Credentials::new("k".into(), "t".into()));
        config.dispatch.batch_size = config.dispatch.capacity + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = BridgeConfig::with_credentials(Credentials::new("k".into(), "t".into()));
        config.websocket.ping_interval = config.websocket.stale_timeout;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::with_credentials(Credentials::new("k".into(), "t".into()));
        config.subscriptions.max_instruments = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overflow_policy_parsing() {
        let timeout = Duration::from_millis(10);
        assert_eq!(
            OverflowPolicy::parse("DROP-OLDEST", timeout),
            Some(OverflowPolicy::DropOldest)
        );
        assert_eq!(
            OverflowPolicy::parse("block", timeout),
            Some(OverflowPolicy::BlockWithTimeout(timeout))
        );
        assert_eq!(OverflowPolicy::parse("spill", timeout), None);
    }
}
