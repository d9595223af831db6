//! Configuration Module
//!
//! Configuration loading for the bridge service.

mod settings;

pub use settings::{
    BridgeConfig, BroadcastSettings, CelerySettings, ConfigError, Credentials,
    DEFAULT_CELERY_TASK, DEFAULT_INSTRUMENTS, DEFAULT_REDIS_URL, DEFAULT_TICKER_URL,
    DispatchSettings, OverflowPolicy, ServerSettings, StateSyncSettings, SubscriptionSettings,
    WebSocketSettings,
};
