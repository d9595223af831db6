//! Redis Adapters
//!
//! The bridge shares one Redis instance with the Celery workers and the
//! operators' tooling:
//!
//! - **store**: `StateStore` over `kt:state:{token}` / `kt:ltp:{token}`
//! - **celery**: `TaskQueue` speaking the Celery v2 message protocol
//! - **control**: polling of the `kt:flag:*` control keys

pub mod celery;
pub mod control;
pub mod store;

pub use celery::CeleryTaskQueue;
pub use control::ControlPoller;
pub use store::RedisStateStore;

use redis::aio::ConnectionManager;

use crate::domain::ticks::InstrumentToken;

/// Set to "1" to stop the bridge.
pub const KEY_STOP: &str = "kt:flag:stop";
/// Set to "1" after editing `KEY_SUBSCRIPTIONS`; reset to "0" once applied.
pub const KEY_SUBSCRIPTIONS_UPDATE: &str = "kt:flag:subscriptions_update";
/// Refreshed with a short expiry while the ticker is LIVE.
pub const KEY_IS_LIVE: &str = "kt:flag:is_live";
/// Set to "1" when an order update arrives.
pub const KEY_ORDER_UPDATE: &str = "kt:flag:order_update";
/// List of instrument tokens requested by operators.
pub const KEY_SUBSCRIPTIONS: &str = "kt:data:subscriptions";

/// Key holding the JSON state of an instrument.
#[must_use]
pub fn state_key(token: InstrumentToken) -> String {
    format!("kt:state:{token}")
}

/// Key holding the last price of an instrument.
#[must_use]
pub fn ltp_key(token: InstrumentToken) -> String {
    format!("kt:ltp:{token}")
}

/// Open a managed connection (reconnects transparently).
///
/// # Errors
///
/// Returns the Redis error if the URL is invalid or the first connection fails.
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    let client = redis::Client::open(url)?;
    client.get_connection_manager().await
}

/// Strip the password from a Redis URL for logging.
#[must_use]
pub fn redact_password(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    let rest = &url[scheme_end..];
    match (rest.find('@'), rest.find(':')) {
        (Some(at), Some(colon)) if colon < at => format!(
            "{}{}:[REDACTED]{}",
            &url[..scheme_end],
            &rest[..colon],
            &rest[at..]
        ),
        _ => url.to_string(),
    }
}
