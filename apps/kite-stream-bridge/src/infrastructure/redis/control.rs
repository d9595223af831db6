//! Redis Control Keys
//!
//! Operators steer the bridge through a handful of Redis keys:
//!
//! - `kt:flag:stop` = "1" asks the process to stop
//! - `kt:flag:subscriptions_update` = "1" applies the `kt:data:subscriptions`
//!   list and resets the flag to "0". Listed tokens that are not subscribed
//!   yet are added in the default mode; subscribed ones keep their mode.
//! - `kt:flag:is_live` is refreshed with a 3 second expiry while LIVE
//! - `kt:flag:order_update` is set to "1" on every order postback
//!
//! The list is also applied once at start.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{KEY_IS_LIVE, KEY_ORDER_UPDATE, KEY_STOP, KEY_SUBSCRIPTIONS, KEY_SUBSCRIPTIONS_UPDATE};
use crate::application::services::SubscriptionHandle;
use crate::domain::subscription::Subscription;
use crate::domain::ticks::{InstrumentToken, SubscriptionMode};
use crate::infrastructure::kite::{ConnectionSnapshot, ConnectionState, ControlMessage};

const IS_LIVE_TTL_SECS: u64 = 3;

/// Polls the control keys and mirrors pipeline events into Redis.
pub struct ControlPoller {
    conn: ConnectionManager,
    subscriptions: SubscriptionHandle,
    default_mode: SubscriptionMode,
    connection: watch::Receiver<ConnectionSnapshot>,
    control: broadcast::Receiver<ControlMessage>,
    shutdown_requested: CancellationToken,
    poll_interval: Duration,
}

impl ControlPoller {
    /// Create a poller.
    #[must_use]
    pub const fn new(
        conn: ConnectionManager,
        subscriptions: SubscriptionHandle,
        default_mode: SubscriptionMode,
        connection: watch::Receiver<ConnectionSnapshot>,
        control: broadcast::Receiver<ControlMessage>,
        shutdown_requested: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            conn,
            subscriptions,
            default_mode,
            connection,
            control,
            shutdown_requested,
            poll_interval,
        }
    }

    /// Poll until cancelled. Redis errors are logged and retried next poll.
    pub async fn run(mut self, cancel: CancellationToken) {
        if let Err(e) = self.apply_subscription_list().await {
            tracing::warn!(error = %e, "Initial subscription list sync failed");
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll().await {
                        tracing::warn!(error = %e, "Control key poll failed");
                    }
                }
                message = self.control.recv() => match message {
                    Ok(ControlMessage::OrderUpdate(_)) => {
                        if let Err(e) = self.flag_order_update().await {
                            tracing::warn!(error = %e, "Failed to set order update flag");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Control poller missed control messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        tracing::debug!("Control poller stopped");
    }

    async fn poll(&mut self) -> redis::RedisResult<()> {
        let stop: Option<String> = self.conn.get(KEY_STOP).await?;
        if flag_set(stop.as_deref()) && !self.shutdown_requested.is_cancelled() {
            tracing::info!(key = KEY_STOP, "Stop requested through Redis");
            self.shutdown_requested.cancel();
        }

        let update: Option<String> = self.conn.get(KEY_SUBSCRIPTIONS_UPDATE).await?;
        if flag_set(update.as_deref()) {
            self.apply_subscription_list().await?;
            let (): () = self.conn.set(KEY_SUBSCRIPTIONS_UPDATE, "0").await?;
        }

        if self.connection.borrow().state == ConnectionState::Live {
            let (): () = self.conn.set_ex(KEY_IS_LIVE, "1", IS_LIVE_TTL_SECS).await?;
        }

        Ok(())
    }

    async fn apply_subscription_list(&mut self) -> redis::RedisResult<()> {
        let raw: Vec<String> = self.conn.lrange(KEY_SUBSCRIPTIONS, 0, -1).await?;
        let tokens = parse_token_list(&raw);
        if tokens.is_empty() {
            return Ok(());
        }

        let requested = unsubscribed(tokens, self.default_mode, &self.subscriptions);
        if requested.is_empty() {
            tracing::debug!("Subscription list already applied");
            return Ok(());
        }
        match self.subscriptions.subscribe_many(&requested) {
            Ok(diff) => tracing::info!(
                requested = requested.len(),
                changed = diff.token_count(),
                "Applied subscription list from Redis"
            ),
            Err(e) => tracing::warn!(error = %e, "Subscription list rejected"),
        }
        Ok(())
    }

    async fn flag_order_update(&mut self) -> redis::RedisResult<()> {
        let (): () = self.conn.set(KEY_ORDER_UPDATE, "1").await?;
        Ok(())
    }
}

/// Listed tokens not yet subscribed, in `mode`.
fn unsubscribed(
    tokens: Vec<InstrumentToken>,
    mode: SubscriptionMode,
    subscriptions: &SubscriptionHandle,
) -> Vec<Subscription> {
    tokens
        .into_iter()
        .filter(|token| subscriptions.mode_of(*token).is_none())
        .map(|token| Subscription::new(token, mode))
        .collect()
}

fn flag_set(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim() == "1")
}

/// Parse list entries into tokens, skipping (and logging) invalid ones.
fn parse_token_list(raw: &[String]) -> Vec<InstrumentToken> {
    raw.iter()
        .filter_map(|entry| match entry.trim().parse::<u32>() {
            Ok(value) => Some(InstrumentToken::new(value)),
            Err(_) => {
                tracing::warn!(entry = %entry, "Ignoring invalid token in subscription list");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use test_case::test_case;

    use super::*;
    use crate::application::services::StateSync;
    use crate::domain::subscription::SubscriptionRegistry;
    use crate::infrastructure::config::StateSyncSettings;
    use crate::infrastructure::memory::InMemoryStateStore;

    #[test_case(Some("1"), true ; "set")]
    #[test_case(Some(" 1 "), true ; "padded")]
    #[test_case(Some("0"), false ; "cleared")]
    #[test_case(None, false ; "missing")]
    fn flag_values(value: Option<&str>, expected: bool) {
        assert_eq!(flag_set(value), expected);
    }

    #[test]
    fn token_list_skips_garbage() {
        let raw = vec!["256265".to_string(), "nifty".to_string(), " 408065".to_string()];
        assert_eq!(
            parse_token_list(&raw),
            vec![InstrumentToken::new(256_265), InstrumentToken::new(408_065)]
        );
    }

    #[test]
    fn list_keeps_modes_set_by_operators() {
        let state = Arc::new(StateSync::new(
            Arc::new(InMemoryStateStore::new()),
            StateSyncSettings::default(),
        ));
        let handle = SubscriptionHandle::new(Arc::new(SubscriptionRegistry::new(10)), state);
        let nifty = InstrumentToken::new(256_265);
        let infy = InstrumentToken::new(408_065);
        handle.subscribe(nifty, SubscriptionMode::Full).unwrap();
        handle.change_mode(nifty, SubscriptionMode::Ltp).unwrap();

        let requested = unsubscribed(vec![nifty, infy], SubscriptionMode::Quote, &handle);
        assert_eq!(requested, vec![Subscription::new(infy, SubscriptionMode::Quote)]);

        handle.subscribe_many(&requested).unwrap();
        assert_eq!(handle.mode_of(nifty), Some(SubscriptionMode::Ltp));
        assert_eq!(handle.mode_of(infy), Some(SubscriptionMode::Quote));
        assert!(unsubscribed(vec![nifty, infy], SubscriptionMode::Quote, &handle).is_empty());
    }
}
