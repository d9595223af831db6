//! Subscription Handle
//!
//! Caller-facing control surface over the registry. Mutations are
//! acknowledged as soon as the registry has applied them; the ticker picks
//! the change up from the registry's version channel and puts the diff on
//! the wire when it is LIVE.

use std::sync::Arc;

use crate::domain::subscription::{
    RegistryError, Subscription, SubscriptionDiff, SubscriptionRegistry,
};
use crate::domain::ticks::{InstrumentToken, SubscriptionMode};
use crate::infrastructure::metrics;

use super::state_sync::StateSync;

/// Cloneable handle for changing subscriptions.
#[derive(Clone)]
pub struct SubscriptionHandle {
    registry: Arc<SubscriptionRegistry>,
    state: Arc<StateSync>,
}

impl SubscriptionHandle {
    /// Create a handle over the registry and the state it owns per token.
    #[must_use]
    pub const fn new(registry: Arc<SubscriptionRegistry>, state: Arc<StateSync>) -> Self {
        Self { registry, state }
    }

    /// Subscribe to an instrument (or change its mode if already subscribed).
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the registry is full.
    pub fn subscribe(
        &self,
        token: InstrumentToken,
        mode: SubscriptionMode,
    ) -> Result<SubscriptionDiff, RegistryError> {
        let diff = self.registry.subscribe(token, mode)?;
        self.log_change("subscribe", &diff);
        Ok(diff)
    }

    /// Subscribe to several instruments, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the instruments do not fit.
    pub fn subscribe_many(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<SubscriptionDiff, RegistryError> {
        let diff = self.registry.subscribe_many(subscriptions)?;
        self.log_change("subscribe", &diff);
        Ok(diff)
    }

    /// Unsubscribe and discard the instrument's state.
    ///
    /// A failed store delete is logged; the registry change stands.
    pub async fn unsubscribe(&self, token: InstrumentToken) -> SubscriptionDiff {
        let diff = self.registry.unsubscribe(token);
        if diff.is_empty() {
            return diff;
        }

        self.log_change("unsubscribe", &diff);
        if let Err(e) = self.state.remove(token).await {
            tracing::warn!(token = %token, error = %e, "Failed to discard state of unsubscribed instrument");
        }
        diff
    }

    /// Change the mode of a subscribed instrument.
    ///
    /// # Errors
    ///
    /// Returns `NotSubscribed` if the instrument is not in the registry.
    pub fn change_mode(
        &self,
        token: InstrumentToken,
        mode: SubscriptionMode,
    ) -> Result<SubscriptionDiff, RegistryError> {
        let diff = self.registry.change_mode(token, mode)?;
        self.log_change("mode", &diff);
        Ok(diff)
    }

    /// Desired subscriptions ordered by token.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.registry.snapshot()
    }

    /// Current mode of an instrument.
    #[must_use]
    pub fn mode_of(&self, token: InstrumentToken) -> Option<SubscriptionMode> {
        self.registry.mode_of(token)
    }

    fn log_change(&self, action: &'static str, diff: &SubscriptionDiff) {
        if diff.is_empty() {
            return;
        }
        metrics::set_subscriptions(self.registry.len());
        tracing::info!(
            action,
            tokens = diff.token_count(),
            total = self.registry.len(),
            "Subscriptions changed"
        );
    }
}
