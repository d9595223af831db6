//! Subscription Registry
//!
//! Holds the desired set of instruments and their modes. The registry is the
//! single source of truth for what the ticker must request: after every
//! reconnect the full snapshot is replayed, and while live only the
//! difference between the snapshot and what was already sent goes out.
//!
//! Mutations are idempotent and return the desired-state diff they caused.
//! Each effective mutation bumps a version on a watch channel so the ticker
//! can reconcile without sharing a lock with callers.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::domain::ticks::{InstrumentToken, SubscriptionMode};

// =============================================================================
// Types
// =============================================================================

/// An instrument and the mode it is requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    /// Instrument token.
    pub token: InstrumentToken,
    /// Requested mode.
    pub mode: SubscriptionMode,
}

impl Subscription {
    /// Create a new subscription.
    #[must_use]
    pub const fn new(token: InstrumentToken, mode: SubscriptionMode) -> Self {
        Self { token, mode }
    }
}

/// Change in desired state, expressed as wire actions.
///
/// `subscribe` carries new tokens as well as tokens whose mode changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    /// Subscriptions to request (ordered by token).
    pub subscribe: Vec<Subscription>,
    /// Tokens to drop (ordered).
    pub unsubscribe: Vec<InstrumentToken>,
}

impl SubscriptionDiff {
    /// Diff that requests every entry of a snapshot.
    #[must_use]
    pub fn full(snapshot: &[Subscription]) -> Self {
        Self {
            subscribe: snapshot.to_vec(),
            unsubscribe: Vec::new(),
        }
    }

    /// Actions that turn the `from` state into the `to` state.
    #[must_use]
    pub fn between(from: &[Subscription], to: &[Subscription]) -> Self {
        let from: BTreeMap<_, _> = from.iter().map(|s| (s.token, s.mode)).collect();
        let to: BTreeMap<_, _> = to.iter().map(|s| (s.token, s.mode)).collect();

        let subscribe = to
            .iter()
            .filter(|(token, mode)| from.get(*token) != Some(*mode))
            .map(|(token, mode)| Subscription::new(*token, *mode))
            .collect();
        let unsubscribe = from
            .keys()
            .filter(|token| !to.contains_key(*token))
            .copied()
            .collect();

        Self {
            subscribe,
            unsubscribe,
        }
    }

    /// Check if there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Total number of tokens touched.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.subscribe.len() + self.unsubscribe.len()
    }

    /// Split into diffs touching at most `max_tokens` tokens each.
    ///
    /// Unsubscribes come first, then subscribes; order within each list is
    /// preserved. A `max_tokens` of zero is treated as one.
    #[must_use]
    pub fn chunked(&self, max_tokens: usize) -> Vec<Self> {
        let max_tokens = max_tokens.max(1);
        if self.token_count() <= max_tokens {
            return if self.is_empty() {
                Vec::new()
            } else {
                vec![self.clone()]
            };
        }

        let mut chunks = Vec::new();
        let mut current = Self::default();

        for token in &self.unsubscribe {
            if current.token_count() == max_tokens {
                chunks.push(std::mem::take(&mut current));
            }
            current.unsubscribe.push(*token);
        }
        for sub in &self.subscribe {
            if current.token_count() == max_tokens {
                chunks.push(std::mem::take(&mut current));
            }
            current.subscribe.push(*sub);
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        chunks
    }
}

/// Registry rejection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Subscribing would exceed the per-connection instrument limit.
    #[error("subscription limit of {limit} instruments reached")]
    CapacityExceeded {
        /// Configured limit.
        limit: usize,
    },
    /// Mode change for an instrument that is not subscribed.
    #[error("instrument {0} is not subscribed")]
    NotSubscribed(InstrumentToken),
}

// =============================================================================
// Registry
// =============================================================================

/// Thread-safe desired-state registry.
///
/// Readers always observe a fully applied prior write.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: RwLock<BTreeMap<InstrumentToken, SubscriptionMode>>,
    max_instruments: usize,
    version: watch::Sender<u64>,
}

impl SubscriptionRegistry {
    /// Create an empty registry bounded to `max_instruments`.
    #[must_use]
    pub fn new(max_instruments: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            max_instruments,
            version,
        }
    }

    /// Subscribe to an instrument in a mode.
    ///
    /// Subscribing to an already subscribed instrument in another mode
    /// changes its mode; in the same mode it is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the instrument is new and the registry
    /// is full.
    pub fn subscribe(
        &self,
        token: InstrumentToken,
        mode: SubscriptionMode,
    ) -> Result<SubscriptionDiff, RegistryError> {
        self.subscribe_many(&[Subscription::new(token, mode)])
    }

    /// Subscribe to several instruments atomically.
    ///
    /// Either all entries are applied or, on capacity overflow, none.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the new instruments do not fit.
    pub fn subscribe_many(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<SubscriptionDiff, RegistryError> {
        let mut entries = self.entries.write();

        let mut staged: BTreeMap<InstrumentToken, SubscriptionMode> = BTreeMap::new();
        for sub in subscriptions {
            if entries.get(&sub.token) == Some(&sub.mode) {
                staged.remove(&sub.token);
            } else {
                staged.insert(sub.token, sub.mode);
            }
        }

        let added = staged.keys().filter(|t| !entries.contains_key(*t)).count();
        if entries.len() + added > self.max_instruments {
            return Err(RegistryError::CapacityExceeded {
                limit: self.max_instruments,
            });
        }

        let diff = SubscriptionDiff {
            subscribe: staged
                .iter()
                .map(|(token, mode)| Subscription::new(*token, *mode))
                .collect(),
            unsubscribe: Vec::new(),
        };

        if !diff.is_empty() {
            entries.extend(staged);
            self.bump();
        }
        drop(entries);

        Ok(diff)
    }

    /// Unsubscribe from an instrument. Unknown tokens are a no-op.
    pub fn unsubscribe(&self, token: InstrumentToken) -> SubscriptionDiff {
        let mut entries = self.entries.write();
        if entries.remove(&token).is_none() {
            return SubscriptionDiff::default();
        }
        self.bump();
        drop(entries);

        SubscriptionDiff {
            subscribe: Vec::new(),
            unsubscribe: vec![token],
        }
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
        let mut entries = self.entries.write();
        let current = entries
            .get_mut(&token)
            .ok_or(RegistryError::NotSubscribed(token))?;

        if *current == mode {
            return Ok(SubscriptionDiff::default());
        }
        *current = mode;
        self.bump();
        drop(entries);

        Ok(SubscriptionDiff {
            subscribe: vec![Subscription::new(token, mode)],
            unsubscribe: Vec::new(),
        })
    }

    /// Current desired state, ordered by token.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries
            .read()
            .iter()
            .map(|(token, mode)| Subscription::new(*token, *mode))
            .collect()
    }

    /// Mode an instrument is subscribed in.
    #[must_use]
    pub fn mode_of(&self, token: InstrumentToken) -> Option<SubscriptionMode> {
        self.entries.read().get(&token).copied()
    }

    /// Number of subscribed instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Configured instrument limit.
    #[must_use]
    pub const fn max_instruments(&self) -> usize {
        self.max_instruments
    }

    /// Current version; increases on every effective mutation.
    #[must_use]
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Receiver notified on every effective mutation.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

// =============================================================================
// Tests
// =============================================================================
