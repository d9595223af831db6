//! Kite Ticker Client
//!
//! Owns the single streaming connection to the Kite ticker and drives it
//! through its lifecycle:
//!
//! ```text
//! DISCONNECTED → CONNECTING → AUTHENTICATING → SUBSCRIBING → LIVE
//!       ↑                                                     │
//!       └──────── (backoff) ──────── RECONNECTING ◄───────────┘ (any error)
//!
//! any state ── stop ──► CLOSING → DISCONNECTED
//! ```
//!
//! The connection state is owned by the task running [`Ticker::run`];
//! everyone else observes immutable [`ConnectionSnapshot`]s on a watch
//! channel. Decoded ticks are stamped with a process-wide sequence number
//! and published to the broadcast hub.
//!
//! Subscriptions are reconciled against the registry: SUBSCRIBING replays the
//! full snapshot, and while LIVE each registry change sends only the diff
//! between the snapshot and what this connection has already requested.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthError, authorized_url, redact_url};
use super::codec::{CodecError, ControlMessage, FeedMessage, FrameCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor};
use crate::application::ports::{
    AccessTokenProvider, FeedSession, FeedTransport, InboundFrame, OutboundFrame,
    TransportError,
};
use crate::domain::backoff::{Backoff, BackoffConfig};
use crate::domain::subscription::{Subscription, SubscriptionDiff, SubscriptionRegistry};
use crate::domain::ticks::{SequenceSource, TickEvent};
use crate::infrastructure::broadcast::BroadcastHub;
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end a ticker session.
#[derive(Debug, thiserror::Error)]
pub enum TickerError {
    /// Transport failed (always retried).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Authentication failed (retried, health degraded).
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Too many consecutive malformed frames.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Outbound command could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No frame within the stale timeout.
    #[error("connection stale, silent for {0:?}")]
    Stale(Duration),

    /// Server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

impl TickerError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Auth(_) => "auth",
            Self::Protocol(_) => "protocol",
            Self::Codec(_) => "codec",
            Self::Stale(_) => "stale",
            Self::ConnectionClosed => "closed",
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of the ticker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Waiting for the first frame.
    Authenticating,
    /// Replaying the registry snapshot.
    Subscribing,
    /// Streaming.
    Live,
    /// Waiting out the backoff delay.
    Reconnecting,
    /// Shutting down.
    Closing,
}

impl ConnectionState {
    /// State name for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribing => "subscribing",
            Self::Live => "live",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        }
    }

    const fn ordinal(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Authenticating => 2,
            Self::Subscribing => 3,
            Self::Live => 4,
            Self::Reconnecting => 5,
            Self::Closing => 6,
        }
    }
}

/// Immutable view of the connection published on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// Set after an authentication failure until the next LIVE.
    pub degraded: bool,
    /// Reconnects since start.
    pub reconnects: u64,
    /// Error that ended the previous session.
    pub last_error: Option<String>,
    /// When the current state was entered.
    pub since: DateTime<Utc>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            degraded: false,
            reconnects: 0,
            last_error: None,
            since: Utc::now(),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the ticker.
#[derive(Debug, Clone)]
pub struct TickerConfig {
    /// Ticker endpoint without credentials.
    pub url: String,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Deadline for the first frame after connecting.
    pub auth_timeout: Duration,
    /// Malformed frames in a row that end the session.
    pub max_consecutive_malformed: u32,
    /// Tokens per outbound command.
    pub max_tokens_per_message: usize,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self::from_websocket_settings(&crate::WebSocketSettings::default())
    }
}

impl TickerConfig {
    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub fn from_websocket_settings(settings: &crate::WebSocketSettings) -> Self {
        Self {
            url: settings.url.clone(),
            heartbeat: HeartbeatConfig::from_websocket_settings(settings),
            backoff: BackoffConfig::from_websocket_settings(settings),
            auth_timeout: settings.auth_timeout,
            max_consecutive_malformed: settings.max_consecutive_malformed,
            max_tokens_per_message: settings.max_tokens_per_message,
        }
    }
}

// =============================================================================
// Ticker
// =============================================================================

/// Kite ticker connection manager.
pub struct Ticker {
    config: TickerConfig,
    transport: Arc<dyn FeedTransport>,
    tokens: Arc<dyn AccessTokenProvider>,
    registry: Arc<SubscriptionRegistry>,
    hub: Arc<BroadcastHub>,
    sequence: Arc<SequenceSource>,
    codec: FrameCodec,
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    reconnects: u64,
    degraded: bool,
    last_error: Option<String>,
    live_since: Option<Instant>,
    malformed_streak: u32,
}

impl Ticker {
    /// Create a new ticker.
    #[must_use]
    pub fn new(
        config: TickerConfig,
        transport: Arc<dyn FeedTransport>,
        tokens: Arc<dyn AccessTokenProvider>,
        registry: Arc<SubscriptionRegistry>,
        hub: Arc<BroadcastHub>,
        cancel: CancellationToken,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            config,
            transport,
            tokens,
            registry,
            hub,
            sequence: Arc::new(SequenceSource::new()),
            codec: FrameCodec::new(),
            cancel,
            snapshot_tx,
            reconnects: 0,
            degraded: false,
            last_error: None,
            live_since: None,
            malformed_streak: 0,
        }
    }

    /// Receiver of connection snapshots.
    #[must_use]
    pub fn snapshots(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Sequence source shared with observers.
    #[must_use]
    pub fn sequence(&self) -> Arc<SequenceSource> {
        Arc::clone(&self.sequence)
    }

    /// Run the connection loop until cancelled.
    ///
    /// Errors never escape: every failure leads to RECONNECTING and a new
    /// attempt after the backoff delay.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut changes = self.registry.changes();
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.connect_and_run(&mut changes).await {
                Ok(()) => break,
                Err(e) => {
                    if let Some(live_since) = self.live_since.take()
                        && backoff.record_live_period(live_since.elapsed())
                    {
                        tracing::debug!("Connection was stable, backoff reset");
                    }

                    tracing::warn!(error = %e, kind = e.kind(), "Ticker session ended");
                    if matches!(e, TickerError::Auth(_)) {
                        self.degraded = true;
                    }
                    self.last_error = Some(e.to_string());
                    self.reconnects += 1;
                    metrics::record_reconnect(e.kind());
                    self.transition(ConnectionState::Reconnecting);

                    let delay = backoff.next_delay();
                    tracing::info!(
                        attempt = backoff.attempt_count(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting to Kite ticker"
                    );

                    tokio::select! {
                        () = cancel.cancelled() => {
                            tracing::info!("Ticker cancelled during reconnect delay");
                            self.transition(ConnectionState::Closing);
                            break;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }

                    self.transition(ConnectionState::Disconnected);
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        tracing::info!(
            reconnects = self.reconnects,
            last_sequence = self.sequence.last(),
            "Ticker stopped"
        );
    }

    /// One session: connect, authenticate, subscribe, stream.
    ///
    /// Returns `Ok(())` only when cancelled.
    async fn connect_and_run(
        &mut self,
        changes: &mut watch::Receiver<u64>,
    ) -> Result<(), TickerError> {
        let cancel = self.cancel.clone();
        self.transition(ConnectionState::Connecting);
        self.malformed_streak = 0;

        let access_token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| AuthError::TokenUnavailable(e.to_string()))?;
        let url = authorized_url(&self.config.url, self.tokens.api_key(), &access_token);
        tracing::info!(url = %redact_url(&url), "Connecting to Kite ticker");

        let connected = tokio::select! {
            () = cancel.cancelled() => {
                self.transition(ConnectionState::Closing);
                return Ok(());
            }
            result = self.transport.connect(&url) => result,
        };
        let mut session = match connected {
            Ok(session) => session,
            Err(TransportError::Unauthorized(reason)) => {
                return Err(AuthError::Rejected(reason).into());
            }
            Err(e) => return Err(e.into()),
        };

        // Authenticating
        self.transition(ConnectionState::Authenticating);
        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat.clone());
        let first = tokio::select! {
            () = cancel.cancelled() => {
                self.close(session.as_mut()).await;
                return Ok(());
            }
            first = tokio::time::timeout(self.config.auth_timeout, session.recv()) => first,
        };
        let first = match first {
            Err(_) => return Err(AuthError::Timeout(self.config.auth_timeout).into()),
            Ok(None | Some(Ok(InboundFrame::Close))) => {
                return Err(AuthError::ClosedDuringHandshake.into());
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(frame))) => frame,
        };
        if let InboundFrame::Text(text) = &first
            && let Ok(ControlMessage::ServerError(reason)) = self.codec.decode_text(text)
        {
            return Err(AuthError::Rejected(reason).into());
        }
        heartbeat.record_frame();
        tracing::debug!("Ticker authenticated");

        // Subscribing
        self.transition(ConnectionState::Subscribing);
        changes.borrow_and_update();
        let mut wire_state = self.registry.snapshot();
        let replay = SubscriptionDiff::full(&wire_state);
        let replayed = tokio::select! {
            () = cancel.cancelled() => None,
            result = self.send_diff(session.as_mut(), &replay) => Some(result),
        };
        match replayed {
            None => {
                // The send may be stuck; drop the session instead of closing it.
                self.transition(ConnectionState::Closing);
                return Ok(());
            }
            Some(result) => result?,
        }
        metrics::set_subscriptions(wire_state.len());
        tracing::info!(instruments = wire_state.len(), "Subscriptions replayed");

        // Live
        self.degraded = false;
        self.live_since = Some(Instant::now());
        self.transition(ConnectionState::Live);
        self.handle_frame(first)?;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.close(session.as_mut()).await;
                    return Ok(());
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        // Registry gone: nothing left to reconcile against.
                        self.close(session.as_mut()).await;
                        return Ok(());
                    }
                    wire_state = self.reconcile(session.as_mut(), wire_state).await?;
                }
                event = heartbeat.next_event() => match event {
                    HeartbeatEvent::SendPing => session.send(OutboundFrame::Ping).await?,
                    HeartbeatEvent::Stale { silent_for } => {
                        return Err(TickerError::Stale(silent_for));
                    }
                },
                frame = session.recv() => match frame {
                    Some(Ok(frame)) => {
                        heartbeat.record_frame();
                        self.handle_frame(frame)?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(TickerError::ConnectionClosed),
                },
            }
        }
    }

    /// Send the diff between the registry and the wire; returns the new wire state.
    async fn reconcile(
        &self,
        session: &mut dyn FeedSession,
        wire_state: Vec<Subscription>,
    ) -> Result<Vec<Subscription>, TickerError> {
        let snapshot = self.registry.snapshot();
        let diff = SubscriptionDiff::between(&wire_state, &snapshot);
        if diff.is_empty() {
            return Ok(wire_state);
        }

        tracing::info!(
            subscribe = diff.subscribe.len(),
            unsubscribe = diff.unsubscribe.len(),
            "Reconciling subscriptions"
        );
        self.send_diff(session, &diff).await?;
        metrics::set_subscriptions(snapshot.len());
        Ok(snapshot)
    }

    async fn send_diff(
        &self,
        session: &mut dyn FeedSession,
        diff: &SubscriptionDiff,
    ) -> Result<(), TickerError> {
        let max = self.config.max_tokens_per_message;
        for chunk in diff.chunked(max) {
            for text in self.codec.encode(&chunk, max)? {
                session.send(OutboundFrame::Text(text)).await?;
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: InboundFrame) -> Result<(), TickerError> {
        let decoded = match frame {
            InboundFrame::Binary(bytes) => self.codec.decode(&bytes),
            InboundFrame::Text(text) => self
                .codec
                .decode_text(&text)
                .map(|control| vec![FeedMessage::Control(control)]),
            InboundFrame::Keepalive => return Ok(()),
            InboundFrame::Close => return Err(TickerError::ConnectionClosed),
        };

        let messages = match decoded {
            Ok(messages) => messages,
            Err(e) => {
                self.malformed_streak += 1;
                metrics::record_malformed_frame();
                tracing::warn!(
                    error = %e,
                    streak = self.malformed_streak,
                    "Skipping malformed frame"
                );
                if self.malformed_streak >= self.config.max_consecutive_malformed {
                    return Err(TickerError::Protocol(format!(
                        "{} consecutive malformed frames, last: {e}",
                        self.malformed_streak
                    )));
                }
                return Ok(());
            }
        };
        self.malformed_streak = 0;

        let received_at = Utc::now();
        let mut ticks = 0u64;
        for message in messages {
            match message {
                FeedMessage::Tick(tick) => {
                    let event = TickEvent::new(self.sequence.next(), received_at, tick);
                    self.hub.publish_tick(Arc::new(event));
                    ticks += 1;
                }
                FeedMessage::Control(ControlMessage::Heartbeat) => {
                    tracing::trace!("Server heartbeat");
                }
                FeedMessage::Control(control) => {
                    let kind = match &control {
                        ControlMessage::ServerError(reason) => {
                            tracing::warn!(reason = %reason, "Ticker server error");
                            "error"
                        }
                        ControlMessage::ServerMessage(text) => {
                            tracing::info!(message = %text, "Ticker server message");
                            "message"
                        }
                        ControlMessage::OrderUpdate(_) => "order",
                        ControlMessage::Heartbeat => "heartbeat",
                    };
                    metrics::record_control_message(kind);
                    self.hub.publish_control(control);
                }
            }
        }
        if ticks > 0 {
            metrics::record_ticks_received(ticks);
        }

        Ok(())
    }

    async fn close(&mut self, session: &mut dyn FeedSession) {
        self.transition(ConnectionState::Closing);
        session.close().await;
    }

    fn transition(&self, state: ConnectionState) {
        let snapshot = ConnectionSnapshot {
            state,
            degraded: self.degraded,
            reconnects: self.reconnects,
            last_error: self.last_error.clone(),
            since: Utc::now(),
        };
        tracing::debug!(state = state.as_str(), "Ticker state transition");
        metrics::record_state_transition(state.as_str(), state.ordinal());
        self.snapshot_tx.send_replace(snapshot);
    }
}
