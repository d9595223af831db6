//! Kite Ticker Message Types
//!
//! Serde representations of the JSON text frames exchanged with the ticker.
//! Binary tick packets are parsed by hand in the codec; everything textual
//! lives here.
//!
//! # Inbound
//!
//! ```json
//! {"type": "order", "data": {"order_id": "...", "status": "COMPLETE"}}
//! {"type": "error", "data": "Invalid instrument token"}
//! {"type": "message", "data": "..."}
//! ```
//!
//! # Outbound
//!
//! ```json
//! {"a": "subscribe", "v": [256265, 260105]}
//! {"a": "unsubscribe", "v": [260105]}
//! {"a": "mode", "v": ["full", [256265]]}
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::ticks::{InstrumentToken, SubscriptionMode};

// =============================================================================
// Inbound
// =============================================================================

/// JSON text frame sent by the ticker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum TextMessage {
    /// Order postback for the connected user.
    Order(serde_json::Value),
    /// Error reported by the server.
    Error(serde_json::Value),
    /// Informational message.
    Message(serde_json::Value),
}

/// Render a `data` payload as plain text (strings unquoted).
#[must_use]
pub fn payload_text(value: &serde_json::Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), ToString::to_string)
}

// =============================================================================
// Outbound
// =============================================================================

/// Command sent to the ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "a", content = "v", rename_all = "lowercase")]
pub enum Command {
    /// Start streaming the tokens (in the server's default mode).
    Subscribe(Vec<InstrumentToken>),
    /// Stop streaming the tokens.
    Unsubscribe(Vec<InstrumentToken>),
    /// Set the mode of already subscribed tokens.
    Mode((SubscriptionMode, Vec<InstrumentToken>)),
}

impl Command {
    /// Tokens carried by the command.
    #[must_use]
    pub fn tokens(&self) -> &[InstrumentToken] {
        match self {
            Self::Subscribe(tokens) | Self::Unsubscribe(tokens) | Self::Mode((_, tokens)) => {
                tokens
            }
        }
    }

    /// Command name on the wire.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Mode(_) => "mode",
        }
    }
}
