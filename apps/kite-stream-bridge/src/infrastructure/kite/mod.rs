//! Kite Ticker Adapters
//!
//! Implements the streaming client for the Kite ticker:
//!
//! - **codec**: binary tick frames and JSON text frames
//! - **ticker**: connection lifecycle, subscription replay, reconnects
//! - **transport**: `tokio-tungstenite` WebSocket adapter

pub mod auth;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod ticker;
pub mod transport;

pub use auth::{AuthError, StaticAccessToken, authorized_url, redact_url};
pub use codec::{CodecError, ControlMessage, FeedMessage, FrameCodec};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor};
pub use messages::{Command, TextMessage};
pub use ticker::{ConnectionSnapshot, ConnectionState, Ticker, TickerConfig, TickerError};
pub use transport::{WsSession, WsTransport};
