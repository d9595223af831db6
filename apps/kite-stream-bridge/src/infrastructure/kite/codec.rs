//! Kite Frame Codec
//!
//! Decodes ticker frames into typed messages and encodes subscription diffs
//! into outbound commands. The codec is stateless.
//!
//! # Binary Frame Layout
//!
//! All integers are big-endian.
//!
//! ```text
//! +---------+---------+-----------+---------+-----------+ ...
//! | count   | len 1   | packet 1  | len 2   | packet 2  |
//! | u16     | u16     | len 1 B   | u16     | len 2 B   |
//! +---------+---------+-----------+---------+-----------+ ...
//! ```
//!
//! | Length | Packet                                   |
//! |--------|------------------------------------------|
//! | 8      | LTP                                      |
//! | 28     | Index quote                              |
//! | 32     | Index full (quote + exchange timestamp)  |
//! | 44     | Quote                                    |
//! | 184    | Full (quote + OI, timestamps, depth)     |
//!
//! A one-byte frame is a server heartbeat.

use bytes::Buf;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::subscription::SubscriptionDiff;
use crate::domain::ticks::{
    DepthLevel, InstrumentToken, MarketDepth, Ohlc, SubscriptionMode, Tick,
};
use crate::infrastructure::kite::messages::{Command, TextMessage, payload_text};

const LTP_PACKET: usize = 8;
const INDEX_QUOTE_PACKET: usize = 28;
const INDEX_FULL_PACKET: usize = 32;
const QUOTE_PACKET: usize = 44;
const FULL_PACKET: usize = 184;

const DEPTH_OFFSET: usize = 64;
const DEPTH_ENTRY: usize = 12;
const DEPTH_LEVELS: usize = 5;

/// Non-tick message carried by the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// One-byte keepalive frame.
    Heartbeat,
    /// Order postback (raw JSON).
    OrderUpdate(serde_json::Value),
    /// Error reported by the server.
    ServerError(String),
    /// Informational server message.
    ServerMessage(String),
}

/// Decoded unit of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Market data packet.
    Tick(Tick),
    /// Control message.
    Control(ControlMessage),
}

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame does not match the binary layout.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Text frame is not a known JSON message.
    #[error("malformed text frame: {0}")]
    MalformedText(#[from] serde_json::Error),

    /// Diff touches more tokens than one command may carry.
    #[error("diff touches {count} tokens, limit is {limit}")]
    OversizedDiff {
        /// Tokens in the diff.
        count: usize,
        /// Per-command limit.
        limit: usize,
    },
}

/// Kite ticker frame codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a binary frame, packets in wire order.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` if a declared length runs past the frame,
    /// a packet has an unknown length, or bytes trail the last packet.
    pub fn decode(&self, frame: &[u8]) -> Result<Vec<FeedMessage>, CodecError> {
        match frame.len() {
            0 => return Err(malformed("empty frame")),
            1 => return Ok(vec![FeedMessage::Control(ControlMessage::Heartbeat)]),
            _ => {}
        }

        let mut buf = frame;
        let count = usize::from(buf.get_u16());
        let mut messages = Vec::with_capacity(count);

        for index in 0..count {
            if buf.remaining() < 2 {
                return Err(malformed(format!(
                    "packet {index} of {count}: missing length prefix"
                )));
            }
            let len = usize::from(buf.get_u16());
            if buf.remaining() < len {
                return Err(malformed(format!(
                    "packet {index} of {count}: declared {len} bytes, {} remaining",
                    buf.remaining()
                )));
            }
            let (packet, rest) = buf.split_at(len);
            messages.push(FeedMessage::Tick(decode_packet(packet)?));
            buf = rest;
        }

        if buf.has_remaining() {
            return Err(malformed(format!(
                "{} trailing bytes after {count} packets",
                buf.remaining()
            )));
        }

        Ok(messages)
    }

    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns `MalformedText` if the text is not a known message.
    pub fn decode_text(&self, text: &str) -> Result<ControlMessage, CodecError> {
        let message: TextMessage = serde_json::from_str(text)?;
        Ok(match message {
            TextMessage::Order(data) => ControlMessage::OrderUpdate(data),
            TextMessage::Error(data) => ControlMessage::ServerError(payload_text(&data)),
            TextMessage::Message(data) => ControlMessage::ServerMessage(payload_text(&data)),
        })
    }

    /// Commands for a diff, in send order.
    ///
    /// Unsubscribe first, then subscribe for every requested token, then one
    /// mode command per mode present.
    #[must_use]
    pub fn commands(&self, diff: &SubscriptionDiff) -> Vec<Command> {
        let mut commands = Vec::new();

        if !diff.unsubscribe.is_empty() {
            commands.push(Command::Unsubscribe(diff.unsubscribe.clone()));
        }
        if !diff.subscribe.is_empty() {
            commands.push(Command::Subscribe(
                diff.subscribe.iter().map(|s| s.token).collect(),
            ));
            for mode in SubscriptionMode::all() {
                let tokens: Vec<InstrumentToken> = diff
                    .subscribe
                    .iter()
                    .filter(|s| s.mode == *mode)
                    .map(|s| s.token)
                    .collect();
                if !tokens.is_empty() {
                    commands.push(Command::Mode((*mode, tokens)));
                }
            }
        }

        commands
    }

    /// Encode a diff into JSON text frames.
    ///
    /// # Errors
    ///
    /// Returns `OversizedDiff` if the diff touches more than
    /// `max_tokens_per_message` tokens; callers chunk first.
    pub fn encode(
        &self,
        diff: &SubscriptionDiff,
        max_tokens_per_message: usize,
    ) -> Result<Vec<String>, CodecError> {
        let count = diff.token_count();
        if count > max_tokens_per_message {
            return Err(CodecError::OversizedDiff {
                count,
                limit: max_tokens_per_message,
            });
        }

        self.commands(diff)
            .iter()
            .map(|command| serde_json::to_string(command).map_err(CodecError::from))
            .collect()
    }
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedFrame(reason.into())
}

// =============================================================================
// Packet parsing
// =============================================================================

/// Fixed-layout packet reader; offsets are validated by the packet length.
struct Packet<'a>(&'a [u8]);

impl Packet<'_> {
    fn u32_at(&self, offset: usize) -> u32 {
        let b = &self.0[offset..offset + 4];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.0[offset], self.0[offset + 1]])
    }

    fn price_at(&self, offset: usize, scale: u32) -> Decimal {
        Decimal::new(i64::from(self.u32_at(offset)), scale)
    }

    fn time_at(&self, offset: usize) -> Option<DateTime<Utc>> {
        match self.u32_at(offset) {
            0 => None,
            secs => DateTime::from_timestamp(i64::from(secs), 0),
        }
    }
}

fn decode_packet(bytes: &[u8]) -> Result<Tick, CodecError> {
    let packet = Packet(bytes);

    match bytes.len() {
        LTP_PACKET => {
            let token = InstrumentToken::new(packet.u32_at(0));
            let scale = token.segment().price_scale();
            Ok(Tick::ltp(token, packet.price_at(4, scale)))
        }
        INDEX_QUOTE_PACKET | INDEX_FULL_PACKET => Ok(decode_index(&packet, bytes.len())),
        QUOTE_PACKET | FULL_PACKET => Ok(decode_quote(&packet, bytes.len())),
        other => Err(malformed(format!("unknown packet length {other}"))),
    }
}

fn decode_index(packet: &Packet<'_>, len: usize) -> Tick {
    let token = InstrumentToken::new(packet.u32_at(0));
    let scale = token.segment().price_scale();
    let last_price = packet.price_at(4, scale);
    let ohlc = Ohlc {
        high: packet.price_at(8, scale),
        low: packet.price_at(12, scale),
        open: packet.price_at(16, scale),
        close: packet.price_at(20, scale),
    };

    let mut tick = Tick::ltp(token, last_price);
    tick.mode = if len == INDEX_FULL_PACKET {
        SubscriptionMode::Full
    } else {
        SubscriptionMode::Quote
    };
    tick.change = Some(percent_change(last_price, ohlc.close));
    tick.ohlc = Some(ohlc);
    if len == INDEX_FULL_PACKET {
        tick.exchange_timestamp = packet.time_at(28);
    }
    tick
}

fn decode_quote(packet: &Packet<'_>, len: usize) -> Tick {
    let token = InstrumentToken::new(packet.u32_at(0));
    let scale = token.segment().price_scale();
    let last_price = packet.price_at(4, scale);
    let ohlc = Ohlc {
        open: packet.price_at(28, scale),
        high: packet.price_at(32, scale),
        low: packet.price_at(36, scale),
        close: packet.price_at(40, scale),
    };

    let mut tick = Tick::ltp(token, last_price);
    tick.mode = SubscriptionMode::Quote;
    tick.last_traded_quantity = Some(packet.u32_at(8));
    tick.average_traded_price = Some(packet.price_at(12, scale));
    tick.volume_traded = Some(packet.u32_at(16));
    tick.total_buy_quantity = Some(packet.u32_at(20));
    tick.total_sell_quantity = Some(packet.u32_at(24));
    tick.change = Some(percent_change(last_price, ohlc.close));
    tick.ohlc = Some(ohlc);

    if len == FULL_PACKET {
        tick.mode = SubscriptionMode::Full;
        tick.last_trade_time = packet.time_at(44);
        tick.oi = Some(packet.u32_at(48));
        tick.oi_day_high = Some(packet.u32_at(52));
        tick.oi_day_low = Some(packet.u32_at(56));
        tick.exchange_timestamp = packet.time_at(60);
        tick.depth = Some(decode_depth(packet, scale));
    }

    tick
}

fn decode_depth(packet: &Packet<'_>, scale: u32) -> MarketDepth {
    let level = |i: usize| {
        let offset = DEPTH_OFFSET + i * DEPTH_ENTRY;
        DepthLevel {
            quantity: packet.u32_at(offset),
            price: packet.price_at(offset + 4, scale),
            orders: packet.u16_at(offset + 8),
        }
    };

    MarketDepth {
        buy: (0..DEPTH_LEVELS).map(level).collect(),
        sell: (DEPTH_LEVELS..DEPTH_LEVELS * 2).map(level).collect(),
    }
}

/// Percentage change of `last` over `close`, four decimal places.
fn percent_change(last: Decimal, close: Decimal) -> Decimal {
    if close.is_zero() {
        return Decimal::ZERO;
    }
    ((last - close) * Decimal::ONE_HUNDRED / close).round_dp(4)
}
