//! Market Data Tick Types
//!
//! Core domain types for Kite market data: instrument tokens, subscription
//! modes and the normalized tick events produced by the ticker. These types
//! are codec-agnostic and represent the canonical internal representation of
//! a tick once it has left the wire.
//!
//! Field names follow the kiteconnect tick dictionaries so that serialized
//! ticks are drop-in payloads for the Celery workers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Instrument Token
// =============================================================================

/// Opaque numeric identifier of a tradable instrument.
///
/// The low byte encodes the exchange segment, which determines the price
/// divisor used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentToken(pub u32);

impl InstrumentToken {
    /// Create a token from its raw value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Exchange segment encoded in the token.
    #[must_use]
    pub const fn segment(self) -> Segment {
        Segment::from_code((self.0 & 0xff) as u8)
    }
}

impl fmt::Display for InstrumentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstrumentToken {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Exchange segment of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// NSE equity.
    Nse,
    /// NSE futures and options.
    Nfo,
    /// NSE currency derivatives.
    Cds,
    /// BSE equity.
    Bse,
    /// BSE futures and options.
    Bfo,
    /// BSE currency derivatives.
    Bcd,
    /// MCX commodities.
    Mcx,
    /// MCX-SX.
    Mcxsx,
    /// Indices (not tradable).
    Indices,
    /// Segment code not known to this build.
    Unknown(u8),
}

impl Segment {
    /// Map a wire segment code to a segment.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Nse,
            2 => Self::Nfo,
            3 => Self::Cds,
            4 => Self::Bse,
            5 => Self::Bfo,
            6 => Self::Bcd,
            7 => Self::Mcx,
            8 => Self::Mcxsx,
            9 => Self::Indices,
            other => Self::Unknown(other),
        }
    }

    /// Number of decimal places prices are scaled by on the wire.
    ///
    /// Currency segments carry more precision than the default paise.
    #[must_use]
    pub const fn price_scale(self) -> u32 {
        match self {
            Self::Cds => 7,
            Self::Bcd => 4,
            _ => 2,
        }
    }

    /// Whether instruments in this segment can be traded.
    #[must_use]
    pub const fn is_tradable(self) -> bool {
        !matches!(self, Self::Indices)
    }
}

// =============================================================================
// Subscription Mode
// =============================================================================

/// Depth of data requested for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    /// Last traded price only.
    Ltp,
    /// Price, volume and OHLC without depth.
    Quote,
    /// Everything, including five levels of market depth.
    Full,
}

impl SubscriptionMode {
    /// All modes, in increasing order of detail.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ltp, Self::Quote, Self::Full]
    }

    /// Wire name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }

    /// Parse a mode from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ltp" => Some(Self::Ltp),
            "quote" => Some(Self::Quote),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tick Payload
// =============================================================================

/// Open, high, low and close prices of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ohlc {
    /// Opening price.
    pub open: Decimal,
    /// Session high.
    pub high: Decimal,
    /// Session low.
    pub low: Decimal,
    /// Previous close.
    pub close: Decimal,
}

/// One price level of the order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Quantity resting at this price.
    pub quantity: u32,
    /// Price of the level.
    pub price: Decimal,
    /// Number of orders at this price.
    pub orders: u16,
}

/// Five levels of bids and asks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarketDepth {
    /// Bid levels, best first.
    pub buy: Vec<DepthLevel>,
    /// Ask levels, best first.
    pub sell: Vec<DepthLevel>,
}

/// A tick exactly as decoded from one wire packet.
///
/// Optional fields are only present in the modes that carry them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument the tick belongs to.
    pub instrument_token: InstrumentToken,
    /// Mode inferred from the packet layout.
    pub mode: SubscriptionMode,
    /// False for indices.
    pub tradable: bool,
    /// Last traded price.
    pub last_price: Decimal,
    /// Quantity of the last trade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_traded_quantity: Option<u32>,
    /// Volume weighted average price of the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_traded_price: Option<Decimal>,
    /// Volume traded in the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_traded: Option<u32>,
    /// Total pending buy quantity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_buy_quantity: Option<u32>,
    /// Total pending sell quantity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_sell_quantity: Option<u32>,
    /// Session OHLC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<Ohlc>,
    /// Percentage change of the last price against the previous close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Decimal>,
    /// Time of the last trade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade_time: Option<DateTime<Utc>>,
    /// Open interest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi: Option<u32>,
    /// Day high of open interest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi_day_high: Option<u32>,
    /// Day low of open interest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi_day_low: Option<u32>,
    /// Exchange timestamp of the packet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_timestamp: Option<DateTime<Utc>>,
    /// Market depth (full mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<MarketDepth>,
}

impl Tick {
    /// Minimal LTP tick, the building block of every richer mode.
    #[must_use]
    pub fn ltp(instrument_token: InstrumentToken, last_price: Decimal) -> Self {
        Self {
            instrument_token,
            mode: SubscriptionMode::Ltp,
            tradable: instrument_token.segment().is_tradable(),
            last_price,
            last_traded_quantity: None,
            average_traded_price: None,
            volume_traded: None,
            total_buy_quantity: None,
            total_sell_quantity: None,
            ohlc: None,
            change: None,
            last_trade_time: None,
            oi: None,
            oi_day_high: None,
            oi_day_low: None,
            exchange_timestamp: None,
            depth: None,
        }
    }
}

// =============================================================================
// Tick Event
// =============================================================================

/// A decoded tick stamped at receipt.
///
/// The sequence number is assigned by the ticker, never taken from the wire,
/// and strictly increases for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    /// Receipt sequence number.
    pub sequence: u64,
    /// Exchange timestamp, or receipt time if the packet carried none.
    pub timestamp: DateTime<Utc>,
    /// When the frame carrying this tick was read off the socket.
    pub received_at: DateTime<Utc>,
    /// Decoded payload.
    #[serde(flatten)]
    pub tick: Tick,
}

impl TickEvent {
    /// Stamp a decoded tick.
    #[must_use]
    pub fn new(sequence: u64, received_at: DateTime<Utc>, tick: Tick) -> Self {
        Self {
            sequence,
            timestamp: tick.exchange_timestamp.unwrap_or(received_at),
            received_at,
            tick,
        }
    }

    /// Instrument this event belongs to.
    #[must_use]
    pub const fn token(&self) -> InstrumentToken {
        self.tick.instrument_token
    }
}

/// Source of receipt sequence numbers.
///
/// Lives as long as the ticker, so numbering continues across reconnects.
#[derive(Debug, Default)]
pub struct SequenceSource {
    last: AtomicU64,
}

impl SequenceSource {
    /// Start numbering at 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Next sequence number.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last number handed out (0 if none).
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
