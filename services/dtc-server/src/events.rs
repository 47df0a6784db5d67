//! Market-data events
//!
//! Normalized trade and quote events produced by feeds and consumed by the
//! broadcast engine. Timestamps are Unix nanoseconds from the exchange clock.

use chrono::Utc;
use protocol::messages::{MarketDataUpdateBidAsk, MarketDataUpdateTrade, Side};
use protocol::{Message, SymbolId};
use serde::{Deserialize, Serialize};

/// Current wall-clock time as Unix nanoseconds.
pub fn unix_nanos_now() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// An immutable market-data event for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataEvent {
    pub symbol_id: SymbolId,
    pub payload: MarketDataPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum MarketDataPayload {
    /// A trade printed on the exchange
    Trade {
        price: f64,
        volume: f64,
        /// Aggressor side
        side: Side,
        timestamp: i64,
    },

    /// Top of book changed
    BidAsk {
        bid_price: f64,
        bid_quantity: f64,
        ask_price: f64,
        ask_quantity: f64,
        timestamp: i64,
    },
}

impl MarketDataEvent {
    pub fn trade(symbol_id: SymbolId, price: f64, volume: f64, side: Side, timestamp: i64) -> Self {
        Self {
            symbol_id,
            payload: MarketDataPayload::Trade {
                price,
                volume,
                side,
                timestamp,
            },
        }
    }

    pub fn bid_ask(
        symbol_id: SymbolId,
        bid_price: f64,
        bid_quantity: f64,
        ask_price: f64,
        ask_quantity: f64,
        timestamp: i64,
    ) -> Self {
        Self {
            symbol_id,
            payload: MarketDataPayload::BidAsk {
                bid_price,
                bid_quantity,
                ask_price,
                ask_quantity,
                timestamp,
            },
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self.payload {
            MarketDataPayload::Trade { timestamp, .. }
            | MarketDataPayload::BidAsk { timestamp, .. } => timestamp,
        }
    }

    /// The wire message subscribers receive for this event.
    pub fn to_message(&self) -> Message {
        match self.payload {
            MarketDataPayload::Trade {
                price,
                volume,
                side,
                timestamp,
            } => MarketDataUpdateTrade {
                symbol_id: self.symbol_id,
                side,
                price,
                volume,
                timestamp,
            }
            .into(),
            MarketDataPayload::BidAsk {
                bid_price,
                bid_quantity,
                ask_price,
                ask_quantity,
                timestamp,
            } => MarketDataUpdateBidAsk {
                symbol_id: self.symbol_id,
                bid_price,
                bid_quantity,
                ask_price,
                ask_quantity,
                timestamp,
            }
            .into(),
        }
    }
}
