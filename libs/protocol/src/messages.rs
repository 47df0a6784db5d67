//! Message catalog bodies
//!
//! One struct per wire message. Each owns only its semantic fields; the
//! header is synthesized by the codec from `MESSAGE_TYPE` and `BODY_SIZE`.
//! Field order below is the wire order.

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::codec::{get_bool, get_text, invalid_field, put_text, WireBody};
use crate::errors::DecodeError;
use crate::header::MessageType;
use crate::ids::SymbolId;

// ── Text field widths ───────────────────────────────────────────────

pub const USERNAME_LEN: usize = 32;
pub const PASSWORD_LEN: usize = 32;
pub const CLIENT_NAME_LEN: usize = 32;
pub const SERVER_NAME_LEN: usize = 48;
pub const TEXT_LEN: usize = 96;
pub const SYMBOL_LEN: usize = 64;
pub const EXCHANGE_LEN: usize = 16;

// ── Enumerated fields ───────────────────────────────────────────────

/// Aggressor side of a trade.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum Side {
    Buy = 1,
    Sell = 2,
}

/// Outcome carried by a `LogonResponse`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum LogonStatus {
    Success = 1,
    Rejected = 2,
}

/// What a `MarketDataRequest` asks the server to do.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum RequestAction {
    Subscribe = 1,
    Unsubscribe = 2,
    /// One-off snapshot without a subscription.
    Snapshot = 3,
}

// ── Session messages ────────────────────────────────────────────────

/// First message a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogonRequest {
    pub protocol_version: i32,
    pub username: String,
    pub password: String,
    /// Interval the client intends to send heartbeats at.
    pub heartbeat_interval_secs: i32,
    pub client_name: String,
}

impl WireBody for LogonRequest {
    const MESSAGE_TYPE: MessageType = MessageType::LogonRequest;
    const BODY_SIZE: usize = 4 + USERNAME_LEN + PASSWORD_LEN + 4 + CLIENT_NAME_LEN;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_i32_le(self.protocol_version);
        put_text(out, &self.username, USERNAME_LEN);
        put_text(out, &self.password, PASSWORD_LEN);
        out.put_i32_le(self.heartbeat_interval_secs);
        put_text(out, &self.client_name, CLIENT_NAME_LEN);
    }

    fn decode_fields(mut body: &[u8]) -> Result<Self, DecodeError> {
        let protocol_version = body.get_i32_le();
        let username = get_text(&mut body, USERNAME_LEN, Self::MESSAGE_TYPE, "username")?;
        let password = get_text(&mut body, PASSWORD_LEN, Self::MESSAGE_TYPE, "password")?;
        let heartbeat_interval_secs = body.get_i32_le();
        let client_name = get_text(&mut body, CLIENT_NAME_LEN, Self::MESSAGE_TYPE, "client_name")?;
        Ok(Self {
            protocol_version,
            username,
            password,
            heartbeat_interval_secs,
            client_name,
        })
    }
}

/// Server's answer to a `LogonRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogonResponse {
    pub protocol_version: i32,
    pub result: LogonStatus,
    pub result_text: String,
    pub server_name: String,
    pub market_data_supported: bool,
}

impl WireBody for LogonResponse {
    const MESSAGE_TYPE: MessageType = MessageType::LogonResponse;
    const BODY_SIZE: usize = 4 + 1 + TEXT_LEN + SERVER_NAME_LEN + 1;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_i32_le(self.protocol_version);
        out.put_u8(self.result.into());
        put_text(out, &self.result_text, TEXT_LEN);
        put_text(out, &self.server_name, SERVER_NAME_LEN);
        out.put_u8(self.market_data_supported.into());
    }

    fn decode_fields(mut body: &[u8]) -> Result<Self, DecodeError> {
        let protocol_version = body.get_i32_le();
        let result = LogonStatus::try_from(body.get_u8())
            .map_err(|e| invalid_field(Self::MESSAGE_TYPE, "result", e))?;
        let result_text = get_text(&mut body, TEXT_LEN, Self::MESSAGE_TYPE, "result_text")?;
        let server_name = get_text(&mut body, SERVER_NAME_LEN, Self::MESSAGE_TYPE, "server_name")?;
        let market_data_supported =
            get_bool(&mut body, Self::MESSAGE_TYPE, "market_data_supported")?;
        Ok(Self {
            protocol_version,
            result,
            result_text,
            server_name,
            market_data_supported,
        })
    }
}

/// Liveness probe, sent in both directions.
///
/// Server-sent heartbeats report how many outbound messages were dropped
/// for this session because its queue overflowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub num_dropped_messages: u32,
    /// Unix nanoseconds.
    pub current_date_time: i64,
}

impl WireBody for Heartbeat {
    const MESSAGE_TYPE: MessageType = MessageType::Heartbeat;
    const BODY_SIZE: usize = 4 + 8;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_u32_le(self.num_dropped_messages);
        out.put_i64_le(self.current_date_time);
    }

    fn decode_fields(mut body: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            num_dropped_messages: body.get_u32_le(),
            current_date_time: body.get_i64_le(),
        })
    }
}

/// Graceful end of session, sent by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logoff {
    pub reason: String,
    pub do_not_reconnect: bool,
}

impl WireBody for Logoff {
    const MESSAGE_TYPE: MessageType = MessageType::Logoff;
    const BODY_SIZE: usize = TEXT_LEN + 1;

    fn encode_body(&self, out: &mut BytesMut) {
        put_text(out, &self.reason, TEXT_LEN);
        out.put_u8(self.do_not_reconnect.into());
    }

    fn decode_fields(mut body: &[u8]) -> Result<Self, DecodeError> {
        let reason = get_text(&mut body, TEXT_LEN, Self::MESSAGE_TYPE, "reason")?;
        let do_not_reconnect = get_bool(&mut body, Self::MESSAGE_TYPE, "do_not_reconnect")?;
        Ok(Self {
            reason,
            do_not_reconnect,
        })
    }
}

// ── Market data messages ────────────────────────────────────────────

/// Subscribe, unsubscribe or snapshot request for one symbol.
///
/// The symbol is identified by name when `symbol` is non-empty, otherwise
/// by `symbol_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataRequest {
    pub request_action: RequestAction,
    pub symbol_id: SymbolId,
    pub symbol: String,
    pub exchange: String,
}

impl MarketDataRequest {
    pub fn subscribe(symbol: impl Into<String>) -> Self {
        Self {
            request_action: RequestAction::Subscribe,
            symbol_id: SymbolId::UNSPECIFIED,
            symbol: symbol.into(),
            exchange: String::new(),
        }
    }
}

impl WireBody for MarketDataRequest {
    const MESSAGE_TYPE: MessageType = MessageType::MarketDataRequest;
    const BODY_SIZE: usize = 1 + 4 + SYMBOL_LEN + EXCHANGE_LEN;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_u8(self.request_action.into());
        out.put_u32_le(self.symbol_id.get());
        put_text(out, &self.symbol, SYMBOL_LEN);
        put_text(out, &self.exchange, EXCHANGE_LEN);
    }

    fn decode_fields(mut body: &[u8]) -> Result<Self, DecodeError> {
        let request_action = RequestAction::try_from(body.get_u8())
            .map_err(|e| invalid_field(Self::MESSAGE_TYPE, "request_action", e))?;
        let symbol_id = SymbolId::new(body.get_u32_le());
        let symbol = get_text(&mut body, SYMBOL_LEN, Self::MESSAGE_TYPE, "symbol")?;
        let exchange = get_text(&mut body, EXCHANGE_LEN, Self::MESSAGE_TYPE, "exchange")?;
        Ok(Self {
            request_action,
            symbol_id,
            symbol,
            exchange,
        })
    }
}

/// Negative answer to a `MarketDataRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataReject {
    pub symbol_id: SymbolId,
    pub reject_text: String,
}

impl WireBody for MarketDataReject {
    const MESSAGE_TYPE: MessageType = MessageType::MarketDataReject;
    const BODY_SIZE: usize = 4 + TEXT_LEN;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_u32_le(self.symbol_id.get());
        put_text(out, &self.reject_text, TEXT_LEN);
    }

    fn decode_fields(mut body: &[u8]) -> Result<Self, DecodeError> {
        let symbol_id = SymbolId::new(body.get_u32_le());
        let reject_text = get_text(&mut body, TEXT_LEN, Self::MESSAGE_TYPE, "reject_text")?;
        Ok(Self {
            symbol_id,
            reject_text,
        })
    }
}

/// Last known state of a symbol. Doubles as the subscription acknowledgement.
///
/// Prices and quantities are zero and timestamps are zero when nothing
/// has been published for the symbol yet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    pub symbol_id: SymbolId,
    pub last_trade_price: f64,
    pub last_trade_volume: f64,
    pub last_trade_timestamp: i64,
    pub bid_price: f64,
    pub bid_quantity: f64,
    pub ask_price: f64,
    pub ask_quantity: f64,
    pub bid_ask_timestamp: i64,
}

impl WireBody for MarketDataSnapshot {
    const MESSAGE_TYPE: MessageType = MessageType::MarketDataSnapshot;
    const BODY_SIZE: usize = 4 + 8 * 8;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_u32_le(self.symbol_id.get());
        out.put_f64_le(self.last_trade_price);
        out.put_f64_le(self.last_trade_volume);
        out.put_i64_le(self.last_trade_timestamp);
        out.put_f64_le(self.bid_price);
        out.put_f64_le(self.bid_quantity);
        out.put_f64_le(self.ask_price);
        out.put_f64_le(self.ask_quantity);
        out.put_i64_le(self.bid_ask_timestamp);
    }

    fn decode_fields(mut body: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            symbol_id: SymbolId::new(body.get_u32_le()),
            last_trade_price: body.get_f64_le(),
            last_trade_volume: body.get_f64_le(),
            last_trade_timestamp: body.get_i64_le(),
            bid_price: body.get_f64_le(),
            bid_quantity: body.get_f64_le(),
            ask_price: body.get_f64_le(),
            ask_quantity: body.get_f64_le(),
            bid_ask_timestamp: body.get_i64_le(),
        })
    }
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataUpdateTrade {
    pub symbol_id: SymbolId,
    pub side: Side,
    pub price: f64,
    pub volume: f64,
    /// Exchange timestamp, Unix nanoseconds.
    pub timestamp: i64,
}

impl WireBody for MarketDataUpdateTrade {
    const MESSAGE_TYPE: MessageType = MessageType::MarketDataUpdateTrade;
    const BODY_SIZE: usize = 4 + 1 + 8 + 8 + 8;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_u32_le(self.symbol_id.get());
        out.put_u8(self.side.into());
        out.put_f64_le(self.price);
        out.put_f64_le(self.volume);
        out.put_i64_le(self.timestamp);
    }

    fn decode_fields(mut body: &[u8]) -> Result<Self, DecodeError> {
        let symbol_id = SymbolId::new(body.get_u32_le());
        let side = Side::try_from(body.get_u8())
            .map_err(|e| invalid_field(Self::MESSAGE_TYPE, "side", e))?;
        Ok(Self {
            symbol_id,
            side,
            price: body.get_f64_le(),
            volume: body.get_f64_le(),
            timestamp: body.get_i64_le(),
        })
    }
}

/// Top-of-book quote update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataUpdateBidAsk {
    pub symbol_id: SymbolId,
    pub bid_price: f64,
    pub bid_quantity: f64,
    pub ask_price: f64,
    pub ask_quantity: f64,
    /// Exchange timestamp, Unix nanoseconds.
    pub timestamp: i64,
}

impl WireBody for MarketDataUpdateBidAsk {
    const MESSAGE_TYPE: MessageType = MessageType::MarketDataUpdateBidAsk;
    const BODY_SIZE: usize = 4 + 8 * 4 + 8;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_u32_le(self.symbol_id.get());
        out.put_f64_le(self.bid_price);
        out.put_f64_le(self.bid_quantity);
        out.put_f64_le(self.ask_price);
        out.put_f64_le(self.ask_quantity);
        out.put_i64_le(self.timestamp);
    }

    fn decode_fields(mut body: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            symbol_id: SymbolId::new(body.get_u32_le()),
            bid_price: body.get_f64_le(),
            bid_quantity: body.get_f64_le(),
            ask_price: body.get_f64_le(),
            ask_quantity: body.get_f64_le(),
            timestamp: body.get_i64_le(),
        })
    }
}
