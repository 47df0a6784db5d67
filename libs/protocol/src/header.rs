//! Message header and type catalog
//!
//! # Binary Format
//! ```text
//! [size: u16]   total message length, header included
//! [type: u16]   message type tag
//! [body: size - 4 bytes]
//! ```
//! All integers are little-endian.

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

/// Size of the fixed header prefix in bytes.
pub const HEADER_SIZE: usize = 4;

/// Default upper bound on a single message, header included.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

/// Protocol version announced in logon messages.
pub const PROTOCOL_VERSION: i32 = 8;

/// Recognized message type tags.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u16)]
pub enum MessageType {
    LogonRequest = 1,
    LogonResponse = 2,
    Heartbeat = 3,
    Logoff = 5,
    MarketDataRequest = 101,
    MarketDataReject = 103,
    MarketDataSnapshot = 104,
    MarketDataUpdateTrade = 107,
    MarketDataUpdateBidAsk = 108,
}

impl MessageType {
    /// Whether a client may legitimately send this message to the server.
    pub fn is_client_to_server(&self) -> bool {
        matches!(
            self,
            MessageType::LogonRequest
                | MessageType::Heartbeat
                | MessageType::Logoff
                | MessageType::MarketDataRequest
        )
    }
}

/// Fixed-size prefix present on every message.
///
/// `message_type` stays a raw tag so frames with unrecognized types can
/// still be measured and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub size: u16,
    pub message_type: u16,
}

impl MessageHeader {
    /// Read the header from the start of `buf` without validating it.
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        let mut cursor = &buf[..HEADER_SIZE];
        let size = cursor.get_u16_le();
        let message_type = cursor.get_u16_le();
        Ok(Self { size, message_type })
    }

    /// Check the declared size against the bytes available and the limit.
    pub fn validate(&self, available: usize, limit: usize) -> Result<(), DecodeError> {
        let declared = self.size as usize;
        if declared < HEADER_SIZE || declared > available || declared > limit {
            return Err(DecodeError::SizeMismatch {
                declared,
                available,
                limit,
            });
        }
        Ok(())
    }

    pub fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u16_le(self.size);
        out.put_u16_le(self.message_type);
    }

    pub fn body_len(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }

    /// The recognized type, if the tag is in the catalog.
    pub fn known_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.message_type).ok()
    }
}
