//! Wire codec: encode/decode for the message catalog and stream framing
//!
//! Decoding trusts nothing past the header until the declared size has been
//! checked against both the bytes available and the configured limit, and
//! never reads beyond `size` bytes. Unknown type tags in a well-sized frame
//! are reported as `UnknownType` so the caller can skip them.

use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;
use crate::header::{MessageHeader, MessageType, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};
use crate::messages::{
    Heartbeat, Logoff, LogonRequest, LogonResponse, MarketDataReject, MarketDataRequest,
    MarketDataSnapshot, MarketDataUpdateBidAsk, MarketDataUpdateTrade,
};

/// Fixed-layout body of one catalog message.
pub trait WireBody: Sized {
    const MESSAGE_TYPE: MessageType;
    /// Exact body length on the wire, header excluded.
    const BODY_SIZE: usize;

    fn encode_body(&self, out: &mut BytesMut);

    /// Read the fields from a slice of exactly `BODY_SIZE` bytes. Callers go
    /// through [`decode_body`](Self::decode_body), which checks the length.
    #[doc(hidden)]
    fn decode_fields(body: &[u8]) -> Result<Self, DecodeError>;

    /// Decode a body, rejecting any slice that is not exactly `BODY_SIZE`.
    fn decode_body(body: &[u8]) -> Result<Self, DecodeError> {
        match body.len().cmp(&Self::BODY_SIZE) {
            Ordering::Less => Err(DecodeError::BodyTooShort {
                message_type: Self::MESSAGE_TYPE,
                expected: Self::BODY_SIZE,
                actual: body.len(),
            }),
            Ordering::Greater => Err(DecodeError::BodyTooLong {
                message_type: Self::MESSAGE_TYPE,
                expected: Self::BODY_SIZE,
                actual: body.len(),
            }),
            Ordering::Equal => Self::decode_fields(body),
        }
    }
}

macro_rules! message_catalog {
    ($($variant:ident),+ $(,)?) => {
        /// A decoded wire message, one variant per catalog entry.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum Message {
            $($variant($variant),)+
        }

        impl Message {
            pub fn message_type(&self) -> MessageType {
                match self {
                    $(Message::$variant(_) => <$variant as WireBody>::MESSAGE_TYPE,)+
                }
            }

            /// Total encoded length, header included.
            pub fn encoded_len(&self) -> usize {
                HEADER_SIZE
                    + match self {
                        $(Message::$variant(_) => <$variant as WireBody>::BODY_SIZE,)+
                    }
            }

            fn encode_body(&self, out: &mut BytesMut) {
                match self {
                    $(Message::$variant(m) => m.encode_body(out),)+
                }
            }

            fn decode_body(message_type: MessageType, body: &[u8]) -> Result<Self, DecodeError> {
                match message_type {
                    $(MessageType::$variant => <$variant as WireBody>::decode_body(body).map(Message::$variant),)+
                }
            }
        }

        $(
            impl From<$variant> for Message {
                fn from(message: $variant) -> Self {
                    Message::$variant(message)
                }
            }
        )+
    };
}

message_catalog!(
    LogonRequest,
    LogonResponse,
    Heartbeat,
    Logoff,
    MarketDataRequest,
    MarketDataReject,
    MarketDataSnapshot,
    MarketDataUpdateTrade,
    MarketDataUpdateBidAsk,
);

impl Message {
    pub fn encode(&self) -> Bytes {
        encode(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        decode(buf)
    }
}

/// Encode a message, header included.
pub fn encode(message: &Message) -> Bytes {
    let mut out = BytesMut::with_capacity(message.encoded_len());
    encode_into(message, &mut out);
    out.freeze()
}

/// Append an encoded message to `out`.
pub fn encode_into(message: &Message, out: &mut BytesMut) {
    let header = MessageHeader {
        size: message.encoded_len() as u16,
        message_type: message.message_type().into(),
    };
    header.write(out);
    message.encode_body(out);
}

/// Decode the first message in `buf` using the default size limit.
pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
    decode_with_limit(buf, DEFAULT_MAX_MESSAGE_SIZE)
}

/// Decode the first message in `buf`, rejecting frames larger than `limit`.
///
/// Bytes after the declared size are left untouched.
pub fn decode_with_limit(buf: &[u8], limit: usize) -> Result<Message, DecodeError> {
    let header = MessageHeader::parse(buf)?;
    header.validate(buf.len(), limit)?;

    let Some(message_type) = header.known_type() else {
        return Err(DecodeError::UnknownType {
            type_tag: header.message_type,
            size: header.size,
        });
    };

    Message::decode_body(message_type, &buf[HEADER_SIZE..header.size as usize])
}

// ── Stream framing ──────────────────────────────────────────────────

/// One complete frame cut from an inbound byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    /// Well-sized frame with a tag outside the catalog; already consumed.
    Unknown { type_tag: u16, size: u16 },
}

/// Splits a byte stream into frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Cut the next frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A declared size that
    /// can never be satisfied is reported immediately rather than waiting
    /// for bytes that would exceed the limit.
    pub fn decode_next(&self, buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = MessageHeader::parse(&buf[..])?;
        let declared = header.size as usize;
        if declared < HEADER_SIZE || declared > self.max_message_size {
            return Err(DecodeError::SizeMismatch {
                declared,
                available: buf.len(),
                limit: self.max_message_size,
            });
        }
        if buf.len() < declared {
            buf.reserve(declared - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(declared);
        match decode_with_limit(&frame, self.max_message_size) {
            Ok(message) => Ok(Some(Frame::Message(message))),
            Err(DecodeError::UnknownType { type_tag, size }) => {
                Ok(Some(Frame::Unknown { type_tag, size }))
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

// ── Field helpers ───────────────────────────────────────────────────

/// Write `value` as a NUL-padded field of `width` bytes, truncating at a
/// character boundary.
pub(crate) fn put_text(out: &mut BytesMut, value: &str, width: usize) {
    let mut end = value.len().min(width);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    out.put_slice(&value.as_bytes()[..end]);
    out.put_bytes(0, width - end);
}

/// Read a NUL-padded text field of `width` bytes.
pub(crate) fn get_text(
    body: &mut &[u8],
    width: usize,
    message_type: MessageType,
    field: &'static str,
) -> Result<String, DecodeError> {
    let data = *body;
    let (raw, rest) = data.split_at(width);
    *body = rest;

    let len = raw.iter().position(|&b| b == 0).unwrap_or(width);
    std::str::from_utf8(&raw[..len])
        .map(str::to_owned)
        .map_err(|e| invalid_field(message_type, field, e))
}

pub(crate) fn get_bool(
    body: &mut &[u8],
    message_type: MessageType,
    field: &'static str,
) -> Result<bool, DecodeError> {
    match body.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(invalid_field(
            message_type,
            field,
            format!("expected 0 or 1, got {other}"),
        )),
    }
}

pub(crate) fn invalid_field(
    message_type: MessageType,
    field: &'static str,
    reason: impl fmt::Display,
) -> DecodeError {
    DecodeError::InvalidField {
        message_type,
        field,
        reason: reason.to_string(),
    }
}
