//! Binary market-data protocol
//!
//! Wire format shared by the distribution server and its clients: a 4-byte
//! little-endian header followed by a fixed-layout body per message type.
//!
//! # Modules
//! - `ids`: Symbol identifiers
//! - `header`: Header layout and the message type catalog
//! - `messages`: Body structs for every catalog entry
//! - `codec`: Encode/decode and stream framing
//! - `errors`: Decode error taxonomy

pub mod codec;
pub mod errors;
pub mod header;
pub mod ids;
pub mod messages;

pub use codec::{decode, decode_with_limit, encode, encode_into, Frame, FrameDecoder, Message};
pub use errors::DecodeError;
pub use header::{
    MessageHeader, MessageType, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE, PROTOCOL_VERSION,
};
pub use ids::SymbolId;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::codec::*;
    pub use crate::errors::*;
    pub use crate::header::*;
    pub use crate::ids::*;
    pub use crate::messages::*;
}
