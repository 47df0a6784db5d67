//! Decode error taxonomy
//!
//! Every failure the codec can report for an inbound byte buffer. Only
//! `UnknownType` is recoverable: the frame is well formed and the caller
//! skips it. Everything else means the peer is not speaking the protocol.

use thiserror::Error;

use crate::header::MessageType;

/// Errors produced while decoding a wire message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated header: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("declared size {declared} is invalid (available {available}, limit {limit})")]
    SizeMismatch {
        declared: usize,
        available: usize,
        limit: usize,
    },

    #[error("unknown message type {type_tag} ({size} bytes)")]
    UnknownType { type_tag: u16, size: u16 },

    #[error("{message_type:?} body too short: expected {expected} bytes, got {actual}")]
    BodyTooShort {
        message_type: MessageType,
        expected: usize,
        actual: usize,
    },

    #[error("{message_type:?} body too long: expected {expected} bytes, got {actual}")]
    BodyTooLong {
        message_type: MessageType,
        expected: usize,
        actual: usize,
    },

    #[error("{message_type:?} has invalid {field}: {reason}")]
    InvalidField {
        message_type: MessageType,
        field: &'static str,
        reason: String,
    },
}

impl DecodeError {
    /// Whether the connection that produced this error must be closed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::UnknownType { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_is_not_fatal() {
        let err = DecodeError::UnknownType {
            type_tag: 999,
            size: 8,
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_framing_errors_are_fatal() {
        let errors = [
            DecodeError::Truncated {
                needed: 4,
                available: 1,
            },
            DecodeError::SizeMismatch {
                declared: 100,
                available: 10,
                limit: 4096,
            },
            DecodeError::BodyTooShort {
                message_type: MessageType::Heartbeat,
                expected: 12,
                actual: 4,
            },
        ];
        assert!(errors.iter().all(DecodeError::is_fatal));
    }

    #[test]
    fn test_error_messages() {
        let err = DecodeError::InvalidField {
            message_type: MessageType::MarketDataUpdateTrade,
            field: "side",
            reason: "unknown value 7".into(),
        };
        assert_eq!(
            err.to_string(),
            "MarketDataUpdateTrade has invalid side: unknown value 7"
        );
    }
}
