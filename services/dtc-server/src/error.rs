//! Error types for the server
//!
//! Session-level failures never surface here: they close the offending
//! session with a [`crate::session::CloseReason`]. These enums cover what
//! escapes to API callers: startup, configuration, capacity and feed input.

use std::net::SocketAddr;

use protocol::SymbolId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown symbol id {0}")]
    UnknownSymbol(SymbolId),

    #[error("invalid market data: {0}")]
    Feed(#[from] FeedError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session limit of {max_clients} reached")]
    CapacityExceeded { max_clients: usize },
}

/// Rejections of feed input before it reaches the broadcast engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("{field} must be finite and non-negative, got {value}")]
    InvalidValue { field: &'static str, value: f64 },

    #[error("feed {feed} disconnected: {reason}")]
    Disconnected { feed: String, reason: String },
}
