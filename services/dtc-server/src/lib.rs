//! DTC Market Data Server
//!
//! Accepts TCP clients speaking the DTC-style binary protocol, handles
//! logon and heartbeats, and fans normalized market data from upstream
//! feeds out to every subscribed session.
//!
//! # Architecture
//!
//! ```text
//!   Exchange feeds (MarketDataFeed)
//!        │  on_trade / on_level2
//!    ┌───▼─────┐
//!    │FeedSink │  ← resolves symbols, validates values
//!    └───┬─────┘
//!        │ MarketDataEvent
//!  ┌─────▼──────────┐      ┌───────────┐
//!  │BroadcastEngine │─────►│ Snapshots │
//!  └─────┬──────────┘      └───────────┘
//!        │ encode once, enqueue per subscriber
//!  ┌─────▼──────────┐      ┌───────────────┐
//!  │SessionRegistry │◄─────│ LivenessSweep │
//!  └─────┬──────────┘      └───────────────┘
//!        │
//!  ┌─────▼────┐  frames  ┌───────────┐
//!  │ Session  │◄────────►│Dispatcher │
//!  │ reader / │          └───────────┘
//!  │ writer   │
//!  └──────────┘
//! ```
//!
//! Wire format lives in the `protocol` crate.

pub mod backpressure;
pub mod broadcast;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod feed;
pub mod http;
pub mod liveness;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod symbols;

pub use config::{ServerConfig, SymbolConfig};
pub use error::ServerError;
pub use events::MarketDataEvent;
pub use feed::{FeedHandler, FeedSink, MarketDataFeed, SimulatedFeed, SimulatedFeedConfig};
pub use server::{DtcServer, ServerStatus};

pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
