//! Server configuration
//!
//! Loaded from an optional TOML file, then overridden from the command line.
//! Every field has a default so a partial file is valid.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use protocol::codec::WireBody;
use protocol::messages::{LogonResponse, SYMBOL_LEN};
use protocol::{SymbolId, HEADER_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Port the protocol registers by default.
pub const DEFAULT_PORT: u16 = 11099;

/// One day.
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

/// One tradable symbol served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub id: SymbolId,
    pub symbol: String,
    #[serde(default)]
    pub exchange: String,
}

impl SymbolConfig {
    pub fn new(id: u32, symbol: &str) -> Self {
        Self {
            id: SymbolId::new(id),
            symbol: symbol.to_string(),
            exchange: String::new(),
        }
    }
}

/// Startup configuration for a [`crate::server::DtcServer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Announced in every `LogonResponse`.
    pub server_name: String,
    /// Hard cap on concurrent sessions.
    pub max_clients: usize,
    pub require_authentication: bool,
    /// Shared secret, only checked when authentication is required.
    pub password: String,
    #[serde(alias = "heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    pub enable_logging: bool,
    /// Unauthenticated sessions are closed after this long.
    #[serde(alias = "logon_timeout")]
    pub logon_timeout_secs: u64,
    pub max_message_size: usize,
    pub outbound_queue_capacity: usize,
    pub max_subscriptions_per_session: usize,
    /// Port for the HTTP status endpoint. Disabled when absent.
    pub status_port: Option<u16>,
    pub symbols: Vec<SymbolConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            server_name: "dtc-server".to_string(),
            max_clients: 100,
            require_authentication: false,
            password: String::new(),
            heartbeat_interval_secs: 30,
            enable_logging: true,
            logon_timeout_secs: 60,
            max_message_size: protocol::DEFAULT_MAX_MESSAGE_SIZE,
            outbound_queue_capacity: 1024,
            max_subscriptions_per_session: 100,
            status_port: None,
            symbols: vec![
                SymbolConfig::new(1, "BTC-USD"),
                SymbolConfig::new(2, "ETH-USD"),
                SymbolConfig::new(3, "SOL-USD"),
            ],
        }
    }
}

impl ServerConfig {
    /// Read and parse a TOML file. Does not validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn logon_timeout(&self) -> Duration {
        Duration::from_secs(self.logon_timeout_secs)
    }

    /// IPv4 or IPv6 `bind_address` combined with `port`.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!("bad bind address {}", self.bind_address))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0
            || self.heartbeat_interval_secs > MAX_HEARTBEAT_INTERVAL_SECS
        {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval must be between 1 and {MAX_HEARTBEAT_INTERVAL_SECS} seconds"
            )));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be positive".into()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be positive".into(),
            ));
        }

        let largest = HEADER_SIZE + LogonResponse::BODY_SIZE;
        if self.max_message_size < largest || self.max_message_size > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must be between {largest} and {}",
                u16::MAX
            )));
        }
        if self.require_authentication && self.password.is_empty() {
            return Err(ConfigError::Invalid(
                "require_authentication is set but no password is configured".into(),
            ));
        }
        self.listen_addr()?;

        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        for symbol in &self.symbols {
            if symbol.id.is_unspecified() {
                return Err(ConfigError::Invalid(format!(
                    "symbol {} has reserved id 0",
                    symbol.symbol
                )));
            }
            if symbol.symbol.is_empty() || symbol.symbol.len() > SYMBOL_LEN {
                return Err(ConfigError::Invalid(format!(
                    "symbol {} name must be 1..={SYMBOL_LEN} bytes",
                    symbol.id
                )));
            }
            if !ids.insert(symbol.id) {
                return Err(ConfigError::Invalid(format!("duplicate symbol id {}", symbol.id)));
            }
            if !names.insert(symbol.symbol.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate symbol name {}",
                    symbol.symbol
                )));
            }
        }

        Ok(())
    }
}
