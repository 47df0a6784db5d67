//! Identifier types shared between the codec and the server
//!
//! Symbol ids travel on the wire as `u32`; zero is reserved to mean
//! "not specified" in requests that identify a symbol by name instead.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned numeric identifier for a tradable symbol.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SymbolId(u32);

impl SymbolId {
    /// The "unspecified" id used by requests that carry only a symbol name.
    pub const UNSPECIFIED: SymbolId = SymbolId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw wire value.
    pub const fn get(&self) -> u32 {
        self.0
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for SymbolId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
