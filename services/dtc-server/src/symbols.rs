//! Symbol table
//!
//! Immutable mapping between symbol names and the numeric ids used on the
//! wire. Built once from configuration at startup.

use std::collections::BTreeMap;

use protocol::SymbolId;

use crate::config::SymbolConfig;

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    by_id: BTreeMap<SymbolId, SymbolConfig>,
    by_name: BTreeMap<String, SymbolId>,
}

impl SymbolTable {
    /// Later duplicates are ignored; `ServerConfig::validate` rejects them.
    pub fn new(symbols: &[SymbolConfig]) -> Self {
        let mut table = Self::default();
        for symbol in symbols {
            if table.by_id.contains_key(&symbol.id) || table.by_name.contains_key(&symbol.symbol) {
                continue;
            }
            table.by_name.insert(symbol.symbol.clone(), symbol.id);
            table.by_id.insert(symbol.id, symbol.clone());
        }
        table
    }

    pub fn contains(&self, id: SymbolId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn get(&self, id: SymbolId) -> Option<&SymbolConfig> {
        self.by_id.get(&id)
    }

    pub fn id_of(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    /// Resolve a request's symbol reference.
    ///
    /// A non-empty name wins over the numeric id. When both the request and
    /// the configured symbol name an exchange they must agree.
    pub fn resolve(&self, id: SymbolId, name: &str, exchange: &str) -> Option<SymbolId> {
        let id = if name.is_empty() {
            self.contains(id).then_some(id)?
        } else {
            self.id_of(name)?
        };

        let configured = &self.by_id.get(&id)?.exchange;
        if !exchange.is_empty() && !configured.is_empty() && configured != exchange {
            return None;
        }
        Some(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolConfig> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SymbolTable {
        let mut eth = SymbolConfig::new(2, "ETH-USD");
        eth.exchange = "coinbase".into();
        SymbolTable::new(&[SymbolConfig::new(1, "BTC-USD"), eth])
    }

    #[test]
    fn test_resolve_by_name() {
        let table = table();
        assert_eq!(
            table.resolve(SymbolId::UNSPECIFIED, "BTC-USD", ""),
            Some(SymbolId::new(1))
        );
        assert_eq!(table.resolve(SymbolId::UNSPECIFIED, "DOGE-USD", ""), None);
    }

    #[test]
    fn test_name_wins_over_id() {
        let table = table();
        assert_eq!(
            table.resolve(SymbolId::new(1), "ETH-USD", ""),
            Some(SymbolId::new(2))
        );
    }

    #[test]
    fn test_resolve_by_id() {
        let table = table();
        assert_eq!(table.resolve(SymbolId::new(2), "", ""), Some(SymbolId::new(2)));
        assert_eq!(table.resolve(SymbolId::new(9), "", ""), None);
        assert_eq!(table.resolve(SymbolId::UNSPECIFIED, "", ""), None);
    }

    #[test]
    fn test_exchange_must_match_when_both_present() {
        let table = table();
        assert!(table.resolve(SymbolId::UNSPECIFIED, "ETH-USD", "coinbase").is_some());
        assert!(table.resolve(SymbolId::UNSPECIFIED, "ETH-USD", "binance").is_none());
        assert!(table.resolve(SymbolId::UNSPECIFIED, "BTC-USD", "binance").is_some());
    }

    #[test]
    fn test_duplicates_ignored() {
        let table = SymbolTable::new(&[
            SymbolConfig::new(1, "BTC-USD"),
            SymbolConfig::new(1, "XRP-USD"),
        ]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.id_of("XRP-USD"), None);
    }
}
