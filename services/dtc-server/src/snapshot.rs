//! Last-known state per symbol
//!
//! Updated on every publish and read when a client subscribes or asks for
//! a snapshot. Symbols with no published data yield an all-zero snapshot.

use dashmap::DashMap;
use protocol::messages::MarketDataSnapshot;
use protocol::SymbolId;

use crate::events::{MarketDataEvent, MarketDataPayload};

#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: DashMap<SymbolId, MarketDataSnapshot>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an event into the cached state for its symbol.
    pub fn apply(&self, event: &MarketDataEvent) {
        let mut entry = self
            .entries
            .entry(event.symbol_id)
            .or_insert_with(|| MarketDataSnapshot {
                symbol_id: event.symbol_id,
                ..MarketDataSnapshot::default()
            });

        match event.payload {
            MarketDataPayload::Trade {
                price,
                volume,
                timestamp,
                ..
            } => {
                entry.last_trade_price = price;
                entry.last_trade_volume = volume;
                entry.last_trade_timestamp = timestamp;
            }
            MarketDataPayload::BidAsk {
                bid_price,
                bid_quantity,
                ask_price,
                ask_quantity,
                timestamp,
            } => {
                entry.bid_price = bid_price;
                entry.bid_quantity = bid_quantity;
                entry.ask_price = ask_price;
                entry.ask_quantity = ask_quantity;
                entry.bid_ask_timestamp = timestamp;
            }
        }
    }

    pub fn get(&self, symbol_id: SymbolId) -> MarketDataSnapshot {
        self.entries
            .get(&symbol_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| MarketDataSnapshot {
                symbol_id,
                ..MarketDataSnapshot::default()
            })
    }

    /// Number of symbols with at least one event.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::messages::Side;

    #[test]
    fn test_empty_snapshot_is_zeroed() {
        let cache = SnapshotCache::new();
        let snapshot = cache.get(SymbolId::new(3));
        assert_eq!(snapshot.symbol_id, SymbolId::new(3));
        assert_eq!(snapshot.last_trade_price, 0.0);
        assert_eq!(snapshot.bid_ask_timestamp, 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_trade_and_quote_merge() {
        let cache = SnapshotCache::new();
        let btc = SymbolId::new(1);

        cache.apply(&MarketDataEvent::trade(btc, 65000.0, 0.05, Side::Buy, 10));
        cache.apply(&MarketDataEvent::bid_ask(btc, 64999.0, 1.0, 65001.0, 2.0, 11));
        cache.apply(&MarketDataEvent::trade(btc, 65002.0, 0.10, Side::Sell, 12));

        let snapshot = cache.get(btc);
        assert_eq!(snapshot.last_trade_price, 65002.0);
        assert_eq!(snapshot.last_trade_volume, 0.10);
        assert_eq!(snapshot.last_trade_timestamp, 12);
        assert_eq!(snapshot.bid_price, 64999.0);
        assert_eq!(snapshot.ask_quantity, 2.0);
        assert_eq!(snapshot.bid_ask_timestamp, 11);
        assert_eq!(cache.len(), 1);
    }
}
