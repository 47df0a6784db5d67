//! Broadcast engine
//!
//! Fans market-data events out to subscribed sessions. Each event is encoded
//! once and the same reference-counted buffer is queued on every target.
//! Publishing is serialized by an engine-wide lock, so every subscriber sees
//! a symbol's events in publish order. Subscribing takes the same lock while
//! it records the subscription and queues the snapshot, which keeps the
//! snapshot ahead of any update that follows it.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use protocol::messages::MarketDataSnapshot;
use protocol::{Message, SymbolId};
use serde::Serialize;
use tracing::trace;

use crate::backpressure::PushOutcome;
use crate::events::MarketDataEvent;
use crate::metrics::ServerMetrics;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::snapshot::SnapshotCache;

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Sessions the event was queued for.
    pub recipients: usize,
    /// Of those, how many had to evict an older frame.
    pub dropped: usize,
}

pub struct BroadcastEngine {
    registry: Arc<SessionRegistry>,
    snapshots: SnapshotCache,
    metrics: Arc<ServerMetrics>,
    publish_lock: Mutex<()>,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            registry,
            snapshots: SnapshotCache::new(),
            metrics,
            publish_lock: Mutex::new(()),
        }
    }

    /// Queue `event` on every authenticated subscriber of its symbol.
    ///
    /// Sessions that close during fan-out are skipped silently.
    pub fn publish(&self, event: &MarketDataEvent) -> PublishReport {
        let started = Instant::now();
        let frame = event.to_message().encode();
        let mut report = PublishReport::default();

        {
            let _guard = self.publish_lock.lock();
            self.snapshots.apply(event);
            self.registry
                .for_each_subscriber(event.symbol_id, |session| {
                    match session.enqueue_frame(frame.clone()) {
                        PushOutcome::Queued => report.recipients += 1,
                        PushOutcome::DroppedOldest => {
                            report.recipients += 1;
                            report.dropped += 1;
                        }
                        PushOutcome::Closed => {}
                    }
                });
        }

        let latency_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.metrics
            .record_publish(report.recipients as u64, report.dropped as u64, latency_ns);
        trace!(
            symbol_id = %event.symbol_id,
            recipients = report.recipients,
            dropped = report.dropped,
            "Published market data"
        );
        report
    }

    /// Subscribe `session` to `symbol_id` and queue the current snapshot as
    /// the acknowledgement.
    ///
    /// Returns `false` if the session was already subscribed; the snapshot is
    /// queued either way.
    pub fn subscribe(&self, session: &Session, symbol_id: SymbolId) -> bool {
        let _guard = self.publish_lock.lock();
        let added = session.subscribe(symbol_id);
        let snapshot = self.snapshots.get(symbol_id);
        let outcome = session.enqueue(&Message::from(snapshot));
        self.metrics
            .record_enqueue(outcome == PushOutcome::DroppedOldest);
        added
    }

    pub fn snapshot(&self, symbol_id: SymbolId) -> MarketDataSnapshot {
        self.snapshots.get(symbol_id)
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CloseReason;
    use protocol::messages::{MarketDataUpdateTrade, Side};
    use protocol::decode;
    use std::time::Instant;

    fn engine() -> (Arc<SessionRegistry>, BroadcastEngine) {
        let registry = Arc::new(SessionRegistry::new(8));
        let engine = BroadcastEngine::new(Arc::clone(&registry), Arc::new(ServerMetrics::new()));
        (registry, engine)
    }

    fn admit(registry: &SessionRegistry, capacity: usize) -> Arc<Session> {
        registry
            .insert_with(|id| {
                Session::new(id, "127.0.0.1:1".parse().unwrap(), Instant::now(), true, capacity)
            })
            .unwrap()
    }

    fn drain_messages(session: &Session) -> Vec<Message> {
        session
            .outbound()
            .drain()
            .iter()
            .map(|frame| decode(frame).unwrap())
            .collect()
    }

    #[test]
    fn test_fan_out_only_to_subscribers() {
        let (registry, engine) = engine();
        let a = SymbolId::new(1);
        let b = SymbolId::new(2);
        let s1 = admit(&registry, 16);
        let s2 = admit(&registry, 16);
        s1.subscribe(a);
        s2.subscribe(b);

        let report = engine.publish(&MarketDataEvent::trade(a, 1.0, 1.0, Side::Buy, 1));

        assert_eq!(report, PublishReport { recipients: 1, dropped: 0 });
        assert_eq!(s1.outbound().len(), 1);
        assert_eq!(s2.outbound().len(), 0);
    }

    #[test]
    fn test_btc_trade_reaches_subscriber_exactly() {
        let (registry, engine) = engine();
        let btc = SymbolId::new(1);
        let session = admit(&registry, 16);
        session.subscribe(btc);

        let ts = 1_708_123_456_789_000_000;
        engine.publish(&MarketDataEvent::trade(btc, 65000.0, 0.05, Side::Buy, ts));

        assert_eq!(
            drain_messages(&session),
            vec![Message::MarketDataUpdateTrade(MarketDataUpdateTrade {
                symbol_id: btc,
                side: Side::Buy,
                price: 65000.0,
                volume: 0.05,
                timestamp: ts,
            })]
        );
    }

    #[test]
    fn test_per_symbol_order_preserved() {
        let (registry, engine) = engine();
        let btc = SymbolId::new(1);
        let session = admit(&registry, 16);
        session.subscribe(btc);

        engine.publish(&MarketDataEvent::trade(btc, 1.0, 1.0, Side::Buy, 1));
        engine.publish(&MarketDataEvent::trade(btc, 2.0, 1.0, Side::Buy, 2));

        let prices: Vec<f64> = drain_messages(&session)
            .into_iter()
            .map(|m| match m {
                Message::MarketDataUpdateTrade(t) => t.price,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(prices, vec![1.0, 2.0]);
    }

    #[test]
    fn test_closed_session_not_targeted() {
        let (registry, engine) = engine();
        let btc = SymbolId::new(1);
        let session = admit(&registry, 16);
        session.subscribe(btc);
        registry.close(session.id(), CloseReason::HeartbeatTimeout);

        let report = engine.publish(&MarketDataEvent::trade(btc, 1.0, 1.0, Side::Buy, 1));
        assert_eq!(report.recipients, 0);
        assert!(session.outbound().is_empty());
    }

    #[test]
    fn test_concurrent_close_stops_delivery() {
        const EVENTS_PER_PUBLISHER: usize = 500;

        let registry = Arc::new(SessionRegistry::new(64));
        let engine = BroadcastEngine::new(Arc::clone(&registry), Arc::new(ServerMetrics::new()));
        let btc = SymbolId::new(1);
        // Large enough that nothing is evicted, so queue length counts pushes.
        let sessions: Vec<Arc<Session>> = (0..32)
            .map(|_| {
                let session = admit(&registry, 4096);
                session.subscribe(btc);
                session
            })
            .collect();

        let engine = &engine;
        let registry = &registry;
        let targets = &sessions;
        let (recipients, at_close) = std::thread::scope(|scope| {
            let publishers: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(move || {
                        (0..EVENTS_PER_PUBLISHER)
                            .map(|i| {
                                let event =
                                    MarketDataEvent::trade(btc, 1.0, 1.0, Side::Buy, i as i64);
                                engine.publish(&event).recipients
                            })
                            .sum::<usize>()
                    })
                })
                .collect();

            let closer = scope.spawn(move || {
                targets
                    .iter()
                    .map(|session| {
                        registry.close(session.id(), CloseReason::ClientDisconnected);
                        std::thread::yield_now();
                        session.outbound().len()
                    })
                    .collect::<Vec<_>>()
            });

            let recipients: usize = publishers.into_iter().map(|h| h.join().unwrap()).sum();
            (recipients, closer.join().unwrap())
        });

        for (session, queued_at_close) in sessions.iter().zip(&at_close) {
            assert!(session.is_closed());
            assert_eq!(session.outbound().len(), *queued_at_close);
            assert_eq!(session.outbound().messages_dropped(), 0);
        }
        assert_eq!(recipients, at_close.iter().sum::<usize>());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_overflow_is_reported() {
        let (registry, engine) = engine();
        let btc = SymbolId::new(1);
        let session = admit(&registry, 1);
        session.subscribe(btc);

        engine.publish(&MarketDataEvent::trade(btc, 1.0, 1.0, Side::Buy, 1));
        let report = engine.publish(&MarketDataEvent::trade(btc, 2.0, 1.0, Side::Buy, 2));

        assert_eq!(report, PublishReport { recipients: 1, dropped: 1 });
        assert_eq!(session.messages_dropped(), 1);
    }

    #[test]
    fn test_subscribe_queues_snapshot_before_updates() {
        let (registry, engine) = engine();
        let btc = SymbolId::new(1);
        let session = admit(&registry, 16);

        engine.publish(&MarketDataEvent::bid_ask(btc, 10.0, 1.0, 11.0, 2.0, 5));
        assert!(engine.subscribe(&session, btc));
        engine.publish(&MarketDataEvent::trade(btc, 10.5, 3.0, Side::Sell, 6));

        let messages = drain_messages(&session);
        assert_eq!(messages.len(), 2);
        let Message::MarketDataSnapshot(snapshot) = &messages[0] else {
            panic!("expected snapshot first, got {:?}", messages[0]);
        };
        assert_eq!(snapshot.bid_price, 10.0);
        assert_eq!(snapshot.last_trade_price, 0.0);
        assert!(matches!(messages[1], Message::MarketDataUpdateTrade(_)));
    }

    #[test]
    fn test_snapshot_tracks_latest_publish() {
        let (_registry, engine) = engine();
        let eth = SymbolId::new(2);
        engine.publish(&MarketDataEvent::trade(eth, 3000.0, 1.0, Side::Buy, 9));
        assert_eq!(engine.snapshot(eth).last_trade_price, 3000.0);
        assert_eq!(engine.snapshots().len(), 1);
    }
}
