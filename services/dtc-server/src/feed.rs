//! Feed adapter boundary
//!
//! Exchange connectors push normalized trades and quotes through
//! [`FeedHandler`]. The server hands out a [`FeedSink`] implementing it,
//! which resolves symbol names, validates values and publishes to the
//! broadcast engine. Connectors themselves implement [`MarketDataFeed`].
//!
//! [`SimulatedFeed`] is a seeded random-walk generator used for local runs
//! and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protocol::messages::Side;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::{BroadcastEngine, PublishReport};
use crate::error::FeedError;
use crate::events::{unix_nanos_now, MarketDataEvent};
use crate::symbols::SymbolTable;

/// Callbacks a feed drives with normalized market data.
pub trait FeedHandler: Send + Sync {
    fn on_trade(
        &self,
        symbol: &str,
        price: f64,
        volume: f64,
        side: Side,
        timestamp: i64,
    ) -> Result<PublishReport, FeedError>;

    fn on_level2(
        &self,
        symbol: &str,
        bid_price: f64,
        bid_size: f64,
        ask_price: f64,
        ask_size: f64,
        timestamp: i64,
    ) -> Result<PublishReport, FeedError>;
}

/// An upstream source of market data.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    fn name(&self) -> &str;

    /// Stream into `handler` until `cancel` fires or the feed fails.
    async fn run(
        &self,
        handler: Arc<dyn FeedHandler>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError>;
}

/// The server side of the feed boundary.
#[derive(Clone)]
pub struct FeedSink {
    symbols: Arc<SymbolTable>,
    broadcast: Arc<BroadcastEngine>,
}

impl FeedSink {
    pub fn new(symbols: Arc<SymbolTable>, broadcast: Arc<BroadcastEngine>) -> Self {
        Self { symbols, broadcast }
    }

    fn resolve(&self, symbol: &str) -> Result<protocol::SymbolId, FeedError> {
        self.symbols
            .id_of(symbol)
            .ok_or_else(|| FeedError::UnknownSymbol(symbol.to_string()))
    }
}

/// Prices and sizes must be finite and non-negative.
pub(crate) fn check_value(field: &'static str, value: f64) -> Result<(), FeedError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FeedError::InvalidValue { field, value })
    }
}

impl FeedHandler for FeedSink {
    fn on_trade(
        &self,
        symbol: &str,
        price: f64,
        volume: f64,
        side: Side,
        timestamp: i64,
    ) -> Result<PublishReport, FeedError> {
        let symbol_id = self.resolve(symbol)?;
        check_value("price", price)?;
        check_value("volume", volume)?;
        let event = MarketDataEvent::trade(symbol_id, price, volume, side, timestamp);
        Ok(self.broadcast.publish(&event))
    }

    fn on_level2(
        &self,
        symbol: &str,
        bid_price: f64,
        bid_size: f64,
        ask_price: f64,
        ask_size: f64,
        timestamp: i64,
    ) -> Result<PublishReport, FeedError> {
        let symbol_id = self.resolve(symbol)?;
        check_value("bid_price", bid_price)?;
        check_value("bid_size", bid_size)?;
        check_value("ask_price", ask_price)?;
        check_value("ask_size", ask_size)?;
        let event =
            MarketDataEvent::bid_ask(symbol_id, bid_price, bid_size, ask_price, ask_size, timestamp);
        Ok(self.broadcast.publish(&event))
    }
}

// ── Simulated feed ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedFeedConfig {
    pub seed: u64,
    pub tick_interval: Duration,
    /// Maximum per-tick mid move in basis points.
    pub volatility_bps: u32,
    /// Quoted spread in basis points.
    pub spread_bps: u32,
    /// Probability that a tick also prints a trade.
    pub trade_probability: f64,
}

impl Default for SimulatedFeedConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tick_interval: Duration::from_millis(250),
            volatility_bps: 5,
            spread_bps: 2,
            trade_probability: 0.5,
        }
    }
}

/// One generated update.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedTick {
    Quote {
        symbol: String,
        bid_price: f64,
        bid_size: f64,
        ask_price: f64,
        ask_size: f64,
    },
    Trade {
        symbol: String,
        price: f64,
        volume: f64,
        side: Side,
    },
}

/// Deterministic random-walk market for a fixed set of symbols.
pub struct SimulatedMarket {
    config: SimulatedFeedConfig,
    mids: Vec<(String, f64)>,
    rng: ChaCha8Rng,
}

impl SimulatedMarket {
    pub fn new(config: SimulatedFeedConfig, mids: Vec<(String, f64)>) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self { config, mids, rng }
    }

    /// Advance every symbol by one step.
    pub fn tick(&mut self) -> Vec<SimulatedTick> {
        let volatility = f64::from(self.config.volatility_bps) / 10_000.0;
        let half_spread = f64::from(self.config.spread_bps) / 20_000.0;
        let trade_probability = self.config.trade_probability.clamp(0.0, 1.0);
        let mut ticks = Vec::with_capacity(self.mids.len() * 2);

        for (symbol, mid) in &mut self.mids {
            let step: f64 = self.rng.gen_range(-1.0..=1.0);
            *mid = (*mid * (1.0 + step * volatility)).max(0.01);

            let bid_price = round_cents(*mid * (1.0 - half_spread));
            let ask_price = round_cents(*mid * (1.0 + half_spread)).max(bid_price + 0.01);
            ticks.push(SimulatedTick::Quote {
                symbol: symbol.clone(),
                bid_price,
                bid_size: round_lots(self.rng.gen_range(0.1..5.0)),
                ask_price,
                ask_size: round_lots(self.rng.gen_range(0.1..5.0)),
            });

            if self.rng.gen_bool(trade_probability) {
                let side = if self.rng.gen_bool(0.5) {
                    Side::Buy
                } else {
                    Side::Sell
                };
                let price = match side {
                    Side::Buy => ask_price,
                    Side::Sell => bid_price,
                };
                ticks.push(SimulatedTick::Trade {
                    symbol: symbol.clone(),
                    price,
                    volume: round_lots(self.rng.gen_range(0.001..1.0)),
                    side,
                });
            }
        }

        ticks
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round_lots(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Reference mid used to seed a symbol's random walk.
fn starting_mid(symbol: &str) -> f64 {
    match symbol {
        "BTC-USD" => 65_000.0,
        "ETH-USD" => 3_000.0,
        "SOL-USD" => 150.0,
        _ => 100.0,
    }
}

pub struct SimulatedFeed {
    config: SimulatedFeedConfig,
    symbols: Vec<String>,
}

impl SimulatedFeed {
    pub fn new(config: SimulatedFeedConfig, symbols: Vec<String>) -> Self {
        Self { config, symbols }
    }

    /// Simulate every symbol in the table.
    pub fn for_table(config: SimulatedFeedConfig, table: &SymbolTable) -> Self {
        Self::new(config, table.iter().map(|s| s.symbol.clone()).collect())
    }

    pub fn market(&self) -> SimulatedMarket {
        SimulatedMarket::new(
            self.config.clone(),
            self.symbols
                .iter()
                .map(|s| (s.clone(), starting_mid(s)))
                .collect(),
        )
    }
}

#[async_trait]
impl MarketDataFeed for SimulatedFeed {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn run(
        &self,
        handler: Arc<dyn FeedHandler>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let mut market = self.market();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            symbols = self.symbols.len(),
            seed = self.config.seed,
            "Simulated feed started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let timestamp = unix_nanos_now();
                    for tick in market.tick() {
                        let result = match tick {
                            SimulatedTick::Quote { symbol, bid_price, bid_size, ask_price, ask_size } => {
                                handler.on_level2(&symbol, bid_price, bid_size, ask_price, ask_size, timestamp)
                            }
                            SimulatedTick::Trade { symbol, price, volume, side } => {
                                handler.on_trade(&symbol, price, volume, side, timestamp)
                            }
                        };
                        if let Err(e) = result {
                            warn!(error = %e, "Simulated update rejected");
                        }
                    }
                }
            }
        }

        info!("Simulated feed stopped");
        Ok(())
    }
}
