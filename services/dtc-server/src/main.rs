use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dtc_server::registry::SessionEvent;
use dtc_server::{
    http, DtcServer, FeedHandler, MarketDataFeed, ServerConfig, SimulatedFeed,
    SimulatedFeedConfig,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dtc-server", version, about = "DTC-style market data server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    bind_address: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    require_authentication: bool,

    #[arg(long, env = "DTC_SERVER_PASSWORD")]
    password: Option<String>,

    /// Publish a seeded random walk for every configured symbol
    #[arg(long)]
    simulate: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Simulated tick interval in milliseconds
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,

    /// Serve the JSON status endpoint on this port
    #[arg(long)]
    status_port: Option<u16>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(ServerConfig, SimulatedFeedConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(bind_address) = self.bind_address {
            config.bind_address = bind_address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.require_authentication {
            config.require_authentication = true;
        }
        if let Some(password) = self.password {
            config.password = password;
        }
        if self.status_port.is_some() {
            config.status_port = self.status_port;
        }
        config.validate().context("invalid configuration")?;

        let feed = SimulatedFeedConfig {
            seed: self.seed,
            tick_interval: Duration::from_millis(self.tick_ms.max(1)),
            ..SimulatedFeedConfig::default()
        };
        Ok((config, feed, self.simulate))
    }
}

fn init_tracing(enabled: bool) {
    let filter = if enabled {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new("off")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, feed_config, simulate) = Args::parse().into_config()?;
    init_tracing(config.enable_logging);

    tracing::info!(version = dtc_server::SERVICE_VERSION, "Starting DTC server");

    let status_port = config.status_port;
    let status_bind = config.bind_address.clone();
    let server = Arc::new(DtcServer::new(config)?);
    server.start().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(log_session_events(Arc::clone(&server), shutdown.clone()));

    if simulate {
        let feed = SimulatedFeed::for_table(feed_config, server.symbols());
        let sink: Arc<dyn FeedHandler> = Arc::new(server.feed_sink());
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = feed.run(sink, cancel).await {
                tracing::error!(feed = feed.name(), error = %e, "Feed stopped");
            }
        });
    }

    if let Some(port) = status_port {
        let listener = TcpListener::bind((status_bind.as_str(), port))
            .await
            .with_context(|| format!("binding status endpoint on port {port}"))?;
        let server = Arc::clone(&server);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(server, listener, cancel).await {
                tracing::error!(error = %e, "Status endpoint failed");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    server.stop();
    tracing::info!("{}", server.get_status());
    Ok(())
}

async fn log_session_events(server: Arc<DtcServer>, cancel: CancellationToken) {
    let mut events = server.subscribe_events();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SessionEvent::Connected { session_id, peer }) => {
                tracing::debug!(session_id = %session_id, peer = %peer, "session event: connected");
            }
            Ok(SessionEvent::Authenticated {
                session_id,
                username,
            }) => {
                tracing::debug!(session_id = %session_id, username = %username, "session event: authenticated");
            }
            Ok(SessionEvent::Disconnected { session_id, reason }) => {
                tracing::debug!(session_id = %session_id, reason = %reason, "session event: disconnected");
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session event observer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
