//! TCP server and process-level API
//!
//! One accept task admits connections into the registry (or drops them at
//! capacity). Each admitted session gets a reader task that decodes frames
//! and runs them through the dispatcher in arrival order, and a writer task
//! that drains the session's outbound queue onto the socket. Closing a
//! session cancels both; the writer makes a bounded best-effort flush of
//! whatever was queued before the close.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use protocol::messages::{Logoff, Side};
use protocol::{Frame, FrameDecoder, Message, SymbolId, PROTOCOL_VERSION};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backpressure::PushOutcome;
use crate::broadcast::{BroadcastEngine, PublishReport};
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, Effect};
use crate::error::{RegistryError, ServerError};
use crate::events::MarketDataEvent;
use crate::feed::{check_value, FeedSink};
use crate::liveness::LivenessSweep;
use crate::metrics::ServerMetrics;
use crate::registry::{SessionEvent, SessionRegistry};
use crate::session::{CloseReason, Session, SessionId, SessionInfo};
use crate::symbols::SymbolTable;

/// Upper bound on the final flush after a session is closed.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after a failed `accept` so resource exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Serializable server status.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_name: String,
    pub running: bool,
    pub local_addr: Option<SocketAddr>,
    pub protocol_version: i32,
    pub sessions: usize,
    pub authenticated_sessions: usize,
    pub max_clients: usize,
    pub symbols: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub metrics: BTreeMap<String, u64>,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Server: {}", self.server_name)?;
        match (self.running, self.local_addr) {
            (true, Some(addr)) => writeln!(f, "Status: running on {addr}")?,
            _ => writeln!(f, "Status: stopped")?,
        }
        writeln!(f, "Protocol version: {}", self.protocol_version)?;
        writeln!(
            f,
            "Sessions: {} ({} authenticated, limit {})",
            self.sessions, self.authenticated_sessions, self.max_clients
        )?;
        writeln!(f, "Symbols: {}", self.symbols)?;
        write!(f, "Uptime: {}s", self.uptime_secs)?;
        for (name, value) in &self.metrics {
            write!(f, "\n  {name}: {value}")?;
        }
        Ok(())
    }
}

/// State shared by the accept loop and every session task.
struct ServerState {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    broadcast: Arc<BroadcastEngine>,
    dispatcher: Dispatcher,
    symbols: Arc<SymbolTable>,
    metrics: Arc<ServerMetrics>,
    decoder: FrameDecoder,
}

impl ServerState {
    fn admit(&self, peer: SocketAddr) -> Result<Arc<Session>, RegistryError> {
        let authenticated = !self.config.require_authentication;
        let capacity = self.config.outbound_queue_capacity;
        self.registry
            .insert_with(|id| Session::new(id, peer, Instant::now(), authenticated, capacity))
    }

    /// Close through the registry and account for the reason.
    fn close(&self, session_id: SessionId, reason: CloseReason) -> bool {
        let counter = match &reason {
            CloseReason::ProtocolViolation(_) => Some(&self.metrics.protocol_violations),
            CloseReason::AuthenticationFailed => Some(&self.metrics.logons_rejected),
            _ => None,
        };
        let closed = self.registry.close(session_id, reason);
        if closed {
            if let Some(counter) = counter {
                ServerMetrics::incr(counter);
            }
        }
        closed
    }

    /// Queue a `Logoff` and close with `ServerShutdown`.
    fn shut_down_session(&self, session: &Session) {
        session.enqueue(&Message::from(Logoff {
            reason: "server shutting down".to_string(),
            do_not_reconnect: false,
        }));
        self.close(session.id(), CloseReason::ServerShutdown);
    }

    fn send(&self, session: &Session, session_id: SessionId, message: &Message) {
        let outcome = if session.id() == session_id {
            session.enqueue(message)
        } else {
            match self.registry.get(session_id) {
                Some(target) => target.enqueue(message),
                None => return,
            }
        };
        if outcome != PushOutcome::Closed {
            self.metrics
                .record_enqueue(outcome == PushOutcome::DroppedOldest);
        }
    }

    /// Apply dispatcher effects in order. Returns `true` once `session`
    /// itself has been closed.
    fn apply(&self, session: &Session, effects: Vec<Effect>) -> bool {
        let mut closed = false;
        for effect in effects {
            match effect {
                Effect::Send {
                    session_id,
                    message,
                } => self.send(session, session_id, &message),
                Effect::Authenticate {
                    session_id,
                    username,
                } => {
                    if self.registry.authenticate(session_id, &username, Instant::now()) {
                        info!(session_id = %session_id, username = %username, "Session authenticated");
                    }
                }
                Effect::Close { session_id, reason } => {
                    self.close(session_id, reason);
                    closed |= session_id == session.id();
                }
            }
        }
        closed
    }
}

struct Running {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
}

/// The market-data server.
///
/// ```no_run
/// # async fn demo() -> Result<(), dtc_server::error::ServerError> {
/// use dtc_server::{DtcServer, ServerConfig};
///
/// let server = DtcServer::new(ServerConfig::default())?;
/// let addr = server.start().await?;
/// println!("listening on {addr}");
/// server.stop();
/// # Ok(())
/// # }
/// ```
pub struct DtcServer {
    state: Arc<ServerState>,
    running: Mutex<Option<Running>>,
}

impl DtcServer {
    /// Validate `config` and build a stopped server.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let metrics = Arc::new(ServerMetrics::new());
        let registry = Arc::new(SessionRegistry::new(config.max_clients));
        let symbols = Arc::new(SymbolTable::new(&config.symbols));
        let broadcast = Arc::new(BroadcastEngine::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));
        let dispatcher = Dispatcher::new(&config, Arc::clone(&symbols), Arc::clone(&broadcast));
        let decoder = FrameDecoder::new(config.max_message_size);

        Ok(Self {
            state: Arc::new(ServerState {
                config,
                registry,
                broadcast,
                dispatcher,
                symbols,
                metrics,
                decoder,
            }),
            running: Mutex::new(None),
        })
    }

    /// Bind and begin accepting connections.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = self.state.config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let cancel = CancellationToken::new();
        {
            let mut running = self.running.lock();
            if running.is_some() {
                return Err(ServerError::AlreadyRunning);
            }
            *running = Some(Running {
                cancel: cancel.clone(),
                local_addr,
                started_at: Instant::now(),
                started_at_utc: Utc::now(),
            });
        }

        let sweep = Arc::new(LivenessSweep::new(
            Arc::clone(&self.state.registry),
            Arc::clone(&self.state.metrics),
            self.state.config.heartbeat_interval(),
            self.state.config.logon_timeout(),
        ));
        tokio::spawn(sweep.run(cancel.clone()));
        tokio::spawn(accept_loop(Arc::clone(&self.state), listener, cancel));

        info!(
            addr = %local_addr,
            server_name = %self.state.config.server_name,
            max_clients = self.state.config.max_clients,
            require_authentication = self.state.config.require_authentication,
            "DTC server listening"
        );
        Ok(local_addr)
    }

    /// Stop accepting, log every session off and close it. Idempotent.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();

        let sessions = self.state.registry.sessions();
        for session in &sessions {
            self.state.shut_down_session(session);
        }
        info!(sessions = sessions.len(), "DTC server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn status(&self) -> ServerStatus {
        let (running, local_addr, started_at, uptime_secs) = match &*self.running.lock() {
            Some(r) => (
                true,
                Some(r.local_addr),
                Some(r.started_at_utc),
                r.started_at.elapsed().as_secs(),
            ),
            None => (false, None, None, 0),
        };

        ServerStatus {
            server_name: self.state.config.server_name.clone(),
            running,
            local_addr,
            protocol_version: PROTOCOL_VERSION,
            sessions: self.state.registry.len(),
            authenticated_sessions: self.state.registry.authenticated_count(),
            max_clients: self.state.config.max_clients,
            symbols: self.state.symbols.len(),
            started_at,
            uptime_secs,
            metrics: self.metrics(),
        }
    }

    /// Human-readable status.
    pub fn get_status(&self) -> String {
        self.status().to_string()
    }

    pub fn metrics(&self) -> BTreeMap<String, u64> {
        let mut metrics = self.state.metrics.export();
        metrics.insert(
            "sessions_closed".to_string(),
            self.state.registry.closed_total(),
        );
        metrics
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.state
            .registry
            .sessions()
            .iter()
            .map(|s| s.info())
            .collect()
    }

    pub fn broadcast_trade_update(
        &self,
        symbol_id: SymbolId,
        price: f64,
        volume: f64,
        side: Side,
        timestamp: i64,
    ) -> Result<PublishReport, ServerError> {
        self.ensure_symbol(symbol_id)?;
        check_value("price", price)?;
        check_value("volume", volume)?;
        Ok(self.state.broadcast.publish(&MarketDataEvent::trade(
            symbol_id, price, volume, side, timestamp,
        )))
    }

    pub fn broadcast_bid_ask_update(
        &self,
        symbol_id: SymbolId,
        bid_price: f64,
        bid_quantity: f64,
        ask_price: f64,
        ask_quantity: f64,
        timestamp: i64,
    ) -> Result<PublishReport, ServerError> {
        self.ensure_symbol(symbol_id)?;
        check_value("bid_price", bid_price)?;
        check_value("bid_quantity", bid_quantity)?;
        check_value("ask_price", ask_price)?;
        check_value("ask_quantity", ask_quantity)?;
        Ok(self.state.broadcast.publish(&MarketDataEvent::bid_ask(
            symbol_id,
            bid_price,
            bid_quantity,
            ask_price,
            ask_quantity,
            timestamp,
        )))
    }

    fn ensure_symbol(&self, symbol_id: SymbolId) -> Result<(), ServerError> {
        if self.state.symbols.contains(symbol_id) {
            Ok(())
        } else {
            Err(ServerError::UnknownSymbol(symbol_id))
        }
    }

    /// Handle for feeds to publish through.
    pub fn feed_sink(&self) -> FeedSink {
        FeedSink::new(
            Arc::clone(&self.state.symbols),
            Arc::clone(&self.state.broadcast),
        )
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.state.symbols
    }

    /// Connect / authenticate / disconnect notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.registry.subscribe_events()
    }
}

impl Drop for DtcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Connection handling ─────────────────────────────────────────────

async fn accept_loop(state: Arc<ServerState>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let session = match state.admit(peer) {
            Ok(session) => session,
            Err(e) => {
                ServerMetrics::incr(&state.metrics.connections_rejected);
                warn!(peer = %peer, error = %e, "Connection rejected");
                drop(stream);
                continue;
            }
        };
        ServerMetrics::incr(&state.metrics.connections_accepted);
        info!(session_id = %session.id(), peer = %peer, "Client connected");

        // Raced with stop(): the registry sweep in stop() may have missed it.
        if cancel.is_cancelled() {
            state.shut_down_session(&session);
        }

        tokio::spawn(serve_connection(Arc::clone(&state), session, stream));
    }

    debug!("Accept loop stopped");
}

async fn serve_connection(state: Arc<ServerState>, session: Arc<Session>, stream: TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(session_id = %session.id(), error = %e, "set_nodelay failed");
    }
    let (reader, writer) = stream.into_split();

    let writer_task = tokio::spawn(write_loop(
        Arc::clone(&state),
        Arc::clone(&session),
        writer,
    ));

    if let Some(reason) = read_loop(&state, &session, reader).await {
        state.close(session.id(), reason);
    }
    let _ = writer_task.await;

    info!(
        session_id = %session.id(),
        reason = %session.close_reason().unwrap_or(CloseReason::ClientDisconnected),
        "Session ended"
    );
}

/// Returns the reason to close with, or `None` if the session was already
/// closed elsewhere.
async fn read_loop(
    state: &ServerState,
    session: &Session,
    mut reader: OwnedReadHalf,
) -> Option<CloseReason> {
    let cancel = session.cancel_token();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        loop {
            match state.decoder.decode_next(&mut buf) {
                Ok(None) => break,
                Ok(Some(Frame::Unknown { type_tag, size })) => {
                    ServerMetrics::incr(&state.metrics.unknown_frames_skipped);
                    debug!(session_id = %session.id(), type_tag, size, "Skipped unknown message type");
                }
                Ok(Some(Frame::Message(message))) => {
                    ServerMetrics::incr(&state.metrics.frames_received);
                    let effects = state.dispatcher.handle(session, message, Instant::now());
                    if state.apply(session, effects) {
                        return None;
                    }
                }
                Err(e) => {
                    ServerMetrics::incr(&state.metrics.decode_errors);
                    warn!(session_id = %session.id(), error = %e, "Malformed frame");
                    return Some(CloseReason::ProtocolViolation(e.to_string()));
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => return Some(CloseReason::ClientDisconnected),
                Ok(_) => {}
                Err(e) => return Some(CloseReason::Io(e.to_string())),
            },
        }
    }
}

async fn write_loop(state: Arc<ServerState>, session: Arc<Session>, mut writer: OwnedWriteHalf) {
    let cancel = session.cancel_token();

    // The queue refuses pushes once the session is closed, so after
    // cancellation this drains at most one more batch before exiting.
    loop {
        let frames = session.outbound().drain();
        if !frames.is_empty() {
            if let Err(e) = write_batch(&mut writer, &concat(&frames), &cancel).await {
                if cancel.is_cancelled() {
                    debug!(session_id = %session.id(), error = %e, "Final flush abandoned");
                } else {
                    state.close(session.id(), CloseReason::Io(e.to_string()));
                }
                break;
            }
            continue;
        }
        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = session.outbound().notified() => {}
        }
    }

    let _ = writer.shutdown().await;
}

/// Write `batch` in full. Once `cancel` fires the write gets at most
/// [`FLUSH_TIMEOUT`] more to complete.
async fn write_batch(
    writer: &mut OwnedWriteHalf,
    batch: &[u8],
    cancel: &CancellationToken,
) -> io::Result<()> {
    let write = writer.write_all(batch);
    tokio::pin!(write);

    tokio::select! {
        written = &mut write => return written,
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(FLUSH_TIMEOUT, write).await {
        Ok(written) => written,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "flush timed out")),
    }
}

fn concat(frames: &[Bytes]) -> BytesMut {
    let mut batch = BytesMut::with_capacity(frames.iter().map(|f| f.len()).sum());
    for frame in frames {
        batch.extend_from_slice(frame);
    }
    batch
}
