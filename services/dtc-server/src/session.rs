//! Client session state
//!
//! One `Session` per accepted connection. It never owns the socket: the
//! reader and writer tasks own the socket halves and watch the session's
//! cancellation token. State transitions:
//!
//! ```text
//! Unauthenticated ──logon ok──► Authenticated ──┐
//!        │                                       ├──► Closed (terminal)
//!        └──logon rejected──► Rejected ──────────┘
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use protocol::{Message, SymbolId};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backpressure::{OutboundQueue, PushOutcome};

/// Monotonic session identifier, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    /// Logon refused; the session is about to close.
    Rejected,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// Peer closed the socket.
    ClientDisconnected,
    /// Peer sent a `Logoff`.
    ClientLogoff,
    AuthenticationFailed,
    HeartbeatTimeout,
    LogonTimeout,
    ProtocolViolation(String),
    ServerShutdown,
    Io(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientDisconnected => write!(f, "client disconnected"),
            CloseReason::ClientLogoff => write!(f, "client logoff"),
            CloseReason::AuthenticationFailed => write!(f, "authentication failed"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::LogonTimeout => write!(f, "logon timeout"),
            CloseReason::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            CloseReason::ServerShutdown => write!(f, "server shutdown"),
            CloseReason::Io(detail) => write!(f, "i/o error: {detail}"),
        }
    }
}

#[derive(Debug)]
struct SessionState {
    auth: AuthState,
    username: Option<String>,
    subscriptions: BTreeSet<SymbolId>,
    last_heartbeat_received: Instant,
    last_heartbeat_sent: Instant,
    close_reason: Option<CloseReason>,
}

/// Point-in-time view of a session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub auth_state: AuthState,
    pub username: Option<String>,
    pub subscriptions: Vec<SymbolId>,
    pub queued: usize,
    pub messages_dropped: u64,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    connected_at: Instant,
    connected_at_utc: DateTime<Utc>,
    state: Mutex<SessionState>,
    outbound: OutboundQueue,
    cancel: CancellationToken,
}

impl Session {
    /// `authenticated` starts the session past logon, used when the server
    /// does not require authentication.
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        now: Instant,
        authenticated: bool,
        queue_capacity: usize,
    ) -> Self {
        let auth = if authenticated {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };
        Self {
            id,
            peer,
            connected_at: now,
            connected_at_utc: Utc::now(),
            state: Mutex::new(SessionState {
                auth,
                username: None,
                subscriptions: BTreeSet::new(),
                last_heartbeat_received: now,
                last_heartbeat_sent: now,
                close_reason: None,
            }),
            outbound: OutboundQueue::new(queue_capacity),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    // ── Authentication ──────────────────────────────────────────────

    pub fn auth_state(&self) -> AuthState {
        self.state.lock().auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    pub fn username(&self) -> Option<String> {
        self.state.lock().username.clone()
    }

    /// Returns `false` if the session was already authenticated or has been
    /// rejected. The username is only recorded on the first transition,
    /// which also restarts both heartbeat clocks at `now`.
    pub fn authenticate(&self, username: &str, now: Instant) -> bool {
        let mut state = self.state.lock();
        match state.auth {
            AuthState::Unauthenticated => {
                state.auth = AuthState::Authenticated;
                state.username = Some(username.to_string());
                state.last_heartbeat_received = now;
                state.last_heartbeat_sent = now;
                true
            }
            AuthState::Authenticated => {
                if state.username.is_none() && !username.is_empty() {
                    state.username = Some(username.to_string());
                }
                false
            }
            AuthState::Rejected => false,
        }
    }

    pub fn reject(&self) {
        self.state.lock().auth = AuthState::Rejected;
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Returns `false` if already subscribed.
    pub fn subscribe(&self, symbol_id: SymbolId) -> bool {
        self.state.lock().subscriptions.insert(symbol_id)
    }

    pub fn unsubscribe(&self, symbol_id: SymbolId) -> bool {
        self.state.lock().subscriptions.remove(&symbol_id)
    }

    pub fn is_subscribed(&self, symbol_id: SymbolId) -> bool {
        self.state.lock().subscriptions.contains(&symbol_id)
    }

    /// Authenticated and subscribed to `symbol_id`, checked under one lock.
    pub fn receives(&self, symbol_id: SymbolId) -> bool {
        let state = self.state.lock();
        state.auth == AuthState::Authenticated && state.subscriptions.contains(&symbol_id)
    }

    pub fn subscriptions(&self) -> Vec<SymbolId> {
        self.state.lock().subscriptions.iter().copied().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    // ── Liveness ────────────────────────────────────────────────────

    pub fn record_heartbeat_received(&self, now: Instant) {
        self.state.lock().last_heartbeat_received = now;
    }

    pub fn last_heartbeat_received(&self) -> Instant {
        self.state.lock().last_heartbeat_received
    }

    pub fn last_heartbeat_sent(&self) -> Instant {
        self.state.lock().last_heartbeat_sent
    }

    /// If a heartbeat is due at `now`, mark it sent and return `true`.
    pub fn take_heartbeat_due(&self, now: Instant, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.last_heartbeat_sent) >= interval {
            state.last_heartbeat_sent = now;
            true
        } else {
            false
        }
    }

    // ── Outbound ────────────────────────────────────────────────────

    pub fn enqueue(&self, message: &Message) -> PushOutcome {
        self.outbound.push(message.encode())
    }

    /// Enqueue an already-encoded frame. Used by fan-out to share one buffer.
    pub fn enqueue_frame(&self, frame: Bytes) -> PushOutcome {
        self.outbound.push(frame)
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Dropped-frame count in the width the heartbeat carries.
    pub fn messages_dropped(&self) -> u32 {
        u32::try_from(self.outbound.messages_dropped()).unwrap_or(u32::MAX)
    }

    // ── Closing ─────────────────────────────────────────────────────

    /// Record the close reason and signal the I/O tasks.
    ///
    /// Returns `false` if the session was already closed. Frames queued
    /// before the call remain for the writer to flush.
    pub fn mark_closed(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if state.close_reason.is_some() {
                return false;
            }
            state.close_reason = Some(reason);
        }
        self.outbound.close();
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().close_reason.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().close_reason.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            id: self.id,
            peer: self.peer,
            auth_state: state.auth,
            username: state.username.clone(),
            subscriptions: state.subscriptions.iter().copied().collect(),
            queued: self.outbound.len(),
            messages_dropped: self.outbound.messages_dropped(),
            connected_at: self.connected_at_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::messages::Heartbeat;

    fn session(authenticated: bool) -> Session {
        Session::new(
            SessionId::new(1),
            "127.0.0.1:5000".parse().unwrap(),
            Instant::now(),
            authenticated,
            8,
        )
    }

    #[test]
    fn test_authenticate_once() {
        let session = session(false);
        assert_eq!(session.auth_state(), AuthState::Unauthenticated);

        assert!(session.authenticate("alice", Instant::now()));
        assert!(!session.authenticate("bob", Instant::now()));
        assert_eq!(session.username().as_deref(), Some("alice"));
    }

    #[test]
    fn test_authenticate_restarts_heartbeat_clocks() {
        let start = Instant::now();
        let session = Session::new(
            SessionId::new(1),
            "127.0.0.1:5000".parse().unwrap(),
            start,
            false,
            8,
        );
        let logon = start + Duration::from_secs(55);

        assert!(session.authenticate("alice", logon));
        assert_eq!(session.last_heartbeat_received(), logon);
        assert_eq!(session.last_heartbeat_sent(), logon);

        // A repeated logon leaves them alone.
        assert!(!session.authenticate("alice", logon + Duration::from_secs(10)));
        assert_eq!(session.last_heartbeat_received(), logon);
    }

    #[test]
    fn test_rejected_cannot_authenticate() {
        let session = session(false);
        session.reject();
        assert!(!session.authenticate("alice", Instant::now()));
        assert_eq!(session.auth_state(), AuthState::Rejected);
    }

    #[test]
    fn test_receives_requires_auth_and_subscription() {
        let btc = SymbolId::new(1);

        let pending = session(false);
        pending.subscribe(btc);
        assert!(!pending.receives(btc));

        let open = session(true);
        assert!(!open.receives(btc));
        assert!(open.subscribe(btc));
        assert!(!open.subscribe(btc));
        assert!(open.receives(btc));
        assert!(open.unsubscribe(btc));
        assert!(!open.receives(btc));
    }

    #[test]
    fn test_heartbeat_due() {
        let start = Instant::now();
        let session = Session::new(
            SessionId::new(1),
            "127.0.0.1:5000".parse().unwrap(),
            start,
            true,
            8,
        );
        let interval = Duration::from_secs(30);

        assert!(!session.take_heartbeat_due(start + Duration::from_secs(29), interval));
        assert!(session.take_heartbeat_due(start + Duration::from_secs(30), interval));
        assert!(!session.take_heartbeat_due(start + Duration::from_secs(31), interval));
        assert_eq!(session.last_heartbeat_sent(), start + Duration::from_secs(30));
    }

    #[test]
    fn test_close_is_terminal() {
        let session = session(true);
        let token = session.cancel_token();
        session.enqueue(
            &Heartbeat {
                num_dropped_messages: 0,
                current_date_time: 0,
            }
            .into(),
        );

        assert!(session.mark_closed(CloseReason::HeartbeatTimeout));
        assert!(!session.mark_closed(CloseReason::ServerShutdown));
        assert_eq!(session.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert!(token.is_cancelled());

        // Already-queued frames survive the close, new ones are refused.
        assert_eq!(session.outbound().len(), 1);
        assert_eq!(
            session.enqueue_frame(Bytes::from_static(b"x")),
            PushOutcome::Closed
        );
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(
            CloseReason::ProtocolViolation("bad size".into()).to_string(),
            "protocol violation: bad size"
        );
        assert_eq!(CloseReason::ServerShutdown.to_string(), "server shutdown");
    }
}
