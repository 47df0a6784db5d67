//! Inbound message dispatch
//!
//! Maps each decoded client message to the actions it causes. Session-local
//! bookkeeping (heartbeat time, subscriptions) is applied directly on the
//! session; anything touching the registry or another task is returned as
//! an [`Effect`] for the server to apply. Subscription acknowledgements are
//! queued by the broadcast engine so they stay ordered with market data.
//!
//! Timeouts are never evaluated here.

use std::sync::Arc;
use std::time::Instant;

use protocol::messages::{
    LogonRequest, LogonResponse, LogonStatus, MarketDataReject, MarketDataRequest, RequestAction,
};
use protocol::{Message, PROTOCOL_VERSION};
use tracing::{debug, warn};

use crate::broadcast::BroadcastEngine;
use crate::config::ServerConfig;
use crate::session::{CloseReason, Session, SessionId};
use crate::symbols::SymbolTable;

/// Work the server must carry out after a message has been handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send {
        session_id: SessionId,
        message: Message,
    },
    Authenticate {
        session_id: SessionId,
        username: String,
    },
    /// Close after flushing anything already queued.
    Close {
        session_id: SessionId,
        reason: CloseReason,
    },
}

/// Credential check, a pure function of configuration.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    require_authentication: bool,
    password: String,
}

impl AuthPolicy {
    pub fn new(require_authentication: bool, password: impl Into<String>) -> Self {
        Self {
            require_authentication,
            password: password.into(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.require_authentication, config.password.clone())
    }

    pub fn is_required(&self) -> bool {
        self.require_authentication
    }

    pub fn accepts(&self, request: &LogonRequest) -> bool {
        !self.require_authentication || request.password == self.password
    }
}

pub struct Dispatcher {
    auth: AuthPolicy,
    server_name: String,
    max_subscriptions: usize,
    symbols: Arc<SymbolTable>,
    broadcast: Arc<BroadcastEngine>,
}

impl Dispatcher {
    pub fn new(
        config: &ServerConfig,
        symbols: Arc<SymbolTable>,
        broadcast: Arc<BroadcastEngine>,
    ) -> Self {
        Self {
            auth: AuthPolicy::from_config(config),
            server_name: config.server_name.clone(),
            max_subscriptions: config.max_subscriptions_per_session,
            symbols,
            broadcast,
        }
    }

    pub fn handle(&self, session: &Session, message: Message, now: Instant) -> Vec<Effect> {
        let session_id = session.id();

        if !message.message_type().is_client_to_server() {
            return vec![violation(
                session_id,
                format!("unexpected {:?} from client", message.message_type()),
            )];
        }

        match message {
            Message::LogonRequest(request) => self.on_logon(session, request),
            Message::Heartbeat(_) => {
                session.record_heartbeat_received(now);
                Vec::new()
            }
            Message::Logoff(logoff) => {
                debug!(session_id = %session_id, reason = %logoff.reason, "Client logoff");
                vec![Effect::Close {
                    session_id,
                    reason: CloseReason::ClientLogoff,
                }]
            }
            Message::MarketDataRequest(_) if !session.is_authenticated() => {
                vec![violation(session_id, "market data request before logon".into())]
            }
            Message::MarketDataRequest(request) => self.on_market_data_request(session, request),
            other => vec![violation(
                session_id,
                format!("unexpected {:?} from client", other.message_type()),
            )],
        }
    }

    fn on_logon(&self, session: &Session, request: LogonRequest) -> Vec<Effect> {
        let session_id = session.id();

        if !self.auth.accepts(&request) {
            warn!(session_id = %session_id, username = %request.username, "Logon rejected");
            session.reject();
            return vec![
                Effect::Send {
                    session_id,
                    message: self.logon_response(LogonStatus::Rejected, "invalid credentials"),
                },
                Effect::Close {
                    session_id,
                    reason: CloseReason::AuthenticationFailed,
                },
            ];
        }

        if request.protocol_version != PROTOCOL_VERSION {
            debug!(
                session_id = %session_id,
                client_version = request.protocol_version,
                "Client protocol version differs"
            );
        }

        vec![
            Effect::Authenticate {
                session_id,
                username: request.username,
            },
            Effect::Send {
                session_id,
                message: self.logon_response(LogonStatus::Success, "logon successful"),
            },
        ]
    }

    fn on_market_data_request(&self, session: &Session, request: MarketDataRequest) -> Vec<Effect> {
        let session_id = session.id();

        let Some(symbol_id) =
            self.symbols
                .resolve(request.symbol_id, &request.symbol, &request.exchange)
        else {
            let name = if request.symbol.is_empty() {
                request.symbol_id.to_string()
            } else {
                request.symbol.clone()
            };
            return vec![reject(session_id, &request, format!("unknown symbol {name}"))];
        };

        match request.request_action {
            RequestAction::Subscribe => {
                if !session.is_subscribed(symbol_id)
                    && session.subscription_count() >= self.max_subscriptions
                {
                    return vec![reject(
                        session_id,
                        &request,
                        format!("subscription limit of {} reached", self.max_subscriptions),
                    )];
                }
                self.broadcast.subscribe(session, symbol_id);
                debug!(session_id = %session_id, symbol_id = %symbol_id, "Subscribed");
                Vec::new()
            }
            RequestAction::Unsubscribe => {
                session.unsubscribe(symbol_id);
                debug!(session_id = %session_id, symbol_id = %symbol_id, "Unsubscribed");
                Vec::new()
            }
            RequestAction::Snapshot => vec![Effect::Send {
                session_id,
                message: self.broadcast.snapshot(symbol_id).into(),
            }],
        }
    }

    fn logon_response(&self, result: LogonStatus, text: &str) -> Message {
        LogonResponse {
            protocol_version: PROTOCOL_VERSION,
            result,
            result_text: text.to_string(),
            server_name: self.server_name.clone(),
            market_data_supported: true,
        }
        .into()
    }
}

fn violation(session_id: SessionId, detail: String) -> Effect {
    Effect::Close {
        session_id,
        reason: CloseReason::ProtocolViolation(detail),
    }
}

fn reject(session_id: SessionId, request: &MarketDataRequest, text: String) -> Effect {
    Effect::Send {
        session_id,
        message: MarketDataReject {
            symbol_id: request.symbol_id,
            reject_text: text,
        }
        .into(),
    }
}
