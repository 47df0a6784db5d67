//! End-to-end session tests over loopback TCP
//!
//! Each test starts a server on an ephemeral port and talks to it with a
//! minimal framed client.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use dtc_server::{DtcServer, ServerConfig};
use protocol::messages::{
    Heartbeat, LogonRequest, LogonStatus, MarketDataRequest, RequestAction, Side,
};
use protocol::{encode, Frame, FrameDecoder, Message, SymbolId, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

const BTC: SymbolId = SymbolId::new(1);
const ETH: SymbolId = SymbolId::new(2);

struct Client {
    stream: TcpStream,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl Client {
    async fn connect(server: &DtcServer) -> Self {
        let addr = server.local_addr().expect("server running");
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
            decoder: FrameDecoder::default(),
        }
    }

    async fn send(&mut self, message: impl Into<Message>) {
        self.stream
            .write_all(&encode(&message.into()))
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next message, or `None` once the server closes the connection.
    async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(frame) = self.decoder.decode_next(&mut self.buf).unwrap() {
                match frame {
                    Frame::Message(message) => return Some(message),
                    Frame::Unknown { .. } => continue,
                }
            }
            let read = tokio::time::timeout(RECV_TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for the server");
            match read {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }
}

fn local_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig) -> Arc<DtcServer> {
    let server = Arc::new(DtcServer::new(config).unwrap());
    server.start().await.unwrap();
    server
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn logon(password: &str) -> LogonRequest {
    LogonRequest {
        protocol_version: PROTOCOL_VERSION,
        username: "trader1".into(),
        password: password.into(),
        heartbeat_interval_secs: 30,
        client_name: "test-client".into(),
    }
}

fn request(action: RequestAction, symbol: &str) -> MarketDataRequest {
    MarketDataRequest {
        request_action: action,
        symbol_id: SymbolId::UNSPECIFIED,
        symbol: symbol.into(),
        exchange: String::new(),
    }
}

async fn subscribe(client: &mut Client, symbol: &str, expected: SymbolId) {
    client.send(MarketDataRequest::subscribe(symbol)).await;
    match client.recv().await {
        Some(Message::MarketDataSnapshot(snapshot)) => assert_eq!(snapshot.symbol_id, expected),
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_btc_trade_reaches_subscriber() {
    let server = start(local_config()).await;
    let mut client = Client::connect(&server).await;

    subscribe(&mut client, "BTC-USD", BTC).await;

    let report = server
        .broadcast_trade_update(BTC, 65_000.0, 0.5, Side::Buy, 1_700_000_000)
        .unwrap();
    assert_eq!(report.recipients, 1);

    let Some(Message::MarketDataUpdateTrade(trade)) = client.recv().await else {
        panic!("expected trade update");
    };
    assert_eq!(trade.symbol_id, BTC);
    assert_eq!(trade.side, Side::Buy);
    assert_eq!(trade.price, 65_000.0);
    assert_eq!(trade.volume, 0.5);
    assert_eq!(trade.timestamp, 1_700_000_000);

    // A later snapshot reflects the trade.
    client.send(request(RequestAction::Snapshot, "BTC-USD")).await;
    let Some(Message::MarketDataSnapshot(snapshot)) = client.recv().await else {
        panic!("expected snapshot");
    };
    assert_eq!(snapshot.last_trade_price, 65_000.0);

    server.stop();
}

#[tokio::test]
async fn test_logon_success() {
    let server = start(ServerConfig {
        require_authentication: true,
        password: "secret".into(),
        server_name: "unit-test".into(),
        ..local_config()
    })
    .await;
    let mut client = Client::connect(&server).await;

    client.send(logon("secret")).await;
    let Some(Message::LogonResponse(response)) = client.recv().await else {
        panic!("expected logon response");
    };
    assert_eq!(response.result, LogonStatus::Success);
    assert_eq!(response.server_name, "unit-test");
    assert_eq!(response.protocol_version, PROTOCOL_VERSION);
    assert!(response.market_data_supported);

    subscribe(&mut client, "ETH-USD", ETH).await;
    assert_eq!(server.status().authenticated_sessions, 1);

    server.stop();
}

#[tokio::test]
async fn test_logon_rejection_is_flushed_before_close() {
    let server = start(ServerConfig {
        require_authentication: true,
        password: "secret".into(),
        ..local_config()
    })
    .await;
    let mut client = Client::connect(&server).await;

    client.send(logon("wrong")).await;
    let Some(Message::LogonResponse(response)) = client.recv().await else {
        panic!("expected logon response");
    };
    assert_eq!(response.result, LogonStatus::Rejected);
    assert!(client.recv().await.is_none());

    wait_until(|| server.status().sessions == 0).await;
    assert_eq!(server.metrics()["logons_rejected"], 1);

    server.stop();
}

#[tokio::test]
async fn test_request_before_logon_closes_session() {
    let server = start(ServerConfig {
        require_authentication: true,
        password: "secret".into(),
        ..local_config()
    })
    .await;
    let mut client = Client::connect(&server).await;

    client.send(MarketDataRequest::subscribe("BTC-USD")).await;
    assert!(client.recv().await.is_none());

    wait_until(|| server.metrics()["protocol_violations"] == 1).await;
    assert_eq!(server.status().sessions, 0);

    server.stop();
}

#[tokio::test]
async fn test_connection_over_capacity_is_dropped() {
    let server = start(ServerConfig {
        max_clients: 1,
        ..local_config()
    })
    .await;

    let mut first = Client::connect(&server).await;
    wait_until(|| server.status().sessions == 1).await;

    let mut second = Client::connect(&server).await;
    assert!(second.recv().await.is_none());
    assert_eq!(server.status().sessions, 1);
    assert_eq!(server.metrics()["connections_rejected"], 1);

    // The admitted session is unaffected.
    subscribe(&mut first, "SOL-USD", SymbolId::new(3)).await;

    server.stop();
}

#[tokio::test]
async fn test_unknown_message_type_is_skipped() {
    let server = start(local_config()).await;
    let mut client = Client::connect(&server).await;

    let mut unknown = BytesMut::new();
    unknown.put_u16_le(8);
    unknown.put_u16_le(999);
    unknown.put_u32_le(0xDEAD_BEEF);
    client.send_raw(&unknown).await;
    client
        .send(Heartbeat {
            num_dropped_messages: 0,
            current_date_time: 0,
        })
        .await;

    subscribe(&mut client, "BTC-USD", BTC).await;
    let metrics = server.metrics();
    assert_eq!(metrics["unknown_frames_skipped"], 1);
    assert_eq!(metrics["frames_received"], 2);

    server.stop();
}

#[tokio::test]
async fn test_malformed_frame_closes_session() {
    let server = start(local_config()).await;
    let mut client = Client::connect(&server).await;

    // Declared size below the header length.
    client.send_raw(&[2, 0, 3, 0]).await;
    assert!(client.recv().await.is_none());

    wait_until(|| server.metrics()["decode_errors"] == 1).await;
    server.stop();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = start(local_config()).await;
    let mut client = Client::connect(&server).await;

    subscribe(&mut client, "BTC-USD", BTC).await;
    client.send(request(RequestAction::Unsubscribe, "BTC-USD")).await;
    // Requests are handled in order, so this ack proves the unsubscribe landed.
    subscribe(&mut client, "ETH-USD", ETH).await;

    let btc = server
        .broadcast_trade_update(BTC, 65_000.0, 1.0, Side::Sell, 1)
        .unwrap();
    assert_eq!(btc.recipients, 0);
    server
        .broadcast_bid_ask_update(ETH, 2_999.5, 4.0, 3_000.5, 2.0, 2)
        .unwrap();

    let Some(Message::MarketDataUpdateBidAsk(quote)) = client.recv().await else {
        panic!("expected bid/ask update");
    };
    assert_eq!(quote.symbol_id, ETH);
    assert_eq!(quote.ask_price, 3_000.5);

    server.stop();
}

#[tokio::test]
async fn test_unknown_symbol_is_rejected() {
    let server = start(local_config()).await;
    let mut client = Client::connect(&server).await;

    client.send(MarketDataRequest::subscribe("DOGE-USD")).await;
    let Some(Message::MarketDataReject(reject)) = client.recv().await else {
        panic!("expected reject");
    };
    assert!(reject.reject_text.contains("DOGE-USD"));

    // The session stays usable.
    subscribe(&mut client, "BTC-USD", BTC).await;
    server.stop();
}

#[tokio::test]
async fn test_client_logoff_closes_session() {
    let server = start(local_config()).await;
    let mut client = Client::connect(&server).await;
    wait_until(|| server.status().sessions == 1).await;

    client
        .send(protocol::messages::Logoff {
            reason: "done".into(),
            do_not_reconnect: true,
        })
        .await;
    assert!(client.recv().await.is_none());
    wait_until(|| server.status().sessions == 0).await;

    server.stop();
}

#[tokio::test]
async fn test_stop_sends_logoff() {
    let server = start(local_config()).await;
    let mut clients = vec![
        Client::connect(&server).await,
        Client::connect(&server).await,
    ];
    wait_until(|| server.status().sessions == 2).await;

    server.stop();
    assert!(!server.is_running());

    for client in &mut clients {
        match client.recv().await {
            Some(Message::Logoff(logoff)) => assert!(!logoff.do_not_reconnect),
            other => panic!("expected logoff, got {other:?}"),
        }
        assert!(client.recv().await.is_none());
    }
    assert_eq!(server.status().sessions, 0);
    assert_eq!(server.metrics()["sessions_closed"], 2);
}

#[tokio::test]
async fn test_session_events_are_published() {
    use dtc_server::registry::SessionEvent;

    let server = start(local_config()).await;
    let mut events = server.subscribe_events();

    let client = Client::connect(&server).await;
    let connected = tokio::time::timeout(RECV_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    let SessionEvent::Connected { session_id, .. } = connected else {
        panic!("expected connect event");
    };

    drop(client);
    let disconnected = tokio::time::timeout(RECV_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        disconnected,
        SessionEvent::Disconnected { session_id: id, .. } if id == session_id
    ));

    server.stop();
}
