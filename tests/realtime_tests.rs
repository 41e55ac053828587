use async_trait::async_trait;
use futures::StreamExt;
use kucoin_link::core::errors::ExchangeError;
use kucoin_link::core::kernel::{WsConfig, WsConnector, WsSession};
use kucoin_link::exchanges::kucoin::{
    ConnectionToken, InstanceServer, RealtimeClient, SessionState, TokenProvider,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(2);

/// Client half of an in-memory connection
struct MemorySession {
    outbound: UnboundedSender<Message>,
    inbound: UnboundedReceiver<Message>,
}

#[async_trait]
impl WsSession for MemorySession {
    async fn send_raw(&mut self, msg: Message) -> Result<(), ExchangeError> {
        self.outbound
            .send(msg)
            .map_err(|_| ExchangeError::NetworkError("server gone".to_string()))
    }

    async fn next_raw(&mut self) -> Option<Result<Message, ExchangeError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ExchangeError> {
        self.inbound.close();
        Ok(())
    }
}

/// Server half; dropping it disconnects the client
struct ServerEnd {
    url: String,
    to_client: UnboundedSender<Message>,
    from_client: UnboundedReceiver<Message>,
}

impl ServerEnd {
    fn send(&self, frame: Value) {
        let _ = self.to_client.send(Message::Text(frame.to_string()));
    }

    fn send_text(&self, text: &str) {
        let _ = self.to_client.send(Message::Text(text.to_string()));
    }

    async fn recv(&mut self) -> Value {
        self.recv_within(WAIT)
            .await
            .expect("no frame from client")
    }

    async fn recv_within(&mut self, wait: Duration) -> Option<Value> {
        match tokio::time::timeout(wait, self.from_client.recv()).await {
            Ok(Some(Message::Text(text))) => Some(serde_json::from_str(&text).unwrap()),
            Ok(Some(other)) => panic!("unexpected message: {:?}", other),
            Ok(None) | Err(_) => None,
        }
    }
}

struct MemoryConnector {
    welcome: bool,
    accept_limit: usize,
    accepted: AtomicUsize,
    servers: UnboundedSender<ServerEnd>,
}

impl MemoryConnector {
    fn new(welcome: bool, accept_limit: usize) -> (Arc<Self>, UnboundedReceiver<ServerEnd>) {
        let (servers, accepted_rx) = unbounded_channel();
        let connector = Arc::new(Self {
            welcome,
            accept_limit,
            accepted: AtomicUsize::new(0),
            servers,
        });
        (connector, accepted_rx)
    }
}

#[async_trait]
impl WsConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsSession>, ExchangeError> {
        if self.accepted.fetch_add(1, Ordering::SeqCst) >= self.accept_limit {
            return Err(ExchangeError::NetworkError("connection refused".to_string()));
        }

        let (to_client, inbound) = unbounded_channel();
        let (outbound, from_client) = unbounded_channel();
        let server = ServerEnd {
            url: url.to_string(),
            to_client,
            from_client,
        };
        if self.welcome {
            server.send(json!({"id": "welcome-1", "type": "welcome"}));
        }
        let _ = self.servers.send(server);

        Ok(Box::new(MemorySession { outbound, inbound }))
    }
}

struct StaticTokens {
    token: ConnectionToken,
    calls: AtomicUsize,
}

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn fetch_token(&self) -> Result<ConnectionToken, ExchangeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.token.clone())
    }
}

fn token(ping_interval: u64, ping_timeout: u64) -> ConnectionToken {
    let server = |endpoint: &str| InstanceServer {
        endpoint: endpoint.to_string(),
        protocol: "websocket".to_string(),
        encrypt: true,
        ping_interval,
        ping_timeout,
    };
    ConnectionToken {
        token: "tok-1".to_string(),
        servers: vec![server("wss://one.test/"), server("wss://two.test/")],
    }
}

fn quiet_token() -> ConnectionToken {
    token(60_000, 10_000)
}

fn config() -> WsConfig {
    WsConfig::default()
        .with_connect_timeout(Duration::from_millis(500))
        .with_reconnect_delay(Duration::from_millis(10), Duration::from_millis(50))
}

struct Harness {
    client: Arc<RealtimeClient>,
    servers: UnboundedReceiver<ServerEnd>,
    tokens: Arc<StaticTokens>,
}

impl Harness {
    async fn start(config: WsConfig, token: ConnectionToken) -> (Self, ServerEnd) {
        Self::start_with_limit(config, token, usize::MAX).await
    }

    async fn start_with_limit(
        config: WsConfig,
        token: ConnectionToken,
        accept_limit: usize,
    ) -> (Self, ServerEnd) {
        let (connector, servers) = MemoryConnector::new(true, accept_limit);
        let tokens = Arc::new(StaticTokens {
            token: token.clone(),
            calls: AtomicUsize::new(0),
        });
        let client = RealtimeClient::connect(token, tokens.clone(), connector, config)
            .await
            .unwrap();

        let mut harness = Self {
            client: Arc::new(client),
            servers,
            tokens,
        };
        let server = harness.next_server().await;
        (harness, server)
    }

    async fn next_server(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped")
    }

    fn token_calls(&self) -> usize {
        self.tokens.calls.load(Ordering::SeqCst)
    }
}

async fn wait_for_state(client: &RealtimeClient, expected: SessionState) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while client.state() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "state stuck at {:?}, expected {:?}",
            client.state(),
            expected
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn message(topic: &str, data: Value) -> Value {
    json!({"type": "message", "topic": topic, "subject": "trade.ticker", "data": data})
}

#[tokio::test]
async fn test_missing_welcome_times_out() {
    let (connector, mut servers) = MemoryConnector::new(false, usize::MAX);
    let tokens = Arc::new(StaticTokens {
        token: quiet_token(),
        calls: AtomicUsize::new(0),
    });

    let err = RealtimeClient::connect(
        quiet_token(),
        tokens,
        connector,
        config().with_connect_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ExchangeError::ConnectionTimeout(_)));

    let server = servers.recv().await.unwrap();
    let (base, connect_id) = server.url.split_once("&connectId=").unwrap();
    assert_eq!(base, "wss://one.test/?token=tok-1");
    assert_eq!(connect_id.len(), 16);
    assert!(connect_id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_subscribe_waits_for_ack_and_keeps_early_data() {
    let (harness, mut server) = Harness::start(config(), quiet_token()).await;
    assert_eq!(harness.client.state(), SessionState::Connected);

    let client = harness.client.clone();
    let pending =
        tokio::spawn(async move { client.subscribe("/market/ticker:BTC-USDT", false, true).await });

    let frame = server.recv().await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["topic"], "/market/ticker:BTC-USDT");
    assert_eq!(frame["privateChannel"], false);
    assert_eq!(frame["response"], true);

    server.send(message("/market/ticker:BTC-USDT", json!({"price": "100.5"})));
    server.send(json!({"id": frame["id"], "type": "ack"}));

    let mut stream = pending.await.unwrap().unwrap();
    assert_eq!(stream.topic(), "/market/ticker:BTC-USDT");
    let received = stream.recv().await.unwrap().unwrap();
    assert_eq!(received.topic, "/market/ticker:BTC-USDT");
    assert_eq!(received.subject, "trade.ticker");
    assert_eq!(received.raw_data(), r#"{"price":"100.5"}"#);
}

#[tokio::test]
async fn test_ack_timeout_rolls_back_subscription() {
    let (harness, mut server) = Harness::start(
        config().with_ack_timeout(Duration::from_millis(150)),
        quiet_token(),
    )
    .await;

    let client = harness.client.clone();
    let pending = tokio::spawn(async move { client.subscribe("/market/level2:ETH-USDT", false, true).await });

    let subscribe = server.recv().await;
    assert_eq!(subscribe["type"], "subscribe");

    match pending.await.unwrap().unwrap_err() {
        ExchangeError::AckTimeout { id, topic } => {
            assert_eq!(Value::String(id), subscribe["id"]);
            assert_eq!(topic, "/market/level2:ETH-USDT");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let unsubscribe = server.recv().await;
    assert_eq!(unsubscribe["type"], "unsubscribe");
    assert_eq!(unsubscribe["topic"], "/market/level2:ETH-USDT");
    assert!(harness.client.active_topics().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_server_ping_gets_pong() {
    let (_harness, mut server) = Harness::start(config(), quiet_token()).await;

    server.send(json!({"id": "srv-7", "type": "ping"}));
    let pong = server.recv().await;
    assert_eq!(pong, json!({"id": "srv-7", "type": "pong"}));
}

#[tokio::test]
async fn test_client_ping_answered_keeps_session() {
    let (harness, mut server) = Harness::start(config(), token(100, 100)).await;

    for _ in 0..3 {
        let ping = server.recv().await;
        assert_eq!(ping["type"], "ping");
        server.send(json!({"id": ping["id"], "type": "pong"}));
    }
    assert_eq!(harness.client.state(), SessionState::Connected);
    assert_eq!(harness.token_calls(), 0);
}

#[tokio::test]
async fn test_slow_consumer_keeps_heartbeat() {
    let (mut harness, mut server) = Harness::start(
        config().with_message_buffer_size(1),
        token(200, 300),
    )
    .await;

    let mut stream = harness
        .client
        .subscribe("/market/ticker:BTC-USDT", false, false)
        .await
        .unwrap();
    assert_eq!(server.recv().await["type"], "subscribe");
    for price in ["1", "2", "3"] {
        server.send(message("/market/ticker:BTC-USDT", json!({ "price": price })));
    }

    // Delivery is blocked on the full queue, pings still go out
    let ping = server.recv().await;
    assert_eq!(ping["type"], "ping");
    server.send(json!({"id": ping["id"], "type": "pong"}));

    tokio::time::sleep(Duration::from_secs(1)).await;
    for price in ["1", "2", "3"] {
        let received = stream.recv().await.unwrap().unwrap();
        assert_eq!(received.raw_data(), format!(r#"{{"price":"{}"}}"#, price));
    }

    let ping = server.recv().await;
    assert_eq!(ping["type"], "ping");
    server.send(json!({"id": ping["id"], "type": "pong"}));

    assert_eq!(harness.client.state(), SessionState::Connected);
    assert_eq!(harness.token_calls(), 0);
    assert!(harness.servers.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_pong_is_fatal_without_reconnect() {
    let (harness, mut server) = Harness::start(
        config().with_auto_reconnect(false),
        token(200, 100),
    )
    .await;

    let mut stream = harness
        .client
        .subscribe("/market/ticker:BTC-USDT", false, false)
        .await
        .unwrap();
    assert_eq!(server.recv().await["type"], "subscribe");
    assert_eq!(server.recv().await["type"], "ping");

    let err = stream.recv().await.unwrap().unwrap_err();
    assert!(matches!(err, ExchangeError::HeartbeatTimeout { timeout_ms: 100 }));
    assert!(stream.recv().await.is_none());

    wait_for_state(&harness.client, SessionState::Closed).await;
    let err = harness
        .client
        .subscribe("/market/ticker:BTC-USDT", false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::SessionClosed));
    assert_eq!(harness.token_calls(), 0);
}

#[tokio::test]
async fn test_missing_pong_reconnects_to_next_server() {
    let (mut harness, mut server) = Harness::start(config(), token(200, 100)).await;

    let mut stream = harness
        .client
        .subscribe("/market/ticker:BTC-USDT", false, false)
        .await
        .unwrap();
    let first = server.recv().await;
    assert_eq!(server.recv().await["type"], "ping");

    let mut second = harness.next_server().await;
    assert!(second.url.starts_with("wss://two.test/?token=tok-1&connectId="));
    assert_eq!(harness.token_calls(), 1);

    let resubscribe = second.recv().await;
    assert_eq!(resubscribe["type"], "subscribe");
    assert_eq!(resubscribe["topic"], "/market/ticker:BTC-USDT");
    assert_ne!(resubscribe["id"], first["id"]);

    wait_for_state(&harness.client, SessionState::Connected).await;
    second.send(message("/market/ticker:BTC-USDT", json!({"price": "1"})));
    let received = stream.recv().await.unwrap().unwrap();
    assert_eq!(received.raw_data(), r#"{"price":"1"}"#);
}

#[tokio::test]
async fn test_subscribe_during_reconnect_is_replayed_once() {
    let (mut harness, mut server) = Harness::start(
        config().with_reconnect_delay(Duration::from_millis(300), Duration::from_millis(300)),
        quiet_token(),
    )
    .await;

    let _ticker = harness
        .client
        .subscribe("/market/ticker:BTC-USDT", false, false)
        .await
        .unwrap();
    server.recv().await;

    drop(server);
    wait_for_state(&harness.client, SessionState::Connecting).await;

    let client = harness.client.clone();
    let pending = tokio::spawn(async move { client.subscribe("/market/match:ETH-USDT", false, true).await });

    let mut second = harness.next_server().await;
    let mut frames = vec![second.recv().await, second.recv().await];
    frames.sort_by(|a, b| a["topic"].as_str().cmp(&b["topic"].as_str()));
    assert!(frames.iter().all(|frame| frame["type"] == "subscribe"));
    assert_eq!(frames[0]["topic"], "/market/match:ETH-USDT");
    assert_eq!(frames[0]["response"], true);
    assert_eq!(frames[1]["topic"], "/market/ticker:BTC-USDT");

    second.send(json!({"id": frames[0]["id"], "type": "ack"}));
    pending.await.unwrap().unwrap();
    assert!(second.recv_within(Duration::from_millis(100)).await.is_none());

    assert_eq!(
        harness.client.active_topics().await.unwrap(),
        vec!["/market/match:ETH-USDT", "/market/ticker:BTC-USDT"]
    );
}

#[tokio::test]
async fn test_unsubscribed_topic_drops_late_messages() {
    let (harness, mut server) = Harness::start(config(), quiet_token()).await;

    let mut gone = harness
        .client
        .subscribe("/market/ticker:BTC-USDT", false, false)
        .await
        .unwrap();
    let mut kept = harness
        .client
        .subscribe("/market/ticker:ETH-USDT", false, false)
        .await
        .unwrap();
    server.recv().await;
    server.recv().await;

    harness
        .client
        .unsubscribe("/market/ticker:BTC-USDT")
        .await
        .unwrap();
    let unsubscribe = server.recv().await;
    assert_eq!(unsubscribe["type"], "unsubscribe");
    assert_eq!(unsubscribe["topic"], "/market/ticker:BTC-USDT");

    server.send(message("/market/ticker:BTC-USDT", json!({"late": true})));
    server.send(message("/market/ticker:ETH-USDT", json!({"late": false})));

    let received = kept.recv().await.unwrap().unwrap();
    assert_eq!(received.topic, "/market/ticker:ETH-USDT");
    assert!(gone.recv().await.is_none());
}

#[tokio::test]
async fn test_stop_cancels_pending_subscribe() {
    let (harness, mut server) = Harness::start(config(), quiet_token()).await;

    let client = harness.client.clone();
    let pending = tokio::spawn(async move { client.subscribe("/spotMarket/tradeOrders", true, true).await });
    let frame = server.recv().await;
    assert_eq!(frame["privateChannel"], true);

    harness.client.stop().await;

    assert!(matches!(
        pending.await.unwrap().unwrap_err(),
        ExchangeError::Cancelled
    ));
    assert_eq!(harness.client.state(), SessionState::Closed);
    assert!(matches!(
        harness.client.active_topics().await.unwrap_err(),
        ExchangeError::SessionClosed
    ));
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let (harness, mut server) = Harness::start_with_limit(
        config().with_max_reconnect_attempts(2),
        quiet_token(),
        1,
    )
    .await;

    let mut stream = harness
        .client
        .subscribe("/market/ticker:BTC-USDT", false, false)
        .await
        .unwrap();
    server.recv().await;
    drop(server);

    match stream.recv().await.unwrap().unwrap_err() {
        ExchangeError::ReconnectFailed {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 2);
            assert!(last_error.contains("connection refused"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(stream.recv().await.is_none());

    wait_for_state(&harness.client, SessionState::Closed).await;
    assert_eq!(harness.token_calls(), 2);
}

#[tokio::test]
async fn test_multi_symbol_topic_routing() {
    let (harness, mut server) = Harness::start(config(), quiet_token()).await;

    let mut stream = harness
        .client
        .subscribe("/market/match:BTC-USDT,ETH-USDT", false, false)
        .await
        .unwrap();
    server.recv().await;

    server.send(message("/market/match:XRP-USDT", json!({"n": 0})));
    server.send(message("/market/match:ETH-USDT", json!({"n": 1})));
    server.send(message("/market/match:BTC-USDT", json!({"n": 2})));

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.topic, "/market/match:ETH-USDT");
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.topic, "/market/match:BTC-USDT");

    #[derive(serde::Deserialize)]
    struct Payload {
        n: u32,
    }
    assert_eq!(second.decode::<Payload>().unwrap().n, 2);
}

#[tokio::test]
async fn test_error_frame_rejects_subscribe() {
    let (harness, mut server) = Harness::start(config(), quiet_token()).await;

    let client = harness.client.clone();
    let pending = tokio::spawn(async move { client.subscribe("/market/nothing:X", false, true).await });
    let frame = server.recv().await;

    server.send(json!({
        "id": frame["id"],
        "type": "error",
        "code": 404,
        "data": "topic /market/nothing:X is not found"
    }));

    match pending.await.unwrap().unwrap_err() {
        ExchangeError::RealtimeError { code, message } => {
            assert_eq!(code, "404");
            assert_eq!(message, "topic /market/nothing:X is not found");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(harness.client.active_topics().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_frame_reaches_streams() {
    let (harness, mut server) = Harness::start(config(), quiet_token()).await;

    let mut stream = harness
        .client
        .subscribe("/market/ticker:BTC-USDT", false, false)
        .await
        .unwrap();
    server.recv().await;

    server.send_text("{not json");
    let err = stream.recv().await.unwrap().unwrap_err();
    assert!(matches!(err, ExchangeError::ProtocolError(_)));
    assert_eq!(harness.client.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_dropped_stream_unsubscribes() {
    let (harness, mut server) = Harness::start(config(), quiet_token()).await;

    let stream = harness
        .client
        .subscribe("/market/snapshot:BTC-USDT", false, false)
        .await
        .unwrap();
    server.recv().await;
    drop(stream);

    server.send(message("/market/snapshot:BTC-USDT", json!({})));
    let unsubscribe = server.recv().await;
    assert_eq!(unsubscribe["type"], "unsubscribe");
    assert_eq!(unsubscribe["topic"], "/market/snapshot:BTC-USDT");
    assert!(harness.client.active_topics().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_topic_rejected_locally() {
    let (harness, mut server) = Harness::start(config(), quiet_token()).await;

    let err = harness.client.subscribe("", false, false).await.unwrap_err();
    assert!(matches!(err, ExchangeError::InvalidParameters(_)));
    assert!(server.recv_within(Duration::from_millis(50)).await.is_none());
}
