use crate::core::errors::ExchangeError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, instrument};

/// Realtime connection tuning
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Bound on transport open plus the server's welcome frame, in milliseconds
    pub connect_timeout_ms: u64,
    /// How long a subscribe waits for its ack, in milliseconds
    pub ack_timeout_ms: u64,
    /// Per-subscription message queue capacity
    pub message_buffer_size: usize,
    /// Reconnect after a lost connection instead of failing the session
    pub auto_reconnect: bool,
    /// Max reconnection attempts before the session is closed
    pub max_reconnect_attempts: u32,
    /// Initial reconnection delay in milliseconds
    pub reconnect_delay_ms: u64,
    /// Cap for the exponential reconnection delay in milliseconds
    pub max_reconnect_delay_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
            message_buffer_size: 1024,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 60_000,
        }
    }
}

impl WsConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_message_buffer_size(mut self, size: usize) -> Self {
        self.message_buffer_size = size.max(1);
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, max_attempts: u32) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay_ms = initial.as_millis() as u64;
        self.max_reconnect_delay_ms = max.as_millis() as u64;
        self
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based): doubles from the
    /// initial delay up to the cap
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.reconnect_delay_ms
                .saturating_mul(factor)
                .min(self.max_reconnect_delay_ms),
        )
    }
}

/// One open duplex connection - pure transport
#[async_trait]
pub trait WsSession: Send {
    /// Send a raw message
    async fn send_raw(&mut self, msg: Message) -> Result<(), ExchangeError>;

    /// Receive the next raw message; `None` once the peer is gone.
    /// Must be cancel-safe: it is raced against timers.
    async fn next_raw(&mut self) -> Option<Result<Message, ExchangeError>>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), ExchangeError>;
}

/// Opens sessions; one call per connection attempt
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsSession>, ExchangeError>;
}

type TungsteniteStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Tungstenite-based WebSocket session
pub struct TungsteniteWs {
    write: futures_util::stream::SplitSink<TungsteniteStream, Message>,
    read: futures_util::stream::SplitStream<TungsteniteStream>,
    exchange_name: String,
}

#[async_trait]
impl WsSession for TungsteniteWs {
    #[instrument(skip(self, msg), fields(exchange = %self.exchange_name))]
    async fn send_raw(&mut self, msg: Message) -> Result<(), ExchangeError> {
        self.write.send(msg).await.map_err(|e| {
            ExchangeError::NetworkError(format!("Failed to send WebSocket message: {}", e))
        })
    }

    async fn next_raw(&mut self) -> Option<Result<Message, ExchangeError>> {
        match self.read.next().await {
            Some(Ok(message)) => Some(Ok(message)),
            Some(Err(e)) => Some(Err(ExchangeError::NetworkError(format!(
                "WebSocket error: {}",
                e
            )))),
            None => None,
        }
    }

    #[instrument(skip(self), fields(exchange = %self.exchange_name))]
    async fn close(&mut self) -> Result<(), ExchangeError> {
        let _ = self.write.send(Message::Close(None)).await;
        self.write.close().await.map_err(|e| {
            ExchangeError::NetworkError(format!("Failed to close WebSocket: {}", e))
        })
    }
}

/// Connector producing `TungsteniteWs` sessions
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    exchange_name: String,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(exchange_name: String, connect_timeout: Duration) -> Self {
        Self {
            exchange_name,
            connect_timeout,
        }
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    #[instrument(skip(self, url), fields(exchange = %self.exchange_name))]
    async fn connect(&self, url: &str) -> Result<Box<dyn WsSession>, ExchangeError> {
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                ExchangeError::ConnectionTimeout("WebSocket connection timeout".to_string())
            })?
            .map_err(|e| {
                ExchangeError::NetworkError(format!("WebSocket connection failed: {}", e))
            })?;

        debug!("WebSocket transport open");

        let (write, read) = ws_stream.split();
        Ok(Box::new(TungsteniteWs {
            write,
            read,
            exchange_name: self.exchange_name.clone(),
        }))
    }
}
