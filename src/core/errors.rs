use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("API error: {code} - {message}")]
    ApiError { code: String, message: String },

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Local signing failure (bad key material, clock read failure)
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// The exchange rejected the credentials, signature or timestamp
    #[error("Authentication rejected: {code} - {message}")]
    AuthRejected { code: String, message: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),

    #[error("Realtime protocol error: {0}")]
    ProtocolError(String),

    #[error("Realtime error frame: {code} - {message}")]
    RealtimeError { code: String, message: String },

    #[error("No ack for subscription {id} on topic {topic}")]
    AckTimeout { id: String, topic: String },

    #[error("No pong within {timeout_ms}ms")]
    HeartbeatTimeout { timeout_ms: u64 },

    #[error("Reconnection failed after {attempts} attempts: {last_error}")]
    ReconnectFailed { attempts: u32, last_error: String },

    #[error("Realtime session stopped")]
    Cancelled,

    #[error("Realtime session is closed")]
    SessionClosed,
}

impl ExchangeError {
    /// Whether the error came from the exchange refusing the request's authentication
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthError(_) | Self::AuthRejected { .. })
    }

    /// Whether the error terminates a realtime session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReconnectFailed { .. } | Self::Cancelled | Self::SessionClosed
        )
    }
}
