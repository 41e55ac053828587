use crate::core::errors::ExchangeError;
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for converting between raw WebSocket messages and typed
/// control/data frames.
pub trait WsCodec: Send + Sync + 'static {
    /// Outbound frame type
    type Request: Send;

    /// Inbound frame type
    type Message: Send;

    /// Encode an outbound frame into a WebSocket message
    fn encode(&self, request: &Self::Request) -> Result<Message, ExchangeError>;

    /// Decode a raw WebSocket message into a typed frame
    ///
    /// Transport-level control messages (ping, pong, close) are not passed here.
    ///
    /// # Returns
    /// - `Ok(Some(frame))` - Successfully decoded frame
    /// - `Ok(None)` - Message carries nothing for the caller
    /// - `Err(error)` - Malformed frame
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError>;
}
