use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::WsCodec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// Outbound control frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KucoinRequest {
    Subscribe {
        id: String,
        topic: String,
        #[serde(rename = "privateChannel")]
        private_channel: bool,
        response: bool,
    },
    Unsubscribe {
        id: String,
        topic: String,
        #[serde(rename = "privateChannel")]
        private_channel: bool,
        response: bool,
    },
    Ping {
        id: String,
    },
    Pong {
        id: String,
    },
}

/// Data frame for one topic; `data` is decoded on demand
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub subject: String,
    pub channel_type: Option<String>,
    data: Box<RawValue>,
}

impl TopicMessage {
    pub fn new(
        topic: String,
        subject: String,
        channel_type: Option<String>,
        data: Box<RawValue>,
    ) -> Self {
        Self {
            topic,
            subject,
            channel_type,
            data,
        }
    }

    /// Payload exactly as received
    pub fn raw_data(&self) -> &str {
        self.data.get()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ExchangeError> {
        serde_json::from_str(self.data.get()).map_err(|e| {
            ExchangeError::DeserializationError(format!(
                "Failed to decode data for topic {}: {}",
                self.topic, e
            ))
        })
    }
}

/// Inbound frames, dispatched by `type`
#[derive(Debug, Clone)]
pub enum WsFrame {
    Welcome { id: String },
    Ping { id: String },
    Pong { id: String },
    Ack { id: String },
    Message(TopicMessage),
    Error {
        id: Option<String>,
        code: String,
        message: String,
    },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default, rename = "channelType")]
    channel_type: Option<String>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

/// KuCoin realtime codec
#[derive(Debug, Clone, Copy, Default)]
pub struct KucoinCodec;

impl KucoinCodec {
    pub fn new() -> Self {
        Self
    }

    /// Decode one text frame
    pub fn decode_text(text: &str) -> Result<WsFrame, ExchangeError> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| ExchangeError::ProtocolError(format!("Malformed frame: {}", e)))?;

        let kind = raw
            .kind
            .ok_or_else(|| ExchangeError::ProtocolError(format!("Frame without type: {}", text)))?;
        let id = raw.id.as_ref().and_then(scalar_to_string);

        let require_id = |id: Option<String>| {
            id.ok_or_else(|| {
                ExchangeError::ProtocolError(format!("{} frame without id", kind))
            })
        };

        match kind.as_str() {
            "welcome" => Ok(WsFrame::Welcome { id: require_id(id)? }),
            "ping" => Ok(WsFrame::Ping { id: require_id(id)? }),
            "pong" => Ok(WsFrame::Pong { id: require_id(id)? }),
            "ack" => Ok(WsFrame::Ack { id: require_id(id)? }),
            "message" => {
                let topic = raw.topic.ok_or_else(|| {
                    ExchangeError::ProtocolError("message frame without topic".to_string())
                })?;
                let data = raw.data.ok_or_else(|| {
                    ExchangeError::ProtocolError(format!("message frame for {} without data", topic))
                })?;
                Ok(WsFrame::Message(TopicMessage::new(
                    topic,
                    raw.subject.unwrap_or_default(),
                    raw.channel_type,
                    data,
                )))
            }
            "error" => {
                let code = raw
                    .code
                    .as_ref()
                    .and_then(scalar_to_string)
                    .unwrap_or_default();
                // Error frames carry their text in `data`
                let message = match raw.data {
                    Some(data) => match serde_json::from_str::<String>(data.get()) {
                        Ok(text) => text,
                        Err(_) => data.get().to_string(),
                    },
                    None => String::new(),
                };
                Ok(WsFrame::Error { id, code, message })
            }
            other => Err(ExchangeError::ProtocolError(format!(
                "Unknown frame type: {}",
                other
            ))),
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl WsCodec for KucoinCodec {
    type Request = KucoinRequest;
    type Message = WsFrame;

    fn encode(&self, request: &Self::Request) -> Result<Message, ExchangeError> {
        let text = serde_json::to_string(request)
            .map_err(|e| ExchangeError::SerializationError(e.to_string()))?;
        Ok(Message::Text(text))
    }

    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8(data).map_err(|e| {
                ExchangeError::ProtocolError(format!("Invalid UTF-8 in binary message: {}", e))
            })?,
            _ => return Ok(None),
        };

        Self::decode_text(&text).map(Some)
    }
}
