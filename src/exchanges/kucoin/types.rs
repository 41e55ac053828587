use crate::core::errors::ExchangeError;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Opaque JSON payload, decoded only when the caller names a type
#[derive(Debug)]
pub struct RawData(Box<RawValue>);

impl RawData {
    pub fn new(raw: Box<RawValue>) -> Self {
        Self(raw)
    }

    pub(crate) fn null() -> Self {
        Self(RawValue::NULL.to_owned())
    }

    /// The payload exactly as received
    pub fn get(&self) -> &str {
        self.0.get()
    }

    pub fn is_null(&self) -> bool {
        self.0.get() == "null"
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ExchangeError> {
        serde_json::from_str(self.0.get()).map_err(|e| {
            ExchangeError::DeserializationError(format!("Failed to decode data: {}", e))
        })
    }
}

/// Paged list wrapper; `items` stays raw until `items::<T>()`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedData {
    pub current_page: u64,
    pub page_size: u64,
    pub total_num: u64,
    pub total_page: u64,
    items: Box<RawValue>,
}

impl PaginatedData {
    pub fn raw_items(&self) -> &str {
        self.items.get()
    }

    pub fn items<T: DeserializeOwned>(&self) -> Result<Vec<T>, ExchangeError> {
        serde_json::from_str(self.items.get()).map_err(|e| {
            ExchangeError::DeserializationError(format!("Failed to decode page items: {}", e))
        })
    }

    pub const fn has_next_page(&self) -> bool {
        self.current_page < self.total_page
    }
}

/// One realtime endpoint offered by the token endpoint, in ranked order
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceServer {
    pub endpoint: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub encrypt: bool,
    /// Milliseconds between client pings
    pub ping_interval: u64,
    /// Milliseconds to wait for the matching pong
    pub ping_timeout: u64,
}

/// Single-use realtime connection token
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionToken {
    pub token: String,
    #[serde(rename = "instanceServers")]
    pub servers: Vec<InstanceServer>,
}

impl ConnectionToken {
    /// Server for the given attempt, rotating through the ranked list
    pub fn server(&self, attempt: usize) -> Result<&InstanceServer, ExchangeError> {
        if self.servers.is_empty() {
            return Err(ExchangeError::ProtocolError(
                "Connection token has no instance servers".to_string(),
            ));
        }
        Ok(&self.servers[attempt % self.servers.len()])
    }

    /// `endpoint?token=<token>&connectId=<id>`
    pub fn connect_url(&self, server: &InstanceServer, connect_id: &str) -> String {
        let separator = if server.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}token={}&connectId={}",
            server.endpoint,
            separator,
            urlencoding::encode(&self.token),
            urlencoding::encode(connect_id)
        )
    }
}

/// Time reported by the server, milliseconds since epoch
pub type ServerTime = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Main,
    Trade,
    Margin,
}

impl AccountType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Trade => "trade",
            Self::Margin => "margin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Active,
    Done,
}

impl OrderStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Done => "done",
        }
    }
}

/// Account balance entry
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub currency: String,
    #[serde(rename = "type")]
    pub account_type: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub holds: Decimal,
}

/// Order as returned by the order list endpoint (subset of fields)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub deal_size: Option<String>,
    #[serde(default)]
    pub client_oid: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub cancel_exist: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResult {
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderResult {
    pub cancelled_order_ids: Vec<String>,
}
