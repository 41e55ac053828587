/// Kernel - exchange-agnostic transport layer
///
/// The kernel holds only transport and authentication plumbing; anything that
/// knows about a specific exchange's payloads lives under `exchanges`.
///
/// ## Transport
/// - `RestClient` / `ReqwestRest`: HTTP with per-request signing
/// - `WsSession` / `WsConnector`: duplex connections, swappable in tests
///
/// ## Authentication
/// - `Signer`: pluggable request authentication
/// - `HmacSigner`: HMAC-SHA256 with base64 output and passphrase headers
///
/// ## Message Handling
/// - `WsCodec`: encode/decode of realtime frames
///
/// # Example
/// ```rust,no_run
/// use kucoin_link::core::config::{Credentials, KeyVersion};
/// use kucoin_link::core::kernel::*;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let credentials = Credentials::new("key", "secret", "passphrase", KeyVersion::V2);
/// let rest = RestClientBuilder::new(RestClientConfig::new(
///     "https://api.kucoin.com".to_string(),
///     "kucoin".to_string(),
/// ))
/// .with_signer(Arc::new(HmacSigner::new(credentials)))
/// .build()?;
///
/// let response = rest.get("/api/v1/accounts", &[("currency", "USDT")], true).await?;
/// println!("{}", response.body);
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod rest;
pub mod signer;
pub mod ws;

pub use codec::WsCodec;
pub use rest::{
    encode_query, prepare_request, PreparedRequest, ReqwestRest, RestClient, RestClientBuilder,
    RestClientConfig, RestResponse,
};
pub use signer::{canonical_message, sign, HmacSigner, SignatureResult, Signer};
pub use ws::{TungsteniteConnector, TungsteniteWs, WsConfig, WsConnector, WsSession};
