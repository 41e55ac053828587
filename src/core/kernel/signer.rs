use crate::core::config::Credentials;
use crate::core::errors::ExchangeError;
use base64::engine::general_purpose;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_API_KEY: &str = "KC-API-KEY";
pub const HEADER_API_SIGN: &str = "KC-API-SIGN";
pub const HEADER_API_TIMESTAMP: &str = "KC-API-TIMESTAMP";
pub const HEADER_API_PASSPHRASE: &str = "KC-API-PASSPHRASE";
pub const HEADER_API_KEY_VERSION: &str = "KC-API-KEY-VERSION";

/// Result type for signing operations: the authentication headers to attach
pub type SignatureResult = Result<HashMap<String, String>, ExchangeError>;

/// HMAC-SHA256 over `message` keyed with `secret`, base64 encoded.
pub fn sign(secret: &[u8], message: &[u8]) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| ExchangeError::AuthError(format!("Invalid secret key: {}", e)))?;
    mac.update(message);
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// The exact byte string the exchange verifies:
/// `timestamp + METHOD + path[?query] + body`
pub fn canonical_message(
    timestamp: u64,
    method: &str,
    endpoint: &str,
    query_string: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut message = format!("{}{}{}", timestamp, method.to_uppercase(), endpoint).into_bytes();
    if !query_string.is_empty() {
        message.push(b'?');
        message.extend_from_slice(query_string.as_bytes());
    }
    message.extend_from_slice(body);
    message
}

/// Signer trait for request authentication
///
/// Implementations receive the request components exactly as they will be
/// sent and return the headers that authenticate them.
pub trait Signer: Send + Sync {
    /// Sign a request and return the authentication headers
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.)
    /// * `endpoint` - API endpoint path
    /// * `query_string` - Encoded query string (without leading '?')
    /// * `body` - Raw request body bytes
    /// * `timestamp` - Request timestamp in milliseconds
    fn sign_request(
        &self,
        method: &str,
        endpoint: &str,
        query_string: &str,
        body: &[u8],
        timestamp: u64,
    ) -> SignatureResult;
}

/// HMAC signer bound to one set of credentials
#[derive(Debug, Clone)]
pub struct HmacSigner {
    credentials: Arc<Credentials>,
}

impl HmacSigner {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Arc::new(credentials),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Passphrase header value for the configured key version
    fn passphrase_header(&self) -> Result<String, ExchangeError> {
        let passphrase = self.credentials.passphrase();
        if self.credentials.key_version().signs_passphrase() {
            sign(
                self.credentials.api_secret().as_bytes(),
                passphrase.as_bytes(),
            )
        } else {
            Ok(passphrase.to_string())
        }
    }
}

impl Signer for HmacSigner {
    fn sign_request(
        &self,
        method: &str,
        endpoint: &str,
        query_string: &str,
        body: &[u8],
        timestamp: u64,
    ) -> SignatureResult {
        let message = canonical_message(timestamp, method, endpoint, query_string, body);
        let signature = sign(self.credentials.api_secret().as_bytes(), &message)?;

        let mut headers = HashMap::new();
        headers.insert(
            HEADER_API_KEY.to_string(),
            self.credentials.api_key().to_string(),
        );
        headers.insert(HEADER_API_SIGN.to_string(), signature);
        headers.insert(HEADER_API_TIMESTAMP.to_string(), timestamp.to_string());
        headers.insert(HEADER_API_PASSPHRASE.to_string(), self.passphrase_header()?);
        headers.insert(
            HEADER_API_KEY_VERSION.to_string(),
            self.credentials.key_version().as_str().to_string(),
        );
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        Ok(headers)
    }
}
