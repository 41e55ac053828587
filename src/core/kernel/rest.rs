use crate::core::errors::ExchangeError;
use crate::core::kernel::signer::{canonical_message, Signer};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{instrument, trace};

/// Raw HTTP response handed to the envelope decoder
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub body: String,
}

impl RestResponse {
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// A fully built request: the exact path, query and body bytes that go on the
/// wire, plus the headers that authenticate them.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub endpoint: String,
    pub query_string: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: u64,
}

impl PreparedRequest {
    /// Endpoint with the encoded query appended
    pub fn path_and_query(&self) -> String {
        if self.query_string.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?{}", self.endpoint, self.query_string)
        }
    }

    /// The exact bytes the signature covers
    pub fn canonical_message(&self) -> Vec<u8> {
        canonical_message(
            self.timestamp,
            self.method.as_str(),
            &self.endpoint,
            &self.query_string,
            &self.body,
        )
    }
}

/// Percent-encode parameters in the order given. The exchange recomputes the
/// signature over the query it receives, so the caller's order is kept.
pub fn encode_query(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the outbound request, signing it when `signer` is given.
pub fn prepare_request(
    signer: Option<&dyn Signer>,
    method: Method,
    endpoint: &str,
    query_params: &[(&str, &str)],
    body: Vec<u8>,
    timestamp: u64,
) -> Result<PreparedRequest, ExchangeError> {
    let query_string = encode_query(query_params);

    let headers = match signer {
        Some(signer) => {
            signer.sign_request(method.as_str(), endpoint, &query_string, &body, timestamp)?
        }
        None => {
            let mut headers = HashMap::new();
            if !body.is_empty() {
                headers.insert("Content-Type".to_string(), "application/json".to_string());
            }
            headers
        }
    };

    Ok(PreparedRequest {
        method,
        endpoint: endpoint.to_string(),
        query_string,
        body,
        headers,
        timestamp,
    })
}

/// REST client trait for making HTTP requests
///
/// Implementations own transport and signing; decoding the response envelope
/// is left to the caller.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Issue a request
    ///
    /// # Arguments
    /// * `method` - HTTP method
    /// * `endpoint` - The API endpoint path
    /// * `query_params` - Query parameters, encoded in the given order
    /// * `body` - Raw request body bytes (empty for none)
    /// * `authenticated` - Whether to sign the request
    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        query_params: &[(&str, &str)],
        body: Vec<u8>,
        authenticated: bool,
    ) -> Result<RestResponse, ExchangeError>;

    /// Make a GET request
    async fn get(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<RestResponse, ExchangeError> {
        self.execute(Method::GET, endpoint, query_params, Vec::new(), authenticated)
            .await
    }

    /// Make a DELETE request
    async fn delete(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<RestResponse, ExchangeError> {
        self.execute(Method::DELETE, endpoint, query_params, Vec::new(), authenticated)
            .await
    }

    /// Make a POST request with a JSON body, serialized minified in
    /// declared field order
    async fn post<B: Serialize + Sync + ?Sized>(
        &self,
        endpoint: &str,
        body: Option<&B>,
        authenticated: bool,
    ) -> Result<RestResponse, ExchangeError> {
        let body_bytes = match body {
            Some(body) => serde_json::to_vec(body).map_err(|e| {
                ExchangeError::SerializationError(format!(
                    "Failed to serialize request body: {}",
                    e
                ))
            })?,
            None => Vec::new(),
        };

        self.execute(Method::POST, endpoint, &[], body_bytes, authenticated)
            .await
    }
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Exchange name for logging and tracing
    pub exchange_name: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl RestClientConfig {
    pub fn new(base_url: String, exchange_name: String) -> Self {
        Self {
            base_url,
            exchange_name,
            timeout_seconds: 30,
            user_agent: "kucoin-link/0.1".to_string(),
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
        }
    }

    /// Set the signer for authenticated requests
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn build(self) -> Result<ReqwestRest, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(self.config.timeout_seconds))
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| {
                ExchangeError::InvalidParameters(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
        })
    }
}

/// Implementation of `RestClient` using reqwest
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl ReqwestRest {
    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    /// Get the current timestamp in milliseconds
    fn get_timestamp() -> Result<u64, ExchangeError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .map_err(|e| ExchangeError::AuthError(format!("Failed to get timestamp: {}", e)))
    }

    fn build_url(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            path_and_query
        )
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    #[instrument(skip(self, query_params, body), fields(exchange = %self.config.exchange_name, method = %method, endpoint = %endpoint))]
    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        query_params: &[(&str, &str)],
        body: Vec<u8>,
        authenticated: bool,
    ) -> Result<RestResponse, ExchangeError> {
        let signer = if authenticated {
            Some(self.signer.as_deref().ok_or_else(|| {
                ExchangeError::AuthError(
                    "Authentication required but no signer provided".to_string(),
                )
            })?)
        } else {
            None
        };

        // Fresh per request: a reused timestamp would replay within the
        // server's skew window
        let timestamp = Self::get_timestamp()?;
        let prepared = prepare_request(signer, method, endpoint, query_params, body, timestamp)?;

        let url = self.build_url(&prepared.path_and_query());
        let mut request = self.client.request(prepared.method.clone(), &url);

        for (key, value) in &prepared.headers {
            request = request.header(key, value);
        }

        if !prepared.body.is_empty() {
            request = request.body(prepared.body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::ConnectionTimeout(format!("Request timed out: {}", e))
            } else {
                ExchangeError::NetworkError(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            ExchangeError::NetworkError(format!("Failed to read response body: {}", e))
        })?;

        trace!(status, "Response body: {}", body);

        Ok(RestResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Credentials, KeyVersion};
    use crate::core::kernel::signer::{canonical_message, sign, HmacSigner, HEADER_API_SIGN};

    #[test]
    fn test_encode_query_keeps_order() {
        let query = encode_query(&[("symbol", "BTC-USDT"), ("status", "active"), ("a", "1")]);
        assert_eq!(query, "symbol=BTC-USDT&status=active&a=1");
    }

    #[test]
    fn test_encode_query_percent_encodes() {
        let query = encode_query(&[("note", "a b&c=d"), ("x/y", "é")]);
        assert_eq!(query, "note=a%20b%26c%3Dd&x%2Fy=%C3%A9");
        assert_eq!(encode_query(&[]), "");
    }

    #[test]
    fn test_prepared_request_round_trip() {
        let signer = HmacSigner::new(Credentials::new(
            "key",
            "secret",
            "phrase",
            KeyVersion::V2,
        ));
        let prepared = prepare_request(
            Some(&signer),
            Method::GET,
            "/api/v1/orders",
            &[("status", "done"), ("symbol", "ETH-USDT")],
            Vec::new(),
            1_700_000_000_000,
        )
        .unwrap();

        assert_eq!(
            prepared.path_and_query(),
            "/api/v1/orders?status=done&symbol=ETH-USDT"
        );

        // Recompute independently from what goes on the wire
        let recomputed = format!(
            "{}{}{}",
            prepared.timestamp,
            prepared.method.as_str(),
            prepared.path_and_query()
        );
        assert_eq!(
            canonical_message(
                prepared.timestamp,
                prepared.method.as_str(),
                &prepared.endpoint,
                &prepared.query_string,
                &prepared.body
            ),
            recomputed.as_bytes()
        );
        assert_eq!(
            prepared.headers[HEADER_API_SIGN],
            sign(b"secret", recomputed.as_bytes()).unwrap()
        );
    }

    #[test]
    fn test_unsigned_request_has_no_auth_headers() {
        let prepared = prepare_request(
            None,
            Method::POST,
            "/api/v1/bullet-public",
            &[],
            Vec::new(),
            1,
        )
        .unwrap();
        assert!(prepared.headers.is_empty());
        assert_eq!(prepared.path_and_query(), "/api/v1/bullet-public");
    }

    #[tokio::test]
    async fn test_authenticated_request_without_signer_fails() {
        let rest = RestClientBuilder::new(RestClientConfig::new(
            "http://127.0.0.1:9".to_string(),
            "kucoin".to_string(),
        ))
        .build()
        .unwrap();

        let err = rest.get("/api/v1/accounts", &[], true).await.unwrap_err();
        assert!(matches!(err, ExchangeError::AuthError(_)));
    }
}
