use crate::core::errors::ExchangeError;
use crate::core::kernel::RestClient;
use crate::exchanges::kucoin::response;
use crate::exchanges::kucoin::types::ConnectionToken;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

pub const BULLET_PUBLIC_ENDPOINT: &str = "/api/v1/bullet-public";
pub const BULLET_PRIVATE_ENDPOINT: &str = "/api/v1/bullet-private";

/// Source of realtime connection tokens. Called once per connection attempt,
/// reconnects included, since tokens are single-use.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<ConnectionToken, ExchangeError>;
}

/// Unsigned bootstrap for public channels
pub async fn fetch_public_token<R: RestClient>(rest: &R) -> Result<ConnectionToken, ExchangeError> {
    fetch_token(rest, BULLET_PUBLIC_ENDPOINT, false).await
}

/// Signed bootstrap for private channels
pub async fn fetch_private_token<R: RestClient>(
    rest: &R,
) -> Result<ConnectionToken, ExchangeError> {
    fetch_token(rest, BULLET_PRIVATE_ENDPOINT, true).await
}

#[instrument(skip(rest))]
async fn fetch_token<R: RestClient>(
    rest: &R,
    endpoint: &str,
    authenticated: bool,
) -> Result<ConnectionToken, ExchangeError> {
    let raw = rest.post::<()>(endpoint, None, authenticated).await?;
    let token: ConnectionToken = response::decode_as(&raw)?;

    if token.token.is_empty() {
        return Err(ExchangeError::ProtocolError(
            "Connection token is empty".to_string(),
        ));
    }
    // Rejects an empty server list
    token.server(0)?;

    debug!(servers = token.servers.len(), "Fetched connection token");
    Ok(token)
}

/// `TokenProvider` backed by the bootstrap REST endpoints
#[derive(Debug)]
pub struct TokenFetcher<R: RestClient> {
    rest: Arc<R>,
    private: bool,
}

impl<R: RestClient> TokenFetcher<R> {
    pub fn public(rest: Arc<R>) -> Self {
        Self {
            rest,
            private: false,
        }
    }

    pub fn private(rest: Arc<R>) -> Self {
        Self {
            rest,
            private: true,
        }
    }

    pub const fn is_private(&self) -> bool {
        self.private
    }
}

#[async_trait]
impl<R: RestClient + 'static> TokenProvider for TokenFetcher<R> {
    async fn fetch_token(&self) -> Result<ConnectionToken, ExchangeError> {
        if self.private {
            fetch_private_token(self.rest.as_ref()).await
        } else {
            fetch_public_token(self.rest.as_ref()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::RestResponse;
    use reqwest::Method;
    use std::sync::Mutex;

    struct CannedRest {
        body: String,
        calls: Mutex<Vec<(Method, String, bool)>>,
    }

    impl CannedRest {
        fn new(body: &str) -> Self {
            Self {
                body: body.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RestClient for CannedRest {
        async fn execute(
            &self,
            method: Method,
            endpoint: &str,
            _query_params: &[(&str, &str)],
            body: Vec<u8>,
            authenticated: bool,
        ) -> Result<RestResponse, ExchangeError> {
            assert!(body.is_empty());
            self.calls
                .lock()
                .unwrap()
                .push((method, endpoint.to_string(), authenticated));
            Ok(RestResponse {
                status: 200,
                body: self.body.clone(),
            })
        }
    }

    const TOKEN_BODY: &str = r#"{"code":"200000","data":{"token":"tok-1","instanceServers":[
        {"endpoint":"wss://ws-api-spot.kucoin.com/","protocol":"websocket","encrypt":true,
         "pingInterval":18000,"pingTimeout":10000}]}}"#;

    #[tokio::test]
    async fn test_public_token_is_unsigned() {
        let rest = Arc::new(CannedRest::new(TOKEN_BODY));
        let fetcher = TokenFetcher::public(rest.clone());
        let token = fetcher.fetch_token().await.unwrap();

        assert_eq!(token.token, "tok-1");
        assert_eq!(token.servers[0].ping_timeout, 10000);
        let calls = rest.calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            &[(Method::POST, BULLET_PUBLIC_ENDPOINT.to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_private_token_is_signed() {
        let rest = Arc::new(CannedRest::new(TOKEN_BODY));
        let fetcher = TokenFetcher::private(rest.clone());
        assert!(fetcher.is_private());
        fetcher.fetch_token().await.unwrap();

        let calls = rest.calls.lock().unwrap();
        assert_eq!(calls[0].1, BULLET_PRIVATE_ENDPOINT);
        assert!(calls[0].2);
    }

    #[tokio::test]
    async fn test_empty_server_list_rejected() {
        let rest = CannedRest::new(r#"{"code":"200000","data":{"token":"t","instanceServers":[]}}"#);
        let err = fetch_public_token(&rest).await.unwrap_err();
        assert!(matches!(err, ExchangeError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_business_error_surfaces() {
        let rest = CannedRest::new(r#"{"code":"400003","msg":"KC-API-KEY not exists"}"#);
        let err = fetch_private_token(&rest).await.unwrap_err();
        assert!(err.is_auth());
    }
}
