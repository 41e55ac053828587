use crate::core::config::{ConfigError, Credentials, KucoinConfig};
use crate::core::errors::ExchangeError;
use crate::core::kernel::{
    HmacSigner, ReqwestRest, RestClientBuilder, RestClientConfig, TungsteniteConnector, WsConfig,
};
use crate::exchanges::kucoin::realtime::RealtimeClient;
use crate::exchanges::kucoin::rest::KucoinRest;
use crate::exchanges::kucoin::token::{TokenFetcher, TokenProvider};
use std::sync::Arc;
use tracing::instrument;

const EXCHANGE_NAME: &str = "kucoin";

/// Builder for KuCoin REST and realtime clients
///
/// Clients are plain values owned by the caller; nothing is global.
#[derive(Debug, Default)]
pub struct KucoinBuilder {
    config: KucoinConfig,
    ws_config: WsConfig,
    rest_timeout: Option<u64>,
    user_agent: Option<String>,
}

impl KucoinBuilder {
    /// Create a new `KucoinBuilder` with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the exchange configuration
    pub fn with_config(mut self, config: KucoinConfig) -> Self {
        self.config = config;
        self
    }

    /// Set API credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = Some(credentials);
        self
    }

    /// Use the sandbox environment
    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.config.sandbox = sandbox;
        self
    }

    /// Set base URL for REST API
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    /// Set REST client timeout in seconds
    pub fn with_rest_timeout(mut self, timeout_seconds: u64) -> Self {
        self.rest_timeout = Some(timeout_seconds);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set realtime connection tuning
    pub fn with_ws_config(mut self, ws_config: WsConfig) -> Self {
        self.ws_config = ws_config;
        self
    }

    /// Transport-level REST client, signing when credentials are present
    pub fn build_rest_client(&self) -> Result<ReqwestRest, ExchangeError> {
        let mut rest_config = RestClientConfig::new(
            self.config.effective_base_url().to_string(),
            EXCHANGE_NAME.to_string(),
        );
        if let Some(timeout) = self.rest_timeout {
            rest_config = rest_config.with_timeout(timeout);
        }
        if let Some(user_agent) = &self.user_agent {
            rest_config = rest_config.with_user_agent(user_agent.clone());
        }

        let mut rest_builder = RestClientBuilder::new(rest_config);
        if let Some(credentials) = self.signing_credentials() {
            rest_builder = rest_builder.with_signer(Arc::new(HmacSigner::new(credentials)));
        }

        rest_builder.build()
    }

    /// Build the endpoint client
    pub fn build_rest(self) -> Result<KucoinRest<ReqwestRest>, ExchangeError> {
        Ok(KucoinRest::new(self.build_rest_client()?))
    }

    /// Token provider for public or private channels
    pub fn build_token_fetcher(
        &self,
        private: bool,
    ) -> Result<TokenFetcher<ReqwestRest>, ExchangeError> {
        if private && !self.config.has_credentials() {
            return Err(ConfigError::InvalidConfiguration(
                "Private channels require API credentials".to_string(),
            )
            .into());
        }

        let rest = Arc::new(self.build_rest_client()?);
        Ok(if private {
            TokenFetcher::private(rest)
        } else {
            TokenFetcher::public(rest)
        })
    }

    /// Fetch a token and open a realtime session over tungstenite
    #[instrument(skip(self), fields(exchange = EXCHANGE_NAME))]
    pub async fn connect_realtime(self, private: bool) -> Result<RealtimeClient, ExchangeError> {
        let provider = Arc::new(self.build_token_fetcher(private)?);
        let token = provider.fetch_token().await?;
        let connector = Arc::new(TungsteniteConnector::new(
            EXCHANGE_NAME.to_string(),
            self.ws_config.connect_timeout(),
        ));

        RealtimeClient::connect(token, provider, connector, self.ws_config).await
    }

    fn signing_credentials(&self) -> Option<Credentials> {
        self.config
            .credentials
            .as_ref()
            .filter(|credentials| credentials.is_complete())
            .cloned()
    }
}
