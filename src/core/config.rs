use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_BASE_URL: &str = "https://api.kucoin.com";
pub const SANDBOX_BASE_URL: &str = "https://openapi-sandbox.kucoin.com";

/// API key version, selects how the passphrase header is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyVersion {
    /// Passphrase sent verbatim
    V1,
    /// Passphrase sent as HMAC of itself under the secret
    #[default]
    V2,
    V3,
}

impl KeyVersion {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
            Self::V3 => "3",
        }
    }

    /// V2 and V3 keys never put the plaintext passphrase on the wire
    pub const fn signs_passphrase(self) -> bool {
        matches!(self, Self::V2 | Self::V3)
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" | "v1" | "V1" => Ok(Self::V1),
            "2" | "v2" | "V2" => Ok(Self::V2),
            "3" | "v3" | "V3" => Ok(Self::V3),
            other => Err(ConfigError::InvalidConfiguration(format!(
                "Unknown API key version: {}",
                other
            ))),
        }
    }
}

/// API credentials. Immutable once built; the secret material never leaves
/// the `Secret` wrappers except through the explicit accessors.
#[derive(Clone)]
pub struct Credentials {
    api_key: Secret<String>,
    api_secret: Secret<String>,
    passphrase: Secret<String>,
    key_version: KeyVersion,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        passphrase: impl Into<String>,
        key_version: KeyVersion,
    ) -> Self {
        Self {
            api_key: Secret::new(api_key.into()),
            api_secret: Secret::new(api_secret.into()),
            passphrase: Secret::new(passphrase.into()),
            key_version,
        }
    }

    /// Get API key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Get API secret (use carefully - exposes secret)
    pub fn api_secret(&self) -> &str {
        self.api_secret.expose_secret()
    }

    /// Get passphrase (use carefully - exposes secret)
    pub fn passphrase(&self) -> &str {
        self.passphrase.expose_secret()
    }

    pub const fn key_version(&self) -> KeyVersion {
        self.key_version
    }

    pub fn is_complete(&self) -> bool {
        !self.api_key().is_empty() && !self.api_secret().is_empty() && !self.passphrase().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("passphrase", &"[REDACTED]")
            .field("key_version", &self.key_version)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct KucoinConfig {
    pub credentials: Option<Credentials>,
    pub sandbox: bool,
    pub base_url: Option<String>,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for KucoinConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("KucoinConfig", 6)?;
        let redacted = self.credentials.as_ref().map(|_| "[REDACTED]");
        state.serialize_field("api_key", &redacted)?;
        state.serialize_field("api_secret", &redacted)?;
        state.serialize_field("api_passphrase", &redacted)?;
        state.serialize_field(
            "api_key_version",
            &self.credentials.as_ref().map(|c| c.key_version().as_str()),
        )?;
        state.serialize_field("sandbox", &self.sandbox)?;
        state.serialize_field("base_url", &self.base_url)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for KucoinConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct KucoinConfigHelper {
            api_key: Option<String>,
            api_secret: Option<String>,
            api_passphrase: Option<String>,
            api_key_version: Option<String>,
            #[serde(default)]
            sandbox: bool,
            base_url: Option<String>,
        }

        let helper = KucoinConfigHelper::deserialize(deserializer)?;
        let key_version = helper
            .api_key_version
            .as_deref()
            .map(KeyVersion::from_str)
            .transpose()
            .map_err(serde::de::Error::custom)?
            .unwrap_or_default();

        let credentials = match (helper.api_key, helper.api_secret, helper.api_passphrase) {
            (Some(key), Some(secret), Some(passphrase)) => {
                Some(Credentials::new(key, secret, passphrase, key_version))
            }
            (None, None, None) => None,
            _ => {
                return Err(serde::de::Error::custom(
                    "api_key, api_secret and api_passphrase must be given together",
                ))
            }
        };

        Ok(Self {
            credentials,
            sandbox: helper.sandbox,
            base_url: helper.base_url,
        })
    }
}

impl KucoinConfig {
    /// Create a new configuration with API credentials
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
            sandbox: false,
            base_url: None,
        }
    }

    /// Create configuration for public endpoints only
    #[must_use]
    pub fn read_only() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_API_KEY`
    /// - `{PREFIX}_API_SECRET`
    /// - `{PREFIX}_API_PASSPHRASE`
    /// - `{PREFIX}_API_KEY_VERSION` (optional, defaults to 2)
    /// - `{PREFIX}_SANDBOX` (optional, defaults to false)
    /// - `{PREFIX}_BASE_URL` (optional)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let var = |name: &str| format!("{}_{}", prefix, name);

        let required = |name: String| {
            env::var(&name).map_err(|_| ConfigError::MissingEnvironmentVariable(name))
        };

        let api_key = required(var("API_KEY"))?;
        let api_secret = required(var("API_SECRET"))?;
        let passphrase = required(var("API_PASSPHRASE"))?;

        let key_version = match env::var(var("API_KEY_VERSION")) {
            Ok(raw) => raw.parse()?,
            Err(_) => KeyVersion::default(),
        };

        let sandbox = env::var(var("SANDBOX"))
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let base_url = env::var(var("BASE_URL")).ok();

        Ok(Self {
            credentials: Some(Credentials::new(
                api_key,
                api_secret,
                passphrase,
                key_version,
            )),
            sandbox,
            base_url,
        })
    }

    /// Create configuration from a .env file and environment variables
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    /// Create configuration from a specific .env file path
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(()) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // fall through to process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.as_ref().is_some_and(Credentials::is_complete)
    }

    /// Set sandbox mode
    #[must_use]
    pub const fn sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Set custom base URL
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Base URL in effect: explicit override, else sandbox or production
    pub fn effective_base_url(&self) -> &str {
        match &self.base_url {
            Some(url) => url,
            None if self.sandbox => SANDBOX_BASE_URL,
            None => DEFAULT_BASE_URL,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
