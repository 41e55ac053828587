//! KuCoin API client: request signing, response envelopes, and a realtime
//! subscription session with heartbeats and reconnect.
//!
//! ```rust,no_run
//! use kucoin_link::{KucoinBuilder, KucoinConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let rest = KucoinBuilder::new()
//!     .with_config(KucoinConfig::from_env("KUCOIN")?)
//!     .build_rest()?;
//! println!("server time: {}", rest.server_time().await?);
//!
//! let realtime = KucoinBuilder::new().connect_realtime(false).await?;
//! let mut tickers = realtime
//!     .subscribe("/market/ticker:BTC-USDT", false, true)
//!     .await?;
//! while let Some(message) = tickers.recv().await {
//!     println!("{}", message?.raw_data());
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod exchanges;

pub use crate::core::config::{Credentials, KeyVersion, KucoinConfig};
pub use crate::core::errors::ExchangeError;
pub use crate::exchanges::kucoin::{KucoinBuilder, KucoinRest, RealtimeClient, SessionState, TopicStream};
