pub mod codec;
pub mod response;
pub mod token;
pub mod types;

pub mod builder;
pub mod realtime;
pub mod rest;

// Re-export main components
pub use builder::KucoinBuilder;
pub use codec::{KucoinCodec, KucoinRequest, TopicMessage, WsFrame};
pub use realtime::{RealtimeClient, SessionState, Subscription, TopicResult, TopicStream};
pub use response::{decode, decode_as, decode_paginated, map_kucoin_error, ApiResponse};
pub use rest::{AccountsParams, CreateOrderParams, KucoinRest, ListOrdersParams};
pub use token::{fetch_private_token, fetch_public_token, TokenFetcher, TokenProvider};
pub use types::{
    Account, AccountType, CancelOrderResult, ConnectionToken, CreateOrderResult, InstanceServer,
    Order, OrderStatus, OrderType, PaginatedData, RawData, ServerTime, Side,
};
