use crate::core::errors::ExchangeError;
use crate::core::kernel::RestClient;
use crate::exchanges::kucoin::response;
use crate::exchanges::kucoin::token::{fetch_private_token, fetch_public_token};
use crate::exchanges::kucoin::types::{
    Account, AccountType, CancelOrderResult, ConnectionToken, CreateOrderResult, OrderStatus,
    OrderType, PaginatedData, ServerTime, Side,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::instrument;

const MAX_CLIENT_OID_LEN: usize = 40;
const MIN_PAGE_SIZE: u32 = 10;
const MAX_PAGE_SIZE: u32 = 500;

/// Body of `POST /api/v1/orders`. Serialized in declared field order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderParams {
    client_oid: String,
    side: Side,
    symbol: String,
    #[serde(rename = "type")]
    order_type: OrderType,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::str_option"
    )]
    price: Option<Decimal>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::str_option"
    )]
    size: Option<Decimal>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::str_option"
    )]
    funds: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remark: Option<String>,
}

impl CreateOrderParams {
    /// Limit order for `size` at `price`
    pub fn limit(
        client_oid: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Result<Self, ExchangeError> {
        let params = Self {
            client_oid: client_oid.into(),
            side,
            symbol: symbol.into(),
            order_type: OrderType::Limit,
            price: Some(positive("price", price)?),
            size: Some(positive("size", size)?),
            funds: None,
            remark: None,
        };
        params.validate()?;
        Ok(params)
    }

    /// Market order for `size` units of the base currency
    pub fn market(
        client_oid: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        size: Decimal,
    ) -> Result<Self, ExchangeError> {
        let params = Self {
            client_oid: client_oid.into(),
            side,
            symbol: symbol.into(),
            order_type: OrderType::Market,
            price: None,
            size: Some(positive("size", size)?),
            funds: None,
            remark: None,
        };
        params.validate()?;
        Ok(params)
    }

    /// Market order spending `funds` of the quote currency
    pub fn market_funds(
        client_oid: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        funds: Decimal,
    ) -> Result<Self, ExchangeError> {
        let params = Self {
            client_oid: client_oid.into(),
            side,
            symbol: symbol.into(),
            order_type: OrderType::Market,
            price: None,
            size: None,
            funds: Some(positive("funds", funds)?),
            remark: None,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    pub fn client_oid(&self) -> &str {
        &self.client_oid
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn validate(&self) -> Result<(), ExchangeError> {
        if self.client_oid.is_empty() || self.client_oid.len() > MAX_CLIENT_OID_LEN {
            return Err(ExchangeError::InvalidParameters(format!(
                "clientOid must be 1-{} characters",
                MAX_CLIENT_OID_LEN
            )));
        }
        non_empty("symbol", &self.symbol)
    }
}

/// Query for `GET /api/v1/orders`
#[derive(Debug, Clone, Default)]
pub struct ListOrdersParams {
    status: Option<OrderStatus>,
    symbol: Option<String>,
    side: Option<Side>,
    current_page: Option<u32>,
    page_size: Option<u32>,
}

impl ListOrdersParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Result<Self, ExchangeError> {
        let symbol = symbol.into();
        non_empty("symbol", &symbol)?;
        self.symbol = Some(symbol);
        Ok(self)
    }

    pub fn side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    /// 1-based page with 10-500 items per page
    pub fn page(mut self, current_page: u32, page_size: u32) -> Result<Self, ExchangeError> {
        if current_page == 0 {
            return Err(ExchangeError::InvalidParameters(
                "currentPage starts at 1".to_string(),
            ));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ExchangeError::InvalidParameters(format!(
                "pageSize must be {}-{}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        self.current_page = Some(current_page);
        self.page_size = Some(page_size);
        Ok(self)
    }

    /// Query pairs in wire order
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(status) = self.status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(symbol) = &self.symbol {
            query.push(("symbol", symbol.clone()));
        }
        if let Some(side) = self.side {
            query.push(("side", side.as_str().to_string()));
        }
        if let Some(current_page) = self.current_page {
            query.push(("currentPage", current_page.to_string()));
        }
        if let Some(page_size) = self.page_size {
            query.push(("pageSize", page_size.to_string()));
        }
        query
    }
}

/// Query for `GET /api/v1/accounts`
#[derive(Debug, Clone, Default)]
pub struct AccountsParams {
    currency: Option<String>,
    account_type: Option<AccountType>,
}

impl AccountsParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Result<Self, ExchangeError> {
        let currency = currency.into();
        non_empty("currency", &currency)?;
        self.currency = Some(currency);
        Ok(self)
    }

    pub fn account_type(mut self, account_type: AccountType) -> Self {
        self.account_type = Some(account_type);
        self
    }

    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(currency) = &self.currency {
            query.push(("currency", currency.clone()));
        }
        if let Some(account_type) = self.account_type {
            query.push(("type", account_type.as_str().to_string()));
        }
        query
    }
}

fn non_empty(name: &str, value: &str) -> Result<(), ExchangeError> {
    if value.trim().is_empty() {
        return Err(ExchangeError::InvalidParameters(format!(
            "{} must not be empty",
            name
        )));
    }
    Ok(())
}

fn positive(name: &str, value: Decimal) -> Result<Decimal, ExchangeError> {
    if value <= Decimal::ZERO {
        return Err(ExchangeError::InvalidParameters(format!(
            "{} must be positive, got {}",
            name, value
        )));
    }
    Ok(value)
}

fn borrowed<'a>(query: &'a [(&'static str, String)]) -> Vec<(&'static str, &'a str)> {
    query.iter().map(|(k, v)| (*k, v.as_str())).collect()
}

/// KuCoin REST API client
#[derive(Debug)]
pub struct KucoinRest<R: RestClient> {
    rest_client: R,
}

impl<R: RestClient> KucoinRest<R> {
    pub fn new(rest_client: R) -> Self {
        Self { rest_client }
    }

    pub fn rest_client(&self) -> &R {
        &self.rest_client
    }

    /// Server time in milliseconds
    #[instrument(skip(self), fields(exchange = "kucoin"))]
    pub async fn server_time(&self) -> Result<ServerTime, ExchangeError> {
        let response = self
            .rest_client
            .get("/api/v1/timestamp", &[], false)
            .await?;
        response::decode_as(&response)
    }

    #[instrument(skip(self), fields(exchange = "kucoin"))]
    pub async fn accounts(&self, params: &AccountsParams) -> Result<Vec<Account>, ExchangeError> {
        let query = params.to_query();
        let response = self
            .rest_client
            .get("/api/v1/accounts", &borrowed(&query), true)
            .await?;
        response::decode_as(&response)
    }

    #[instrument(skip(self, params), fields(exchange = "kucoin", symbol = %params.symbol(), client_oid = %params.client_oid()))]
    pub async fn create_order(
        &self,
        params: &CreateOrderParams,
    ) -> Result<CreateOrderResult, ExchangeError> {
        let response = self
            .rest_client
            .post("/api/v1/orders", Some(params), true)
            .await?;
        response::decode_as(&response)
    }

    #[instrument(skip(self), fields(exchange = "kucoin"))]
    pub async fn cancel_order(&self, order_id: &str) -> Result<CancelOrderResult, ExchangeError> {
        non_empty("orderId", order_id)?;
        let endpoint = format!("/api/v1/orders/{}", urlencoding::encode(order_id));
        let response = self.rest_client.delete(&endpoint, &[], true).await?;
        response::decode_as(&response)
    }

    /// One page of orders; decode items with `PaginatedData::items`
    #[instrument(skip(self), fields(exchange = "kucoin"))]
    pub async fn orders(&self, params: &ListOrdersParams) -> Result<PaginatedData, ExchangeError> {
        let query = params.to_query();
        let response = self
            .rest_client
            .get("/api/v1/orders", &borrowed(&query), true)
            .await?;
        response::decode_paginated(&response)
    }

    /// Token for public realtime channels
    pub async fn public_token(&self) -> Result<ConnectionToken, ExchangeError> {
        fetch_public_token(&self.rest_client).await
    }

    /// Token for private realtime channels
    pub async fn private_token(&self) -> Result<ConnectionToken, ExchangeError> {
        fetch_private_token(&self.rest_client).await
    }
}
