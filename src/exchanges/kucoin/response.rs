use crate::core::errors::ExchangeError;
use crate::core::kernel::RestResponse;
use crate::exchanges::kucoin::types::{PaginatedData, RawData};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;
use tracing::debug;

/// Envelope code for a successful call
pub const SUCCESS_CODE: &str = "200000";

/// `{code, msg, data}` wrapper present on every REST response
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub code: String,
    #[serde(default, alias = "message")]
    pub msg: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

impl ApiResponse {
    /// Parse the outer envelope. HTTP status alone does not classify the
    /// result: the exchange answers business errors with envelopes on 4xx too.
    pub fn from_response(response: &RestResponse) -> Result<Self, ExchangeError> {
        match serde_json::from_str::<Self>(&response.body) {
            Ok(envelope) => Ok(envelope),
            Err(e) if response.is_success() => Err(ExchangeError::DeserializationError(format!(
                "Failed to parse response envelope: {}",
                e
            ))),
            Err(_) => Err(map_http_status(response.status, &response.body)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Success payload, still raw. A non-success code never yields data.
    pub fn into_data(self) -> Result<RawData, ExchangeError> {
        if !self.is_success() {
            debug!(code = %self.code, msg = %self.msg, "API returned error envelope");
            return Err(map_kucoin_error(&self.code, &self.msg));
        }

        Ok(self.data.map_or_else(RawData::null, RawData::new))
    }
}

/// Decode a response down to its raw success payload
pub fn decode(response: &RestResponse) -> Result<RawData, ExchangeError> {
    ApiResponse::from_response(response)?.into_data()
}

/// Decode a response and its payload as `T`
pub fn decode_as<T: DeserializeOwned>(response: &RestResponse) -> Result<T, ExchangeError> {
    decode(response)?.decode()
}

/// Decode a paged list response; items stay raw until requested
pub fn decode_paginated(response: &RestResponse) -> Result<PaginatedData, ExchangeError> {
    decode(response)?.decode()
}

/// Maps KuCoin error codes to `ExchangeError` variants
pub fn map_kucoin_error(code: &str, message: &str) -> ExchangeError {
    match code {
        // Missing headers, bad timestamp, unknown key, bad passphrase, bad
        // signature, IP not whitelisted, access denied
        "400001" | "400002" | "400003" | "400004" | "400005" | "400006" | "400007" => {
            ExchangeError::AuthRejected {
                code: code.to_string(),
                message: message.to_string(),
            }
        }
        "429000" => ExchangeError::RateLimitExceeded(format!("{} - {}", code, message)),
        _ => ExchangeError::ApiError {
            code: code.to_string(),
            message: message.to_string(),
        },
    }
}

fn map_http_status(status: u16, body: &str) -> ExchangeError {
    match status {
        401 => ExchangeError::AuthRejected {
            code: status.to_string(),
            message: body.to_string(),
        },
        429 => ExchangeError::RateLimitExceeded(format!("HTTP 429: {}", body)),
        _ => ExchangeError::HttpStatus {
            status,
            body: body.to_string(),
        },
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Code {
        Text(String),
        Number(i64),
    }

    Ok(match Code::deserialize(deserializer)? {
        Code::Text(text) => text,
        Code::Number(number) => number.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn response(status: u16, body: &str) -> RestResponse {
        RestResponse {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_success_exposes_data_unmodified() {
        let body = r#"{"code":"200000","data":{"orderId":"5bd6e9286d99522a52e458de","extra":[1,2]}}"#;
        let data = decode(&response(200, body)).unwrap();
        assert_eq!(
            data.get(),
            r#"{"orderId":"5bd6e9286d99522a52e458de","extra":[1,2]}"#
        );

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Created {
            order_id: String,
        }
        let created: Created = data.decode().unwrap();
        assert_eq!(created.order_id, "5bd6e9286d99522a52e458de");
    }

    #[test]
    fn test_business_error_does_not_touch_data() {
        // data is garbage for any success type; decoding must not look at it
        let body = r#"{"code":"300000","msg":"Order creation for this pair suspended","data":[{"weird":true}]}"#;
        let err = decode(&response(200, body)).unwrap_err();
        match err {
            ExchangeError::ApiError { code, message } => {
                assert_eq!(code, "300000");
                assert_eq!(message, "Order creation for this pair suspended");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_auth_codes_classified() {
        let body = r#"{"code":"400005","msg":"Invalid KC-API-SIGN"}"#;
        let err = decode(&response(401, body)).unwrap_err();
        assert!(err.is_auth());
        assert!(matches!(err, ExchangeError::AuthRejected { ref code, .. } if code == "400005"));

        let body = r#"{"code":"400002","msg":"KC-API-TIMESTAMP Invalid"}"#;
        assert!(decode(&response(400, body)).unwrap_err().is_auth());
    }

    #[test]
    fn test_rate_limit_code() {
        let body = r#"{"code":"429000","msg":"Too Many Requests"}"#;
        assert!(matches!(
            decode(&response(429, body)).unwrap_err(),
            ExchangeError::RateLimitExceeded(_)
        ));
    }

    #[test]
    fn test_numeric_code_and_message_alias() {
        let body = r#"{"code":400100,"message":"Parameter error"}"#;
        match decode(&response(400, body)).unwrap_err() {
            ExchangeError::ApiError { code, message } => {
                assert_eq!(code, "400100");
                assert_eq!(message, "Parameter error");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_non_envelope_bodies() {
        let err = decode(&response(502, "<html>Bad Gateway</html>")).unwrap_err();
        assert!(matches!(err, ExchangeError::HttpStatus { status: 502, .. }));

        let err = decode(&response(401, "Unauthorized")).unwrap_err();
        assert!(err.is_auth());

        let err = decode(&response(200, "not json")).unwrap_err();
        assert!(matches!(err, ExchangeError::DeserializationError(_)));
    }

    #[test]
    fn test_success_without_data() {
        let data = decode(&response(200, r#"{"code":"200000"}"#)).unwrap();
        assert!(data.is_null());
        let unit: Option<String> = data.decode().unwrap();
        assert!(unit.is_none());
    }

    #[test]
    fn test_decode_paginated() {
        let body = r#"{"code":"200000","data":{"currentPage":1,"pageSize":10,"totalNum":25,"totalPage":3,"items":[{"id":"x"}]}}"#;
        let page = decode_paginated(&response(200, body)).unwrap();
        assert_eq!(page.total_num, 25);
        assert_eq!(page.total_page, 3);
        assert_eq!(page.raw_items(), r#"[{"id":"x"}]"#);
    }

    #[test]
    fn test_decode_as_server_time() {
        let body = r#"{"code":"200000","msg":"success","data":1546837113087}"#;
        let time: i64 = decode_as(&response(200, body)).unwrap();
        assert_eq!(time, 1_546_837_113_087);
    }
}
