//! `currency_exchange` tool: convert an amount or list rates for a base currency.

use super::{ParamKind, ParamSpec, ToolArgs, ToolError, ToolHandler, ToolSchema};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const TOOL_NAME: &str = "currency_exchange";

/// Currencies listed when no target is given; the full table would flood the prompt.
const MAJOR_CURRENCIES: &[&str] = &[
    "AUD", "CAD", "CHF", "CNY", "EUR", "GBP", "HKD", "INR", "JPY", "SGD", "USD",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub base: String,
    pub target: String,
    pub amount: f64,
    pub rate: f64,
    pub converted: f64,
    pub as_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    pub base: String,
    pub rates: BTreeMap<String, f64>,
    pub as_of: Option<String>,
}

/// Remote exchange-rate lookup.
#[async_trait::async_trait]
pub trait RateBackend: Send + Sync {
    async fn convert(&self, base: &str, target: &str, amount: f64)
        -> Result<Conversion, ToolError>;

    async fn latest(&self, base: &str) -> Result<RateTable, ToolError>;
}

pub struct CurrencyExchangeTool {
    backend: Arc<dyn RateBackend>,
}

impl CurrencyExchangeTool {
    pub fn new(backend: Arc<dyn RateBackend>) -> Self {
        Self { backend }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema::new(
            "Get current currency exchange rates or convert between currencies",
            vec![
                ParamSpec::required(
                    "base",
                    ParamKind::String,
                    "Base currency code (e.g., USD, EUR)",
                ),
                ParamSpec::optional(
                    "target",
                    ParamKind::String,
                    "Target currency code (e.g., EUR, JPY); omit to list major rates",
                ),
                ParamSpec::optional("amount", ParamKind::Number, "Amount to convert (default: 1)"),
            ],
        )
    }
}

#[async_trait::async_trait]
impl ToolHandler for CurrencyExchangeTool {
    async fn call(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let base = currency_code(args.str("base").unwrap_or_default())?;
        let amount = args.number("amount").unwrap_or(1.0);
        if !(amount.is_finite() && amount > 0.0) {
            return Err(ToolError::invalid_argument(format!(
                "amount must be a positive number, got {}",
                amount
            )));
        }

        match args.str("target") {
            Some(target) => {
                let target = currency_code(target)?;
                let conversion = self.backend.convert(&base, &target, amount).await?;
                info!(base = %base, target = %target, rate = conversion.rate, "Converted currency");
                Ok(format!(
                    "{:.2} {} = {:.4} {} (rate {:.4}{})",
                    conversion.amount,
                    conversion.base,
                    conversion.converted,
                    conversion.target,
                    conversion.rate,
                    as_of_suffix(&conversion.as_of)
                ))
            }
            None => {
                let table = self.backend.latest(&base).await?;
                let listed: Vec<String> = table
                    .rates
                    .iter()
                    .filter(|(code, _)| {
                        code.as_str() != table.base && MAJOR_CURRENCIES.contains(&code.as_str())
                    })
                    .map(|(code, rate)| format!("{} {:.4}", code, rate * amount))
                    .collect();
                if listed.is_empty() {
                    return Err(ToolError::not_found(format!("no rates published for {}", base)));
                }
                Ok(format!(
                    "{:.2} {} buys: {}{}",
                    amount,
                    table.base,
                    listed.join(", "),
                    as_of_suffix(&table.as_of)
                ))
            }
        }
    }
}

fn currency_code(raw: &str) -> Result<String, ToolError> {
    let code = raw.trim().to_uppercase();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(ToolError::invalid_argument(format!(
            "'{}' is not a three-letter currency code",
            raw.trim()
        )))
    }
}

fn as_of_suffix(as_of: &Option<String>) -> String {
    as_of
        .as_deref()
        .map(|t| format!(", as of {}", t))
        .unwrap_or_default()
}

//
// ================= HTTP backend =================
//

/// exchangerate-api.com v6 client.
pub struct ExchangeRateApiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl ExchangeRateApiClient {
    pub fn new(client: Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key,
            base_url: "https://v6.exchangerate-api.com/v6".to_string(),
        }
    }

    async fn fetch(&self, path: &str) -> Result<ApiResponse, ToolError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ToolError::upstream("currency API key not configured (EXCHANGE_RATE_API_KEY)")
        })?;

        let url = format!("{}/{}{}", self.base_url, api_key, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| {
                ToolError::upstream(format!("network error connecting to currency service: {}", e))
            })?;

        // The API reports failures in the body, often with a 4xx status.
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| ToolError::upstream(format!("invalid currency response: {}", e)))?;

        if body.result.as_deref() == Some("success") {
            return Ok(body);
        }

        let error_type = body.error_type.unwrap_or_else(|| "unknown-error".to_string());
        Err(match error_type.as_str() {
            "unsupported-code" => ToolError::not_found(format!("unsupported currency code ({})", path)),
            "malformed-request" => ToolError::invalid_argument("malformed currency request"),
            other => ToolError::upstream(format!("currency API error: {}", other)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    result: Option<String>,
    #[serde(rename = "error-type")]
    error_type: Option<String>,
    base_code: Option<String>,
    target_code: Option<String>,
    conversion_rate: Option<f64>,
    conversion_result: Option<f64>,
    conversion_rates: Option<BTreeMap<String, f64>>,
    time_last_update_utc: Option<String>,
}

#[async_trait::async_trait]
impl RateBackend for ExchangeRateApiClient {
    async fn convert(
        &self,
        base: &str,
        target: &str,
        amount: f64,
    ) -> Result<Conversion, ToolError> {
        let body = self
            .fetch(&format!("/pair/{}/{}/{}", base, target, amount))
            .await?;

        let rate = body
            .conversion_rate
            .ok_or_else(|| ToolError::upstream("currency response missing conversion_rate"))?;

        Ok(Conversion {
            base: body.base_code.unwrap_or_else(|| base.to_string()),
            target: body.target_code.unwrap_or_else(|| target.to_string()),
            amount,
            rate,
            converted: body.conversion_result.unwrap_or(rate * amount),
            as_of: body.time_last_update_utc,
        })
    }

    async fn latest(&self, base: &str) -> Result<RateTable, ToolError> {
        let body = self.fetch(&format!("/latest/{}", base)).await?;

        Ok(RateTable {
            base: body.base_code.unwrap_or_else(|| base.to_string()),
            rates: body.conversion_rates.unwrap_or_default(),
            as_of: body.time_last_update_utc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolErrorKind;

    struct FixedRates;

    #[async_trait::async_trait]
    impl RateBackend for FixedRates {
        async fn convert(
            &self,
            base: &str,
            target: &str,
            amount: f64,
        ) -> Result<Conversion, ToolError> {
            if target == "XXX" {
                return Err(ToolError::not_found("unsupported currency code"));
            }
            Ok(Conversion {
                base: base.into(),
                target: target.into(),
                amount,
                rate: 0.5,
                converted: amount * 0.5,
                as_of: None,
            })
        }

        async fn latest(&self, base: &str) -> Result<RateTable, ToolError> {
            let mut rates = BTreeMap::new();
            rates.insert("USD".to_string(), 1.0);
            rates.insert("EUR".to_string(), 0.9);
            rates.insert("XAU".to_string(), 0.0004);
            Ok(RateTable {
                base: base.into(),
                rates,
                as_of: Some("today".into()),
            })
        }
    }

    fn tool() -> CurrencyExchangeTool {
        CurrencyExchangeTool::new(Arc::new(FixedRates))
    }

    #[tokio::test]
    async fn test_conversion() {
        let args = CurrencyExchangeTool::schema().bind("usd, gbp, 10").unwrap();
        let output = tool().call(&args).await.unwrap();
        assert_eq!(output, "10.00 USD = 5.0000 GBP (rate 0.5000)");
    }

    #[tokio::test]
    async fn test_rate_table_lists_major_currencies_only() {
        let args = CurrencyExchangeTool::schema().bind("USD").unwrap();
        let output = tool().call(&args).await.unwrap();
        assert_eq!(output, "1.00 USD buys: EUR 0.9000, as of today");
    }

    #[tokio::test]
    async fn test_bad_codes_and_amounts() {
        let schema = CurrencyExchangeTool::schema();

        let err = tool().call(&schema.bind("dollars, EUR").unwrap()).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidArgument);

        let err = tool().call(&schema.bind("USD, EUR, -4").unwrap()).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidArgument);

        let err = tool().call(&schema.bind("USD, XXX").unwrap()).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_upstream_unavailable() {
        let backend = ExchangeRateApiClient::new(Client::new(), None);
        let err = backend.convert("USD", "EUR", 1.0).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UpstreamUnavailable);
    }
}
