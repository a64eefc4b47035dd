//! `stock_price` tool: current quote for a ticker symbol.

use super::{ParamKind, ParamSpec, ToolArgs, ToolError, ToolHandler, ToolSchema};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

pub const TOOL_NAME: &str = "stock_price";

const MAX_TICKER_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct StockQuote {
    pub ticker: String,
    pub name: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub day_low: Option<f64>,
    pub day_high: Option<f64>,
    pub volume: Option<u64>,
    pub market_cap: Option<f64>,
}

/// Remote quote lookup.
#[async_trait::async_trait]
pub trait QuoteBackend: Send + Sync {
    async fn quote(&self, ticker: &str) -> Result<StockQuote, ToolError>;
}

pub struct StockPriceTool {
    backend: Arc<dyn QuoteBackend>,
}

impl StockPriceTool {
    pub fn new(backend: Arc<dyn QuoteBackend>) -> Self {
        Self { backend }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema::new(
            "Get current stock price and basic information for a ticker symbol",
            vec![ParamSpec::required(
                "ticker",
                ParamKind::String,
                "Stock ticker symbol (e.g., AAPL, MSFT, TSLA)",
            )],
        )
    }
}

#[async_trait::async_trait]
impl ToolHandler for StockPriceTool {
    async fn call(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let raw = args
            .str("ticker")
            .ok_or_else(|| ToolError::invalid_argument("expected a ticker symbol"))?;
        let ticker = normalize_ticker(raw)?;

        let quote = self.backend.quote(&ticker).await?;
        if quote.price.is_none() {
            return Err(ToolError::not_found(format!(
                "no current price available for {}",
                ticker
            )));
        }

        info!(ticker = %ticker, price = ?quote.price, "Retrieved stock quote");
        Ok(format_quote(&quote))
    }
}

fn normalize_ticker(raw: &str) -> Result<String, ToolError> {
    let ticker = raw.trim().to_uppercase();
    let valid_chars = ticker
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));

    if ticker.is_empty() || ticker.len() > MAX_TICKER_LEN || !valid_chars {
        return Err(ToolError::invalid_argument(format!(
            "'{}' is not a valid ticker symbol",
            raw.trim()
        )));
    }
    Ok(ticker)
}

fn format_quote(quote: &StockQuote) -> String {
    let currency = quote.currency.as_deref().unwrap_or("USD");
    let mut out = format!(
        "{} ({}): {} {}",
        quote.name.as_deref().unwrap_or(&quote.ticker),
        quote.ticker,
        quote
            .price
            .map(|p| format!("{:.2}", p))
            .unwrap_or_else(|| "N/A".into()),
        currency
    );

    if let (Some(low), Some(high)) = (quote.day_low, quote.day_high) {
        out.push_str(&format!(" | day range {:.2} - {:.2}", low, high));
    }
    if let Some(volume) = quote.volume {
        out.push_str(&format!(" | volume {}", volume));
    }
    if let Some(cap) = quote.market_cap {
        out.push_str(&format!(" | market cap {}", format_market_cap(cap)));
    }
    out
}

/// Human-readable market capitalisation.
pub fn format_market_cap(market_cap: f64) -> String {
    if market_cap >= 1_000_000_000_000.0 {
        format!("${:.2}T", market_cap / 1_000_000_000_000.0)
    } else if market_cap >= 1_000_000_000.0 {
        format!("${:.2}B", market_cap / 1_000_000_000.0)
    } else if market_cap >= 1_000_000.0 {
        format!("${:.2}M", market_cap / 1_000_000.0)
    } else {
        format!("${:.2}", market_cap)
    }
}

//
// ================= HTTP backend =================
//

/// Quote lookup against the Yahoo Finance chart endpoint.
pub struct YahooQuoteClient {
    client: Client,
    base_url: String,
}

impl YahooQuoteClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    symbol: Option<String>,
    currency: Option<String>,
    long_name: Option<String>,
    short_name: Option<String>,
    regular_market_price: Option<f64>,
    regular_market_day_low: Option<f64>,
    regular_market_day_high: Option<f64>,
    regular_market_volume: Option<u64>,
    market_cap: Option<f64>,
}

#[async_trait::async_trait]
impl QuoteBackend for YahooQuoteClient {
    async fn quote(&self, ticker: &str) -> Result<StockQuote, ToolError> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, ticker);

        let response = self
            .client
            .get(&url)
            .query(&[("interval", "1d"), ("range", "1d")])
            .header("User-Agent", "Mozilla/5.0 (fenny-assistant)")
            .send()
            .await
            .map_err(|e| ToolError::upstream(format!("quote service request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ToolError::not_found(format!(
                "could not retrieve data for {}; check the ticker symbol",
                ticker
            )));
        }
        if !status.is_success() {
            return Err(ToolError::upstream(format!(
                "quote service returned {}",
                status
            )));
        }

        let body: ChartResponse = response
            .json()
            .await
            .map_err(|e| ToolError::upstream(format!("invalid quote response: {}", e)))?;

        let meta = match body.chart.result.and_then(|r| r.into_iter().next()) {
            Some(result) => result.meta,
            None => {
                let detail = body
                    .chart
                    .error
                    .and_then(|e| e.description)
                    .unwrap_or_else(|| "no data".to_string());
                return Err(ToolError::not_found(format!("{}: {}", ticker, detail)));
            }
        };

        Ok(StockQuote {
            ticker: meta.symbol.unwrap_or_else(|| ticker.to_string()),
            name: meta.short_name.or(meta.long_name),
            price: meta.regular_market_price,
            currency: meta.currency,
            day_low: meta.regular_market_day_low,
            day_high: meta.regular_market_day_high,
            volume: meta.regular_market_volume,
            market_cap: meta.market_cap,
        })
    }
}
