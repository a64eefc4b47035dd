//! Tool handler trait and registry
//!
//! Handlers are pure functions of their bound arguments plus read-only
//! configuration (API credentials, base URLs). The registry binds the raw
//! `Action Input` text against each tool's declared schema, enforces a
//! per-call timeout, and reports every failure as a typed [`ToolError`].

pub mod currency;
pub mod stocks;

use crate::config::Settings;
use crate::models::ToolInvocation;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use currency::{CurrencyExchangeTool, ExchangeRateApiClient, RateBackend};
pub use stocks::{QuoteBackend, StockPriceTool, StockQuote, YahooQuoteClient};

//
// ================= Errors =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidArgument,
    UpstreamUnavailable,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::InvalidArgument,
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::UpstreamUnavailable,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::NotFound,
            message: message.into(),
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolErrorKind::InvalidArgument => "invalid argument",
            ToolErrorKind::UpstreamUnavailable => "upstream unavailable",
            ToolErrorKind::NotFound => "not found",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Schema =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// Declared input of a tool: ordered parameters, bound positionally from
/// comma-separated text or by name from a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn new(description: &str, params: Vec<ParamSpec>) -> Self {
        Self {
            description: description.to_string(),
            params,
        }
    }

    /// Bind raw `Action Input` text to named, typed arguments.
    pub fn bind(&self, raw: &str) -> Result<ToolArgs, ToolError> {
        let text = strip_wrapping(raw);

        let mut values = Map::new();

        if text.starts_with('{') {
            let object: Map<String, Value> = serde_json::from_str(text).map_err(|e| {
                ToolError::invalid_argument(format!("argument object is not valid JSON: {}", e))
            })?;

            if let Some(unknown) = object
                .keys()
                .find(|key| !self.params.iter().any(|p| &p.name == *key))
            {
                return Err(ToolError::invalid_argument(format!(
                    "unexpected argument '{}'",
                    unknown
                )));
            }

            for param in &self.params {
                match object.get(&param.name) {
                    Some(Value::Null) | None => {}
                    Some(Value::String(s)) => {
                        values.insert(param.name.clone(), coerce(param, s.trim())?);
                    }
                    Some(Value::Number(n)) => {
                        let value = match param.kind {
                            ParamKind::Number => Value::Number(n.clone()),
                            ParamKind::String => Value::String(n.to_string()),
                        };
                        values.insert(param.name.clone(), value);
                    }
                    Some(other) => {
                        return Err(ToolError::invalid_argument(format!(
                            "argument '{}' must be a {}, got {}",
                            param.name,
                            param.kind_name(),
                            other
                        )));
                    }
                }
            }
        } else if !text.is_empty() {
            let parts: Vec<&str> = text.split(',').map(str::trim).collect();
            if parts.len() > self.params.len() {
                return Err(ToolError::invalid_argument(format!(
                    "expected at most {} argument(s) ({}), got {}",
                    self.params.len(),
                    self.usage(),
                    parts.len()
                )));
            }
            for (param, part) in self.params.iter().zip(parts) {
                if !part.is_empty() {
                    values.insert(param.name.clone(), coerce(param, part)?);
                }
            }
        }

        if let Some(missing) = self
            .params
            .iter()
            .find(|p| p.required && !values.contains_key(&p.name))
        {
            return Err(ToolError::invalid_argument(format!(
                "missing required argument '{}' (expected: {})",
                missing.name,
                self.usage()
            )));
        }

        Ok(ToolArgs(values))
    }

    /// Positional usage hint, e.g. `base, target, amount`.
    pub fn usage(&self) -> String {
        self.params
            .iter()
            .map(|p| {
                if p.required {
                    p.name.clone()
                } else {
                    format!("[{}]", p.name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl ParamSpec {
    fn kind_name(&self) -> &'static str {
        match self.kind {
            ParamKind::String => "string",
            ParamKind::Number => "number",
        }
    }
}

fn coerce(param: &ParamSpec, text: &str) -> Result<Value, ToolError> {
    match param.kind {
        ParamKind::String => Ok(Value::String(text.to_string())),
        ParamKind::Number => {
            let number: f64 = text.parse().map_err(|_| {
                ToolError::invalid_argument(format!(
                    "argument '{}' must be a number, got '{}'",
                    param.name, text
                ))
            })?;
            serde_json::Number::from_f64(number)
                .map(Value::Number)
                .ok_or_else(|| {
                    ToolError::invalid_argument(format!(
                        "argument '{}' must be a finite number",
                        param.name
                    ))
                })
        }
    }
}

/// Models like to quote or fence their inputs.
fn strip_wrapping(raw: &str) -> &str {
    let mut text = raw.trim();
    loop {
        let stripped = ['"', '\'', '`']
            .iter()
            .find_map(|q| text.strip_prefix(*q).and_then(|t| t.strip_suffix(*q)));
        match stripped {
            Some(inner) if !inner.is_empty() => text = inner.trim(),
            _ => return text,
        }
    }
}

/// Arguments bound against a [`ToolSchema`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs(Map<String, Value>);

impl ToolArgs {
    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

//
// ================= Handler + registry =================
//

/// A callable tool body.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: &ToolArgs) -> Result<String, ToolError>;
}

struct RegisteredTool {
    schema: ToolSchema,
    handler: Arc<dyn ToolHandler>,
}

/// Public description of a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub schema: ToolSchema,
}

/// Tool registry for looking up and invoking tools
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            call_timeout,
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        schema: ToolSchema,
        handler: Arc<dyn ToolHandler>,
    ) {
        self.tools
            .insert(name.into(), RegisteredTool { schema, handler });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tools, sorted by name so prompts render deterministically.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .iter()
            .map(|(name, tool)| ToolDescriptor {
                name: name.clone(),
                schema: tool.schema.clone(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn names(&self) -> Vec<String> {
        self.list().into_iter().map(|t| t.name).collect()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Invoke a tool with its raw argument text.
    pub async fn invoke(&self, name: &str, raw_argument_text: &str) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::not_found(format!("tool '{}' is not registered", name)))?;
        let args = tool.schema.bind(raw_argument_text)?;
        self.call_bound(name, tool, &args).await
    }

    /// Invoke a tool and record the call for the turn's tool trace.
    pub async fn invoke_traced(&self, name: &str, raw_argument_text: &str) -> ToolInvocation {
        let start = Instant::now();

        let (parsed_arguments, result) = match self.tools.get(name) {
            None => (
                None,
                Err(ToolError::not_found(format!(
                    "tool '{}' is not registered",
                    name
                ))),
            ),
            Some(tool) => match tool.schema.bind(raw_argument_text) {
                Err(e) => (None, Err(e)),
                Ok(args) => {
                    let result = self.call_bound(name, tool, &args).await;
                    (Some(args.to_value()), result)
                }
            },
        };

        ToolInvocation {
            tool_name: name.to_string(),
            raw_input: raw_argument_text.to_string(),
            parsed_arguments,
            result: result.into(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn call_bound(
        &self,
        name: &str,
        tool: &RegisteredTool,
        args: &ToolArgs,
    ) -> Result<String, ToolError> {
        debug!(tool = %name, args = %args.to_value(), "Invoking tool");

        match tokio::time::timeout(self.call_timeout, tool.handler.call(args)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                Err(e)
            }
            Err(_) => {
                warn!(
                    tool = %name,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Tool call timed out"
                );
                Err(ToolError::upstream(format!(
                    "{} did not respond within {}s",
                    name,
                    self.call_timeout.as_secs_f32()
                )))
            }
        }
    }
}

/// Shared HTTP client for tool backends.
pub(crate) fn backend_http_client(timeout: Duration) -> Client {
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!("Falling back to default HTTP client: {}", e);
            Client::new()
        })
}

/// Create the default registry with the HTTP-backed financial tools.
pub fn create_default_registry(settings: &Settings) -> ToolRegistry {
    let mut registry = ToolRegistry::new(settings.tool_timeout);
    let client = backend_http_client(settings.tool_timeout);

    if settings.exchange_rate_api_key.is_none() {
        warn!("EXCHANGE_RATE_API_KEY not set; currency_exchange will report the upstream as unavailable");
    }

    let stocks = StockPriceTool::new(Arc::new(YahooQuoteClient::new(
        client.clone(),
        settings.stock_quote_base_url.clone(),
    )));
    registry.register(stocks::TOOL_NAME, StockPriceTool::schema(), Arc::new(stocks));

    let currency = CurrencyExchangeTool::new(Arc::new(ExchangeRateApiClient::new(
        client,
        settings.exchange_rate_api_key.clone(),
    )));
    registry.register(
        currency::TOOL_NAME,
        CurrencyExchangeTool::schema(),
        Arc::new(currency),
    );

    registry
}
