//! Runtime settings
//!
//! Every value can be overridden through the environment (a `.env` file is
//! loaded by the binaries before this runs).

use crate::error::AgentError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Upper bound on chunks injected into a prompt.
pub const MAX_RETRIEVAL_K: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceBackend {
    Gemini,
    Llama,
}

impl FromStr for InferenceBackend {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "llama" | "llama.cpp" | "llamacpp" => Ok(Self::Llama),
            other => Err(AgentError::Config(format!(
                "FENNY_INFERENCE_BACKEND must be 'gemini' or 'llama', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub app_name: String,
    pub debug: bool,
    pub api_port: u16,
    pub api_prefix: String,

    // Uploads
    pub max_files_per_session: usize,
    pub max_file_size: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Sessions
    pub session_expiry: Duration,
    pub session_sweep_interval: Duration,

    // Graph runtime
    pub max_iterations: u32,
    pub max_parse_retries: u32,
    pub inference_timeout: Duration,
    pub tool_timeout: Duration,
    pub retrieval_top_k: usize,
    pub history_turns: usize,

    // Collaborators
    pub inference_backend: InferenceBackend,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub llama_server_url: String,
    pub exchange_rate_api_key: Option<String>,
    pub stock_quote_base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "Fenny Financial Assistant".to_string(),
            debug: false,
            api_port: 8080,
            api_prefix: "/api".to_string(),
            max_files_per_session: 3,
            max_file_size: 5 * 1024 * 1024,
            chunk_size: 800,
            chunk_overlap: 100,
            session_expiry: Duration::from_secs(24 * 60 * 60),
            session_sweep_interval: Duration::from_secs(300),
            max_iterations: 6,
            max_parse_retries: 2,
            inference_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(15),
            retrieval_top_k: 3,
            history_turns: 6,
            inference_backend: InferenceBackend::Gemini,
            gemini_api_key: String::new(),
            gemini_model: "gemini-2.0-flash".to_string(),
            llama_server_url: "http://127.0.0.1:8081".to_string(),
            exchange_rate_api_key: None,
            stock_quote_base_url: "https://query1.finance.yahoo.com".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let settings = Self::from_lookup(|key| env::var(key).ok())?;
        info!(
            app = %settings.app_name,
            max_files = settings.max_files_per_session,
            max_file_size_mb = settings.max_file_size / 1024 / 1024,
            backend = ?settings.inference_backend,
            "Settings loaded"
        );
        Ok(settings)
    }

    /// Load settings from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => parse_value("PORT", &raw)?,
            None => defaults.api_port,
        };

        let retrieval_top_k: usize =
            parse_or("FENNY_RETRIEVAL_TOP_K", &get, defaults.retrieval_top_k)?;

        let chunk_size: usize = parse_or("FENNY_CHUNK_SIZE", &get, defaults.chunk_size)?;
        let chunk_overlap: usize = parse_or("FENNY_CHUNK_OVERLAP", &get, defaults.chunk_overlap)?;
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(AgentError::Config(format!(
                "FENNY_CHUNK_OVERLAP ({}) must be smaller than a non-zero FENNY_CHUNK_SIZE ({})",
                chunk_overlap, chunk_size
            )));
        }

        let max_iterations: u32 = parse_or("FENNY_MAX_ITERATIONS", &get, defaults.max_iterations)?;
        if max_iterations == 0 {
            return Err(AgentError::Config(
                "FENNY_MAX_ITERATIONS must be at least 1".to_string(),
            ));
        }

        let expiry_hours: u64 = parse_or("FENNY_SESSION_EXPIRY_HOURS", &get, 24)?;
        let session_expiry = expiry_hours
            .checked_mul(60 * 60)
            .filter(|_| expiry_hours > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                AgentError::Config(format!(
                    "FENNY_SESSION_EXPIRY_HOURS must be between 1 and {}, got {}",
                    u64::MAX / 3600,
                    expiry_hours
                ))
            })?;

        let sweep_secs: u64 = parse_or(
            "FENNY_SESSION_SWEEP_SECS",
            &get,
            defaults.session_sweep_interval.as_secs(),
        )?;
        if sweep_secs == 0 {
            return Err(AgentError::Config(
                "FENNY_SESSION_SWEEP_SECS must be at least 1".to_string(),
            ));
        }

        let inference_backend = match get("FENNY_INFERENCE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => defaults.inference_backend,
        };

        Ok(Self {
            app_name: get("FENNY_APP_NAME").unwrap_or(defaults.app_name),
            debug: parse_or("FENNY_DEBUG", &get, defaults.debug)?,
            api_port,
            api_prefix: get("FENNY_API_PREFIX")
                .map(|p| format!("/{}", p.trim_matches('/')))
                .unwrap_or(defaults.api_prefix),
            max_files_per_session: parse_or(
                "FENNY_MAX_FILES_PER_SESSION",
                &get,
                defaults.max_files_per_session,
            )?,
            max_file_size: parse_or("FENNY_MAX_FILE_SIZE", &get, defaults.max_file_size)?,
            chunk_size,
            chunk_overlap,
            session_expiry,
            session_sweep_interval: Duration::from_secs(sweep_secs),
            max_iterations,
            max_parse_retries: parse_or(
                "FENNY_MAX_PARSE_RETRIES",
                &get,
                defaults.max_parse_retries,
            )?,
            inference_timeout: Duration::from_secs(parse_or(
                "FENNY_INFERENCE_TIMEOUT_SECS",
                &get,
                defaults.inference_timeout.as_secs(),
            )?),
            tool_timeout: Duration::from_secs(parse_or(
                "FENNY_TOOL_TIMEOUT_SECS",
                &get,
                defaults.tool_timeout.as_secs(),
            )?),
            retrieval_top_k: retrieval_top_k.clamp(1, MAX_RETRIEVAL_K),
            history_turns: parse_or("FENNY_HISTORY_TURNS", &get, defaults.history_turns)?,
            inference_backend,
            gemini_api_key: get("GEMINI_API_KEY").unwrap_or_default(),
            gemini_model: get("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            llama_server_url: get("LLAMA_SERVER_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.llama_server_url),
            exchange_rate_api_key: get("EXCHANGE_RATE_API_KEY"),
            stock_quote_base_url: get("STOCK_QUOTE_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.stock_quote_base_url),
        })
    }
}

fn parse_or<T, G>(key: &str, get: &G, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("{} has an invalid value: '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_limits() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.max_files_per_session, 3);
        assert_eq!(settings.max_file_size, 5 * 1024 * 1024);
        assert_eq!(settings.session_expiry, Duration::from_secs(86_400));
        assert_eq!(settings.api_prefix, "/api");
    }

    #[test]
    fn test_overrides_and_clamping() {
        let settings = Settings::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("FENNY_RETRIEVAL_TOP_K", "50"),
            ("FENNY_INFERENCE_BACKEND", "llama"),
            ("FENNY_API_PREFIX", "v2/"),
        ]))
        .unwrap();
        assert_eq!(settings.api_port, 9000);
        assert_eq!(settings.retrieval_top_k, MAX_RETRIEVAL_K);
        assert_eq!(settings.inference_backend, InferenceBackend::Llama);
        assert_eq!(settings.api_prefix, "/v2");
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = Settings::from_lookup(lookup(&[("FENNY_MAX_ITERATIONS", "lots")])).unwrap_err();
        assert!(err.to_string().contains("FENNY_MAX_ITERATIONS"));
    }

    #[test]
    fn test_session_timing_bounds() {
        let zero_sweep = Settings::from_lookup(lookup(&[("FENNY_SESSION_SWEEP_SECS", "0")]));
        assert!(matches!(zero_sweep, Err(AgentError::Config(msg)) if msg.contains("SWEEP")));

        let huge = Settings::from_lookup(lookup(&[(
            "FENNY_SESSION_EXPIRY_HOURS",
            "18446744073709551615",
        )]));
        assert!(matches!(huge, Err(AgentError::Config(msg)) if msg.contains("EXPIRY")));

        let zero = Settings::from_lookup(lookup(&[("FENNY_SESSION_EXPIRY_HOURS", "0")]));
        assert!(matches!(zero, Err(AgentError::Config(_))));

        let ok = Settings::from_lookup(lookup(&[("FENNY_SESSION_EXPIRY_HOURS", "2")])).unwrap();
        assert_eq!(ok.session_expiry, Duration::from_secs(7_200));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let result = Settings::from_lookup(lookup(&[
            ("FENNY_CHUNK_SIZE", "100"),
            ("FENNY_CHUNK_OVERLAP", "100"),
        ]));
        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
