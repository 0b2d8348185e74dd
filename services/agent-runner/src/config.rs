//! Agent Configuration
//!
//! Loaded once at startup from an optional `agent.toml` layered under the
//! process environment, then frozen into [`AgentConfig`] and handed to the
//! runtime. Nothing below the entry point reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Immutable process-wide configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub assets: Vec<String>,
    pub interval: Duration,
    pub trading_mode: TradingMode,
    pub llm: LlmSettings,
    pub taapi: TaapiSettings,
    pub exchange: ExchangeSettings,
    pub risk: RiskSettings,
    pub paths: PathSettings,
    pub api: ApiSettings,
    /// Character budget for the serialized decision context
    pub max_context_chars: usize,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl std::str::FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            other => Err(format!("unknown trading mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Model used for the single sanitizer pass
    pub sanitize_model: String,
    pub referer: Option<String>,
    pub app_title: Option<String>,
    pub timeout: Duration,
    /// Attach a strict JSON schema to the primary call
    pub structured_output: bool,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaapiSettings {
    pub api_key: String,
    pub base_url: String,
    pub exchange: String,
    pub min_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub info_url: String,
    pub account: Option<String>,
    pub order_gateway_url: Option<String>,
    pub paper_starting_balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct RiskSettings {
    pub max_leverage: Decimal,
    /// Remaining capital at or below this converts new exposure to hold
    pub min_remaining_capital: Decimal,
    /// Exchange minimum order value
    pub min_order_notional: Decimal,
    pub size_decimals: u32,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_leverage: Decimal::from(5),
            min_remaining_capital: Decimal::ONE,
            min_order_notional: Decimal::from(10),
            size_decimals: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathSettings {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl PathSettings {
    pub fn diary_file(&self) -> PathBuf {
        self.data_dir.join("diary.jsonl")
    }

    pub fn active_trades_file(&self) -> PathBuf {
        self.data_dir.join("active_trades.jsonl")
    }

    pub fn llm_log_file(&self) -> PathBuf {
        self.log_dir.join("llm_requests.log")
    }
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

/// Raw key/value layer as read from file and environment
///
/// Everything is optional text here; [`AgentConfig::from_settings`] does the
/// parsing and validation so that errors name the offending key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSettings {
    pub assets: Option<String>,
    pub interval: Option<String>,
    pub trading_mode: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: Option<String>,
    pub openrouter_referer: Option<String>,
    pub openrouter_app_title: Option<String>,
    pub llm_model: Option<String>,
    pub sanitize_model: Option<String>,
    pub llm_timeout_secs: Option<String>,
    pub structured_output: Option<String>,
    pub reasoning_effort: Option<String>,
    pub taapi_api_key: Option<String>,
    pub taapi_base_url: Option<String>,
    pub taapi_exchange: Option<String>,
    pub taapi_min_interval_ms: Option<String>,
    pub hyperliquid_info_url: Option<String>,
    pub hyperliquid_account: Option<String>,
    pub order_gateway_url: Option<String>,
    pub max_leverage: Option<String>,
    pub min_remaining_capital: Option<String>,
    pub min_order_notional: Option<String>,
    pub size_decimals: Option<String>,
    pub paper_starting_balance: Option<String>,
    pub data_dir: Option<String>,
    pub log_dir: Option<String>,
    pub api_host: Option<String>,
    pub api_port: Option<String>,
    pub api_enabled: Option<String>,
    pub max_context_chars: Option<String>,
}

const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "x-ai/grok-4";
const DEFAULT_SANITIZE_MODEL: &str = "openai/gpt-5";
const DEFAULT_TAAPI_URL: &str = "https://api.taapi.io";
const DEFAULT_HYPERLIQUID_INFO_URL: &str = "https://api.hyperliquid.xyz/info";

impl AgentConfig {
    /// Load from `.env`, the optional config file and the environment
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = std::env::var("AGENT_CONFIG").unwrap_or_else(|_| "agent.toml".to_string());
        let raw: RawSettings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::default())
            .build()?
            .try_deserialize()?;

        Self::from_settings(raw)
    }

    /// Parse and validate a raw settings layer
    pub fn from_settings(raw: RawSettings) -> Result<Self, ConfigError> {
        let assets = parse_assets(raw.assets.as_deref().unwrap_or(""));
        if assets.is_empty() {
            return Err(ConfigError::Missing("ASSETS"));
        }

        let interval = parse_interval(raw.interval.as_deref().ok_or(ConfigError::Missing("INTERVAL"))?)
            .map_err(|message| ConfigError::Invalid { key: "INTERVAL", message })?;

        let trading_mode = match raw.trading_mode.as_deref() {
            Some(mode) => mode
                .parse()
                .map_err(|message| ConfigError::Invalid { key: "TRADING_MODE", message })?,
            None => TradingMode::default(),
        };

        let llm_api_key = non_empty(raw.openrouter_api_key).ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?;
        let taapi_api_key = non_empty(raw.taapi_api_key).ok_or(ConfigError::Missing("TAAPI_API_KEY"))?;

        let model = non_empty(raw.llm_model).unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let llm = LlmSettings {
            api_key: llm_api_key,
            base_url: non_empty(raw.openrouter_base_url)
                .unwrap_or_else(|| DEFAULT_OPENROUTER_URL.to_string()),
            sanitize_model: non_empty(raw.sanitize_model)
                .unwrap_or_else(|| DEFAULT_SANITIZE_MODEL.to_string()),
            model,
            referer: non_empty(raw.openrouter_referer),
            app_title: non_empty(raw.openrouter_app_title),
            timeout: Duration::from_secs(parse_num(raw.llm_timeout_secs, "LLM_TIMEOUT_SECS", 60u64)?),
            structured_output: parse_bool(raw.structured_output, "STRUCTURED_OUTPUT", true)?,
            reasoning_effort: non_empty(raw.reasoning_effort),
        };

        let taapi = TaapiSettings {
            api_key: taapi_api_key,
            base_url: non_empty(raw.taapi_base_url).unwrap_or_else(|| DEFAULT_TAAPI_URL.to_string()),
            exchange: non_empty(raw.taapi_exchange).unwrap_or_else(|| "binance".to_string()),
            min_interval: Duration::from_millis(parse_num(
                raw.taapi_min_interval_ms,
                "TAAPI_MIN_INTERVAL_MS",
                3500u64,
            )?),
        };

        let exchange = ExchangeSettings {
            info_url: non_empty(raw.hyperliquid_info_url)
                .unwrap_or_else(|| DEFAULT_HYPERLIQUID_INFO_URL.to_string()),
            account: non_empty(raw.hyperliquid_account),
            order_gateway_url: non_empty(raw.order_gateway_url),
            paper_starting_balance: parse_num(
                raw.paper_starting_balance,
                "PAPER_STARTING_BALANCE",
                Decimal::from(10_000),
            )?,
        };

        if trading_mode == TradingMode::Live {
            if exchange.account.is_none() {
                return Err(ConfigError::Missing("HYPERLIQUID_ACCOUNT"));
            }
            if exchange.order_gateway_url.is_none() {
                return Err(ConfigError::Missing("ORDER_GATEWAY_URL"));
            }
        }

        let defaults = RiskSettings::default();
        let risk = RiskSettings {
            max_leverage: parse_num(raw.max_leverage, "MAX_LEVERAGE", defaults.max_leverage)?,
            min_remaining_capital: parse_num(
                raw.min_remaining_capital,
                "MIN_REMAINING_CAPITAL",
                defaults.min_remaining_capital,
            )?,
            min_order_notional: parse_num(
                raw.min_order_notional,
                "MIN_ORDER_NOTIONAL",
                defaults.min_order_notional,
            )?,
            size_decimals: parse_num(raw.size_decimals, "SIZE_DECIMALS", defaults.size_decimals)?,
        };
        if risk.max_leverage <= Decimal::ZERO {
            return Err(ConfigError::Invalid {
                key: "MAX_LEVERAGE",
                message: "must be positive".to_string(),
            });
        }

        let paths = PathSettings {
            data_dir: PathBuf::from(non_empty(raw.data_dir).unwrap_or_else(|| "data".to_string())),
            log_dir: PathBuf::from(non_empty(raw.log_dir).unwrap_or_else(|| "logs".to_string())),
        };

        let api = ApiSettings {
            enabled: parse_bool(raw.api_enabled, "API_ENABLED", true)?,
            host: non_empty(raw.api_host).unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_num(raw.api_port, "API_PORT", 3000u16)?,
        };

        Ok(Self {
            assets,
            interval,
            trading_mode,
            llm,
            taapi,
            exchange,
            risk,
            paths,
            api,
            max_context_chars: parse_num(raw.max_context_chars, "MAX_CONTEXT_CHARS", 60_000usize)?,
        })
    }
}

/// Split an asset list on commas and/or whitespace, keeping first occurrence order
pub fn parse_assets(raw: &str) -> Vec<String> {
    let mut assets: Vec<String> = Vec::new();
    for token in raw.split(|c: char| c == ',' || c.is_whitespace()) {
        let symbol = token.trim().to_ascii_uppercase();
        if !symbol.is_empty() && !assets.contains(&symbol) {
            assets.push(symbol);
        }
    }
    assets
}

/// Parse `30s`, `5m`, `1h`, `1d`
pub fn parse_interval(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.len() < 2 {
        return Err(format!("invalid interval '{}'", raw));
    }
    let (value, unit) = raw.split_at(raw.len() - 1);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid interval '{}'", raw))?;
    if value == 0 {
        return Err("interval must be positive".to_string());
    }
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => return Err(format!("unsupported interval unit '{}'", other)),
    };
    Ok(Duration::from_secs(secs))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_num<T: std::str::FromStr>(
    value: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match non_empty(value) {
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match non_empty(value).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                message: format!("expected a boolean, got '{}'", v),
            }),
        },
    }
}
