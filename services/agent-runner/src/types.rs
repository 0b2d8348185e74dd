//! Core data model
//!
//! Decisions, market snapshots, exchange truth and the durable Active Trade
//! Record. Prices, sizes and capital are `Decimal`; indicator readings are `f64`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Position direction. For orders, `Long` buys and `Short` sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Trade action proposed by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TradeAction {
    #[serde(alias = "open_long")]
    OpenLong,
    #[serde(alias = "open_short")]
    OpenShort,
    Close,
    Hold,
    Adjust,
}

impl TradeAction {
    /// Side a new position would take, for the two open actions
    pub fn open_side(self) -> Option<Side> {
        match self {
            TradeAction::OpenLong => Some(Side::Long),
            TradeAction::OpenShort => Some(Side::Short),
            TradeAction::Close | TradeAction::Hold | TradeAction::Adjust => None,
        }
    }

    pub fn all() -> [TradeAction; 5] {
        [
            TradeAction::OpenLong,
            TradeAction::OpenShort,
            TradeAction::Close,
            TradeAction::Hold,
            TradeAction::Adjust,
        ]
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeAction::OpenLong => write!(f, "open-long"),
            TradeAction::OpenShort => write!(f, "open-short"),
            TradeAction::Close => write!(f, "close"),
            TradeAction::Hold => write!(f, "hold"),
            TradeAction::Adjust => write!(f, "adjust"),
        }
    }
}

impl std::str::FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "open-long" => Ok(TradeAction::OpenLong),
            "open-short" => Ok(TradeAction::OpenShort),
            "close" => Ok(TradeAction::Close),
            "hold" => Ok(TradeAction::Hold),
            "adjust" => Ok(TradeAction::Adjust),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Conviction grade the model attaches to a setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupGrade {
    A,
    B,
    C,
}

impl std::str::FromStr for SetupGrade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(SetupGrade::A),
            "B" => Ok(SetupGrade::B),
            "C" => Ok(SetupGrade::C),
            other => Err(format!("unknown setup grade '{}'", other)),
        }
    }
}

/// One per-asset element of the model's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecision {
    pub asset: String,
    pub action: TradeAction,
    /// Requested notional in USD (size x price)
    pub allocation_usd: Decimal,
    /// Share of available capital committed as margin, in [0, 1]
    pub allocation_fraction: Option<f64>,
    pub tp_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    #[serde(default)]
    pub exit_plan: String,
    #[serde(default)]
    pub rationale: String,
    pub setup_grade: Option<SetupGrade>,
}

impl TradeDecision {
    pub fn hold(asset: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            action: TradeAction::Hold,
            allocation_usd: Decimal::ZERO,
            allocation_fraction: None,
            tp_price: None,
            sl_price: None,
            exit_plan: String::new(),
            rationale: rationale.into(),
            setup_grade: None,
        }
    }

    /// Same decision converted to hold, keeping the model's text for the audit trail
    pub fn into_hold(self, reason: &str) -> Self {
        let rationale = if self.rationale.is_empty() {
            reason.to_string()
        } else {
            format!("{} [{}]", self.rationale, reason)
        };
        Self {
            action: TradeAction::Hold,
            allocation_usd: Decimal::ZERO,
            allocation_fraction: Some(0.0),
            tp_price: None,
            sl_price: None,
            rationale,
            ..self
        }
    }
}

/// 5-minute indicator readings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntradayIndicators {
    pub ema20: Option<f64>,
    pub macd: Option<f64>,
    pub rsi7: Option<f64>,
    pub rsi14: Option<f64>,
    pub obv: Option<f64>,
    pub mfi: Option<f64>,
    pub ema20_series: Vec<f64>,
    pub macd_series: Vec<f64>,
    pub rsi7_series: Vec<f64>,
    pub rsi14_series: Vec<f64>,
}

/// 4-hour indicator readings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LongTermIndicators {
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub atr3: Option<f64>,
    pub atr14: Option<f64>,
    pub mfi: Option<f64>,
    pub macd_series: Vec<f64>,
    pub rsi14_series: Vec<f64>,
}

/// Keep the most recent `len` points
pub fn truncate_series<T>(series: &mut Vec<T>, len: usize) {
    if series.len() > len {
        let excess = series.len() - len;
        series.drain(..excess);
    }
}

impl IntradayIndicators {
    pub fn truncate(&mut self, len: usize) {
        truncate_series(&mut self.ema20_series, len);
        truncate_series(&mut self.macd_series, len);
        truncate_series(&mut self.rsi7_series, len);
        truncate_series(&mut self.rsi14_series, len);
    }
}

impl LongTermIndicators {
    pub fn truncate(&mut self, len: usize) {
        truncate_series(&mut self.macd_series, len);
        truncate_series(&mut self.rsi14_series, len);
    }
}

/// Market Snapshot Provider output for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub asset: String,
    pub mid_price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub intraday: IntradayIndicators,
    pub long_term: LongTermIndicators,
    pub open_interest: Option<f64>,
    /// Hourly funding rate as a fraction
    pub funding_rate: Option<f64>,
}

/// Authoritative open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub asset: String,
    pub side: Side,
    /// Absolute size in base units
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Option<Decimal>,
    pub liquidation_price: Option<Decimal>,
}

impl ExchangePosition {
    pub fn notional(&self, price: Decimal) -> Decimal {
        self.size * price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Limit,
    TakeProfit,
    StopLoss,
}

/// Resting order on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub asset: String,
    pub order_id: String,
    pub side: Side,
    pub size: Decimal,
    pub limit_price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub kind: OrderKind,
    pub reduce_only: bool,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub asset: String,
    pub order_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub closed_pnl: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Account-level capital figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    /// Withdrawable collateral; the gate's capital input
    pub available_capital: Decimal,
    pub account_value: Decimal,
    pub margin_used: Decimal,
}

/// How an Active Trade Record came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOrigin {
    Executed,
    Adopted,
}

/// Durable local intent for an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTradeRecord {
    pub asset: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub order_ids: Vec<String>,
    pub tp_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    #[serde(default)]
    pub exit_plan: String,
    pub setup_grade: Option<SetupGrade>,
    pub origin: RecordOrigin,
}

/// Per-asset slice of the decision context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetContext {
    pub asset: String,
    pub mid_price: Decimal,
    /// Recent mid prices, oldest first
    pub price_history: Vec<Decimal>,
    pub intraday: IntradayIndicators,
    pub long_term: LongTermIndicators,
    pub open_interest: Option<f64>,
    pub funding_rate: Option<f64>,
    pub funding_annualized_pct: Option<f64>,
    pub position: Option<ExchangePosition>,
    pub open_orders: Vec<OpenOrder>,
    pub recent_fills: Vec<Fill>,
    pub active_trade: Option<ActiveTradeRecord>,
}
