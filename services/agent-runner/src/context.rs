//! Context Builder
//!
//! Assembles the per-cycle decision context from market snapshots, exchange
//! truth, the active trade records and the diary tail. The document always
//! carries the same fields; lists are truncated to fixed lengths and the
//! whole thing is squeezed under a character budget.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::providers::{ExchangeSnapshot, IndicatorSpec, MarketSnapshotProvider};
use crate::store::ActiveTradeStore;
use crate::types::{truncate_series, ActiveTradeRecord, AssetContext, MarketSnapshot};

/// Mid prices retained per asset across cycles
pub const PRICE_HISTORY_CAPACITY: usize = 60;

const REQUIREMENT: &str =
    "Decide actions for all assets and return a strict JSON array matching the schema.";

#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub series_len: usize,
    pub price_history: usize,
    pub open_orders: usize,
    pub fills: usize,
    pub diary_tail: usize,
    pub max_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            series_len: 10,
            price_history: 10,
            open_orders: 50,
            fills: 20,
            diary_tail: 10,
            max_chars: 60_000,
        }
    }
}

/// Shortened lengths applied when over the character budget
const REDUCED_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub cycle: u64,
    pub minutes_since_start: f64,
    pub current_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountContext {
    pub available_capital: Decimal,
    pub account_value: Decimal,
    pub total_return_pct: f64,
    pub active_trades: Vec<ActiveTradeRecord>,
    pub recent_diary: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instructions {
    pub assets: Vec<String>,
    pub requirement: String,
}

/// The structured document handed to the Decision Engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub invocation: Invocation,
    pub account: AccountContext,
    pub market_data: Vec<AssetContext>,
    pub instructions: Instructions,
}

impl DecisionContext {
    /// Assets present in this cycle's context, in declared order
    pub fn assets(&self) -> &[String] {
        &self.instructions.assets
    }

    pub fn asset(&self, asset: &str) -> Option<&AssetContext> {
        self.market_data.iter().find(|a| a.asset == asset)
    }

    pub fn mid(&self, asset: &str) -> Option<Decimal> {
        self.asset(asset).map(|a| a.mid_price)
    }

    pub fn to_prompt(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn shorten_series(&mut self, len: usize) {
        for asset in &mut self.market_data {
            asset.intraday.truncate(len);
            asset.long_term.truncate(len);
        }
    }

    fn shorten_price_history(&mut self, len: usize) {
        for asset in &mut self.market_data {
            truncate_series(&mut asset.price_history, len);
        }
    }
}

/// Context plus the assets that had to be excluded
#[derive(Debug)]
pub struct BuiltContext {
    pub context: DecisionContext,
    pub failures: Vec<AgentError>,
}

pub struct ContextBuilder {
    market: Arc<dyn MarketSnapshotProvider>,
    spec: IndicatorSpec,
    limits: ContextLimits,
    price_history: HashMap<String, VecDeque<Decimal>>,
    started_at: DateTime<Utc>,
    starting_value: Option<Decimal>,
}

impl ContextBuilder {
    pub fn new(market: Arc<dyn MarketSnapshotProvider>, limits: ContextLimits) -> Self {
        Self {
            market,
            spec: IndicatorSpec {
                series_len: limits.series_len,
                ..IndicatorSpec::default()
            },
            limits,
            price_history: HashMap::new(),
            started_at: Utc::now(),
            starting_value: None,
        }
    }

    fn validate(asset: &str, snapshot: MarketSnapshot) -> Result<MarketSnapshot> {
        if snapshot.asset != asset {
            return Err(AgentError::context(
                asset,
                format!("snapshot returned for {}", snapshot.asset),
            ));
        }
        if snapshot.mid_price <= Decimal::ZERO {
            return Err(AgentError::context(asset, "mid price missing or non-positive"));
        }
        Ok(snapshot)
    }

    fn record_mid(&mut self, asset: &str, mid: Decimal) -> Vec<Decimal> {
        let history = self.price_history.entry(asset.to_string()).or_default();
        history.push_back(mid);
        while history.len() > PRICE_HISTORY_CAPACITY {
            history.pop_front();
        }
        let skip = history.len().saturating_sub(self.limits.price_history);
        history.iter().skip(skip).copied().collect()
    }

    /// Build the context for one cycle
    ///
    /// Snapshot fetches run concurrently, one per asset. An asset whose
    /// snapshot fails or is malformed is left out and reported in `failures`.
    pub async fn build(
        &mut self,
        cycle: u64,
        assets: &[String],
        exchange: &ExchangeSnapshot,
        store: &ActiveTradeStore,
        recent_diary: Vec<Value>,
    ) -> BuiltContext {
        let market = self.market.clone();
        let spec = self.spec.clone();
        let fetches = assets.iter().map(|asset| {
            let market = market.clone();
            let spec = spec.clone();
            async move { market.fetch(asset, &spec).await }
        });
        let results = join_all(fetches).await;

        let mut market_data = Vec::with_capacity(assets.len());
        let mut included = Vec::with_capacity(assets.len());
        let mut failures = Vec::new();

        for (asset, result) in assets.iter().zip(results) {
            let snapshot = match result.and_then(|s| Self::validate(asset, s)) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let err = match e {
                        AgentError::ContextBuild { .. } => e,
                        other => AgentError::context(asset.as_str(), other),
                    };
                    warn!("Excluding {} from cycle {}: {}", asset, cycle, err);
                    failures.push(err);
                    continue;
                }
            };

            let price_history = self.record_mid(asset, snapshot.mid_price);
            let mut intraday = snapshot.intraday;
            let mut long_term = snapshot.long_term;
            intraday.truncate(self.limits.series_len);
            long_term.truncate(self.limits.series_len);

            let mut open_orders: Vec<_> = exchange.orders_for(asset).cloned().collect();
            open_orders.truncate(self.limits.open_orders);
            let mut recent_fills: Vec<_> = exchange.fills_for(asset).cloned().collect();
            truncate_series(&mut recent_fills, self.limits.fills);

            market_data.push(AssetContext {
                asset: asset.clone(),
                mid_price: snapshot.mid_price,
                price_history,
                intraday,
                long_term,
                open_interest: snapshot.open_interest,
                funding_rate: snapshot.funding_rate,
                funding_annualized_pct: snapshot
                    .funding_rate
                    .map(|f| (f * 24.0 * 365.0 * 100.0 * 100.0).round() / 100.0),
                position: exchange.position(asset).cloned(),
                open_orders,
                recent_fills,
                active_trade: store.get(asset).cloned(),
            });
            included.push(asset.clone());
        }

        let account_value = exchange.account.account_value;
        let starting_value = *self.starting_value.get_or_insert(account_value);
        let total_return_pct = if starting_value > Decimal::ZERO {
            ((account_value - starting_value) / starting_value * Decimal::from(100))
                .round_dp(2)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let mut recent_diary = recent_diary;
        truncate_series(&mut recent_diary, self.limits.diary_tail);

        let now = Utc::now();
        let mut context = DecisionContext {
            invocation: Invocation {
                cycle,
                minutes_since_start: (now - self.started_at).num_seconds() as f64 / 60.0,
                current_time: now,
            },
            account: AccountContext {
                available_capital: exchange.account.available_capital,
                account_value,
                total_return_pct,
                active_trades: store.snapshot(),
                recent_diary,
            },
            market_data,
            instructions: Instructions {
                assets: included,
                requirement: REQUIREMENT.to_string(),
            },
        };

        self.fit_budget(&mut context);

        BuiltContext { context, failures }
    }

    /// Shrink optional history until the serialized context fits
    fn fit_budget(&self, context: &mut DecisionContext) {
        let size = |c: &DecisionContext| c.to_prompt().map(|p| p.len()).unwrap_or(usize::MAX);

        if size(context) <= self.limits.max_chars {
            return;
        }
        context.account.recent_diary.clear();
        if size(context) <= self.limits.max_chars {
            debug!("Context over budget; dropped diary tail");
            return;
        }
        context.shorten_series(REDUCED_LEN);
        if size(context) <= self.limits.max_chars {
            debug!("Context over budget; shortened indicator series");
            return;
        }
        context.shorten_price_history(REDUCED_LEN);
        let final_size = size(context);
        if final_size > self.limits.max_chars {
            warn!(
                "Context still {} chars after truncation (budget {})",
                final_size, self.limits.max_chars
            );
        }
    }
}
