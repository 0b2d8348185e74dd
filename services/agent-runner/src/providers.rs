//! Provider seams
//!
//! The loop talks to the outside world through three traits: market data,
//! exchange truth and order placement. Live, paper and test implementations
//! plug in behind `Arc<dyn ...>`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::types::{AccountSummary, ExchangePosition, Fill, MarketSnapshot, OpenOrder, Side};

/// Which indicator windows to fetch and how many points to keep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorSpec {
    pub intraday_interval: String,
    pub long_term_interval: String,
    pub series_len: usize,
}

impl Default for IndicatorSpec {
    fn default() -> Self {
        Self {
            intraday_interval: "5m".to_string(),
            long_term_interval: "4h".to_string(),
            series_len: 10,
        }
    }
}

/// Indicator values and mid price per asset
#[async_trait::async_trait]
pub trait MarketSnapshotProvider: Send + Sync {
    async fn fetch(&self, asset: &str, spec: &IndicatorSpec) -> Result<MarketSnapshot>;

    fn name(&self) -> &str;
}

/// Authoritative positions, orders and fills; never cached by the agent
#[async_trait::async_trait]
pub trait ExchangeStateProvider: Send + Sync {
    async fn positions(&self) -> Result<Vec<ExchangePosition>>;

    async fn open_orders(&self) -> Result<Vec<OpenOrder>>;

    async fn fills(&self, since: DateTime<Utc>) -> Result<Vec<Fill>>;

    async fn account(&self) -> Result<AccountSummary>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub asset: String,
    pub side: Side,
    /// Base-unit size, always positive
    pub size: Decimal,
    /// Price used for sizing and for paper fills
    pub reference_price: Decimal,
    pub tp_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_ids: Vec<String>,
    pub filled_size: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Places orders on the exchange
#[async_trait::async_trait]
pub trait ExecutionLayer: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;
}

/// Current exposure of one asset, valued at mid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exposure {
    pub side: Side,
    pub notional: Decimal,
}

/// One consistent read of exchange state
#[derive(Debug, Clone)]
pub struct ExchangeSnapshot {
    pub positions: Vec<ExchangePosition>,
    pub open_orders: Vec<OpenOrder>,
    pub fills: Vec<Fill>,
    pub account: AccountSummary,
    pub fetched_at: DateTime<Utc>,
}

impl ExchangeSnapshot {
    /// Read everything concurrently; any failure means exchange truth is unknown
    pub async fn fetch(
        provider: &dyn ExchangeStateProvider,
        fills_since: DateTime<Utc>,
    ) -> Result<Self> {
        let (positions, open_orders, fills, account) = futures::try_join!(
            provider.positions(),
            provider.open_orders(),
            provider.fills(fills_since),
            provider.account(),
        )
        .map_err(|e| match e {
            AgentError::ExchangeUnavailable(_) => e,
            other => AgentError::ExchangeUnavailable(other.to_string()),
        })?;

        Ok(Self {
            positions,
            open_orders,
            fills,
            account,
            fetched_at: Utc::now(),
        })
    }

    pub fn position(&self, asset: &str) -> Option<&ExchangePosition> {
        self.positions
            .iter()
            .find(|p| p.asset == asset && p.size > Decimal::ZERO)
    }

    pub fn orders_for<'a>(&'a self, asset: &'a str) -> impl Iterator<Item = &'a OpenOrder> + 'a {
        self.open_orders.iter().filter(move |o| o.asset == asset)
    }

    pub fn fills_for<'a>(&'a self, asset: &'a str) -> impl Iterator<Item = &'a Fill> + 'a {
        self.fills.iter().filter(move |f| f.asset == asset)
    }

    /// Open exposure per asset, valued at the given marks (entry price as fallback)
    pub fn exposure(&self, marks: &HashMap<String, Decimal>) -> HashMap<String, Exposure> {
        self.positions
            .iter()
            .filter(|p| p.size > Decimal::ZERO)
            .map(|p| {
                let price = marks.get(&p.asset).copied().unwrap_or(p.entry_price);
                (
                    p.asset.clone(),
                    Exposure {
                        side: p.side,
                        notional: p.notional(price),
                    },
                )
            })
            .collect()
    }
}
