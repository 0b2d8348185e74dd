//! Test doubles for running whole cycles without network access

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent_runner::config::{AgentConfig, RawSettings};
use agent_runner::error::{AgentError, Result};
use agent_runner::llm::{DecisionModel, ModelRequest, ModelRole};
use agent_runner::providers::{
    ExchangeStateProvider, ExecutionLayer, IndicatorSpec, MarketSnapshotProvider, OrderAck,
    OrderRequest,
};
use agent_runner::types::{
    AccountSummary, ExchangePosition, Fill, IntradayIndicators, LongTermIndicators,
    MarketSnapshot, OpenOrder,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;

/// Model that replays canned responses and remembers who asked
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String>>>,
    /// Returned once the script runs out
    fallback: Option<String>,
    roles: Mutex<Vec<ModelRole>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            fallback: None,
            roles: Mutex::new(Vec::new()),
        })
    }

    /// Same answer every call
    pub fn always(response: String) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Some(response),
            roles: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.roles.lock().unwrap().len()
    }

    pub fn roles(&self) -> Vec<ModelRole> {
        self.roles.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DecisionModel for ScriptedModel {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        self.roles.lock().unwrap().push(request.role);
        if let Some(next) = self.responses.lock().unwrap().pop_front() {
            return next;
        }
        self.fallback
            .clone()
            .ok_or_else(|| AgentError::Model("no scripted response left".to_string()))
    }
}

/// Market data with fixed mids and a mild uptrend on the indicators
pub struct FixedMarket {
    mids: HashMap<String, Decimal>,
    failing: HashSet<String>,
}

impl FixedMarket {
    pub fn new(mids: &[(&str, i64)]) -> Self {
        Self {
            mids: mids
                .iter()
                .map(|(asset, mid)| (asset.to_string(), Decimal::from(*mid)))
                .collect(),
            failing: HashSet::new(),
        }
    }

    pub fn failing(mut self, asset: &str) -> Self {
        self.failing.insert(asset.to_string());
        self
    }
}

#[async_trait::async_trait]
impl MarketSnapshotProvider for FixedMarket {
    async fn fetch(&self, asset: &str, spec: &IndicatorSpec) -> Result<MarketSnapshot> {
        if self.failing.contains(asset) {
            return Err(AgentError::Provider(format!("indicator feed down for {}", asset)));
        }
        let mid = self
            .mids
            .get(asset)
            .copied()
            .ok_or_else(|| AgentError::context(asset, "unknown asset"))?;

        let series: Vec<f64> = (0..spec.series_len).map(|i| 100.0 + i as f64).collect();
        Ok(MarketSnapshot {
            asset: asset.to_string(),
            mid_price: mid,
            timestamp: Utc::now(),
            intraday: IntradayIndicators {
                ema20: Some(101.0),
                rsi14: Some(58.0),
                ema20_series: series.clone(),
                rsi14_series: series.clone(),
                ..Default::default()
            },
            long_term: LongTermIndicators {
                ema20: Some(100.5),
                ema50: Some(99.0),
                atr14: Some(2.5),
                macd_series: series,
                ..Default::default()
            },
            open_interest: Some(1_000_000.0),
            funding_rate: Some(0.0001),
        })
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Execution layer that counts orders and forwards or rejects them
pub struct CountingExecution {
    inner: Option<Arc<dyn ExecutionLayer>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<OrderRequest>>,
}

impl CountingExecution {
    pub fn forwarding(inner: Arc<dyn ExecutionLayer>) -> Arc<Self> {
        Arc::new(Self {
            inner: Some(inner),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            inner: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<OrderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ExecutionLayer for CountingExecution {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        match &self.inner {
            Some(inner) => inner.place_order(request).await,
            None => Err(AgentError::execution(&request.asset, "rejected by exchange")),
        }
    }
}

/// Exchange that cannot be reached at all
pub struct UnreachableExchange;

#[async_trait::async_trait]
impl ExchangeStateProvider for UnreachableExchange {
    async fn positions(&self) -> Result<Vec<ExchangePosition>> {
        Err(AgentError::ExchangeUnavailable("connection refused".to_string()))
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>> {
        Err(AgentError::ExchangeUnavailable("connection refused".to_string()))
    }

    async fn fills(&self, _since: DateTime<Utc>) -> Result<Vec<Fill>> {
        Err(AgentError::ExchangeUnavailable("connection refused".to_string()))
    }

    async fn account(&self) -> Result<AccountSummary> {
        Err(AgentError::ExchangeUnavailable("connection refused".to_string()))
    }
}

/// Exchange that answers a fixed number of calls, then goes down
pub struct FlakyExchange {
    inner: Arc<dyn ExchangeStateProvider>,
    healthy_calls: usize,
    calls: AtomicUsize,
}

impl FlakyExchange {
    pub fn new(inner: Arc<dyn ExchangeStateProvider>, healthy_calls: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            healthy_calls,
            calls: AtomicUsize::new(0),
        })
    }

    fn check(&self) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.healthy_calls {
            return Err(AgentError::ExchangeUnavailable("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ExchangeStateProvider for FlakyExchange {
    async fn positions(&self) -> Result<Vec<ExchangePosition>> {
        self.check()?;
        self.inner.positions().await
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>> {
        self.check()?;
        self.inner.open_orders().await
    }

    async fn fills(&self, since: DateTime<Utc>) -> Result<Vec<Fill>> {
        self.check()?;
        self.inner.fills(since).await
    }

    async fn account(&self) -> Result<AccountSummary> {
        self.check()?;
        self.inner.account().await
    }
}

/// Paper-mode configuration rooted in a temp directory
pub fn test_config(assets: &str, dir: &Path) -> AgentConfig {
    AgentConfig::from_settings(RawSettings {
        assets: Some(assets.to_string()),
        interval: Some("1s".to_string()),
        openrouter_api_key: Some("test-key".to_string()),
        taapi_api_key: Some("test-key".to_string()),
        data_dir: Some(dir.join("data").display().to_string()),
        log_dir: Some(dir.join("logs").display().to_string()),
        api_enabled: Some("false".to_string()),
        ..Default::default()
    })
    .unwrap()
}

/// Decision array as the model would write it
pub fn decisions(entries: &[(&str, &str, i64)]) -> String {
    let items: Vec<_> = entries
        .iter()
        .map(|(asset, action, usd)| {
            json!({
                "asset": asset,
                "action": action,
                "allocation_usd": usd,
                "tp_price": null,
                "sl_price": null,
                "exit_plan": "close on a 4h close below EMA50",
                "rationale": "test",
                "setup_grade": "B"
            })
        })
        .collect();
    serde_json::to_string(&items).unwrap()
}
