//! Hyperliquid read-only info client
//!
//! Every query is a POST to the `/info` endpoint with a `type` discriminator.
//! Numeric fields arrive as decimal strings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::providers::{ExchangeStateProvider, IndicatorSpec, MarketSnapshotProvider};
use crate::taapi::{IndicatorQuery, TaapiClient};
use crate::types::{
    AccountSummary, ExchangePosition, Fill, IntradayIndicators, LongTermIndicators,
    MarketSnapshot, OpenOrder, OrderKind, Side,
};

/// Funding and open interest for one asset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetCtx {
    pub funding: Option<f64>,
    pub open_interest: Option<f64>,
}

pub struct HyperliquidInfoClient {
    client: Client,
    info_url: String,
    account: Option<String>,
}

impl HyperliquidInfoClient {
    pub fn new(info_url: &str, account: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            info_url: info_url.to_string(),
            account,
        })
    }

    fn account(&self) -> Result<&str> {
        self.account
            .as_deref()
            .ok_or_else(|| AgentError::ExchangeUnavailable("no exchange account configured".to_string()))
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, body: Value) -> Result<T> {
        let response = self
            .client
            .post(&self.info_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Provider(format!("info request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Provider(format!(
                "info {} returned {}: {}",
                body["type"], status, text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("invalid info {} response: {}", body["type"], e)))
    }

    /// Mid price for one asset
    pub async fn mid(&self, asset: &str) -> Result<Decimal> {
        let mids: std::collections::HashMap<String, String> =
            self.post(json!({ "type": "allMids" })).await?;
        mids.get(asset)
            .and_then(|m| m.parse::<Decimal>().ok())
            .filter(|m| *m > Decimal::ZERO)
            .ok_or_else(|| AgentError::context(asset, "no mid price"))
    }

    pub async fn asset_ctx(&self, asset: &str) -> Result<AssetCtx> {
        let (meta, ctxs): (Meta, Vec<RawAssetCtx>) =
            self.post(json!({ "type": "metaAndAssetCtxs" })).await?;
        let index = meta
            .universe
            .iter()
            .position(|u| u.name == asset)
            .ok_or_else(|| AgentError::context(asset, "asset not listed"))?;
        let ctx = ctxs.get(index).ok_or_else(|| AgentError::context(asset, "asset context missing"))?;
        Ok(AssetCtx {
            funding: ctx.funding.as_deref().and_then(|v| v.parse().ok()),
            open_interest: ctx.open_interest.as_deref().and_then(|v| v.parse().ok()),
        })
    }

    async fn clearinghouse_state(&self) -> Result<ClearinghouseState> {
        let user = self.account()?;
        self.post(json!({ "type": "clearinghouseState", "user": user }))
            .await
    }
}

#[derive(Debug, Deserialize)]
struct Meta {
    universe: Vec<UniverseEntry>,
}

#[derive(Debug, Deserialize)]
struct UniverseEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAssetCtx {
    funding: Option<String>,
    open_interest: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearinghouseState {
    #[serde(default)]
    asset_positions: Vec<AssetPosition>,
    margin_summary: MarginSummary,
    withdrawable: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarginSummary {
    account_value: Decimal,
    total_margin_used: Decimal,
}

#[derive(Debug, Deserialize)]
struct AssetPosition {
    position: RawPosition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    coin: String,
    /// Signed size, negative for shorts
    szi: Decimal,
    entry_px: Option<Decimal>,
    unrealized_pnl: Decimal,
    leverage: Option<RawLeverage>,
    liquidation_px: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct RawLeverage {
    value: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    coin: String,
    oid: u64,
    side: String,
    sz: Decimal,
    limit_px: Option<Decimal>,
    trigger_px: Option<Decimal>,
    #[serde(default)]
    order_type: String,
    #[serde(default)]
    reduce_only: bool,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFill {
    coin: String,
    oid: u64,
    side: String,
    sz: Decimal,
    px: Decimal,
    #[serde(default)]
    fee: Decimal,
    #[serde(default)]
    closed_pnl: Decimal,
    time: i64,
}

fn order_side(raw: &str) -> Side {
    // "B" is a bid (buy), "A" an ask (sell)
    if raw.eq_ignore_ascii_case("b") {
        Side::Long
    } else {
        Side::Short
    }
}

fn order_kind(order_type: &str) -> OrderKind {
    let lower = order_type.to_ascii_lowercase();
    if lower.starts_with("take profit") {
        OrderKind::TakeProfit
    } else if lower.starts_with("stop") {
        OrderKind::StopLoss
    } else {
        OrderKind::Limit
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait::async_trait]
impl ExchangeStateProvider for HyperliquidInfoClient {
    async fn positions(&self) -> Result<Vec<ExchangePosition>> {
        let state = self.clearinghouse_state().await?;
        Ok(state
            .asset_positions
            .into_iter()
            .map(|p| p.position)
            .filter(|p| !p.szi.is_zero())
            .map(|p| ExchangePosition {
                side: if p.szi > Decimal::ZERO { Side::Long } else { Side::Short },
                size: p.szi.abs(),
                entry_price: p.entry_px.unwrap_or_default(),
                unrealized_pnl: p.unrealized_pnl,
                leverage: p.leverage.map(|l| l.value),
                liquidation_price: p.liquidation_px,
                asset: p.coin,
            })
            .collect())
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>> {
        let user = self.account()?;
        let orders: Vec<RawOrder> = self
            .post(json!({ "type": "frontendOpenOrders", "user": user }))
            .await?;
        Ok(orders
            .into_iter()
            .map(|o| OpenOrder {
                order_id: o.oid.to_string(),
                side: order_side(&o.side),
                size: o.sz,
                limit_price: o.limit_px,
                trigger_price: o.trigger_px.filter(|p| !p.is_zero()),
                kind: order_kind(&o.order_type),
                reduce_only: o.reduce_only,
                placed_at: from_millis(o.timestamp),
                asset: o.coin,
            })
            .collect())
    }

    async fn fills(&self, since: DateTime<Utc>) -> Result<Vec<Fill>> {
        let user = self.account()?;
        let fills: Vec<RawFill> = self.post(json!({ "type": "userFills", "user": user })).await?;
        let fills: Vec<Fill> = fills
            .into_iter()
            .map(|f| Fill {
                order_id: f.oid.to_string(),
                side: order_side(&f.side),
                size: f.sz,
                price: f.px,
                fee: f.fee,
                closed_pnl: f.closed_pnl,
                timestamp: from_millis(f.time),
                asset: f.coin,
            })
            .filter(|f| f.timestamp >= since)
            .collect();
        debug!("Fetched {} fills since {}", fills.len(), since);
        Ok(fills)
    }

    async fn account(&self) -> Result<AccountSummary> {
        let state = self.clearinghouse_state().await?;
        Ok(AccountSummary {
            available_capital: state.withdrawable,
            account_value: state.margin_summary.account_value,
            margin_used: state.margin_summary.total_margin_used,
        })
    }
}

/// Market snapshots from Hyperliquid mids and TAAPI indicators
pub struct IndicatorMarketProvider {
    info: Arc<HyperliquidInfoClient>,
    taapi: Arc<TaapiClient>,
}

impl IndicatorMarketProvider {
    pub fn new(info: Arc<HyperliquidInfoClient>, taapi: Arc<TaapiClient>) -> Self {
        Self { info, taapi }
    }

    async fn series(&self, asset: &str, query: IndicatorQuery<'_>, len: usize) -> Vec<f64> {
        match self.taapi.series(asset, query, len).await {
            Ok(series) => series,
            Err(e) => {
                warn!("{} {} {} unavailable: {}", asset, query.indicator, query.interval, e);
                Vec::new()
            }
        }
    }

    async fn value(&self, asset: &str, query: IndicatorQuery<'_>) -> Option<f64> {
        match self.taapi.value(asset, query).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{} {} {} unavailable: {}", asset, query.indicator, query.interval, e);
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl MarketSnapshotProvider for IndicatorMarketProvider {
    async fn fetch(&self, asset: &str, spec: &IndicatorSpec) -> Result<MarketSnapshot> {
        let mid_price = self
            .info
            .mid(asset)
            .await
            .map_err(|e| match e {
                AgentError::ContextBuild { .. } => e,
                other => AgentError::context(asset, other),
            })?;
        let ctx = match self.info.asset_ctx(asset).await {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                warn!("{} funding/open interest unavailable: {}", asset, e);
                None
            }
        };

        let n = spec.series_len;
        let fast = spec.intraday_interval.as_str();
        let slow = spec.long_term_interval.as_str();

        let ema20_series = self.series(asset, IndicatorQuery::new("ema", fast).period(20), n).await;
        let macd_series = self.series(asset, IndicatorQuery::new("macd", fast).key("valueMACD"), n).await;
        let rsi7_series = self.series(asset, IndicatorQuery::new("rsi", fast).period(7), n).await;
        let rsi14_series = self.series(asset, IndicatorQuery::new("rsi", fast).period(14), n).await;
        let obv = self.series(asset, IndicatorQuery::new("obv", fast), n).await;
        let mfi = self.series(asset, IndicatorQuery::new("mfi", fast).period(14), n).await;

        let intraday = IntradayIndicators {
            ema20: ema20_series.last().copied(),
            macd: macd_series.last().copied(),
            rsi7: rsi7_series.last().copied(),
            rsi14: rsi14_series.last().copied(),
            obv: obv.last().copied(),
            mfi: mfi.last().copied(),
            ema20_series,
            macd_series,
            rsi7_series,
            rsi14_series,
        };

        let long_term = LongTermIndicators {
            ema20: self.value(asset, IndicatorQuery::new("ema", slow).period(20)).await,
            ema50: self.value(asset, IndicatorQuery::new("ema", slow).period(50)).await,
            atr3: self.value(asset, IndicatorQuery::new("atr", slow).period(3)).await,
            atr14: self.value(asset, IndicatorQuery::new("atr", slow).period(14)).await,
            mfi: self.value(asset, IndicatorQuery::new("mfi", slow).period(14)).await,
            macd_series: self.series(asset, IndicatorQuery::new("macd", slow).key("valueMACD"), n).await,
            rsi14_series: self.series(asset, IndicatorQuery::new("rsi", slow).period(14), n).await,
        };

        Ok(MarketSnapshot {
            asset: asset.to_string(),
            mid_price,
            timestamp: Utc::now(),
            intraday,
            long_term,
            open_interest: ctx.and_then(|c| c.open_interest),
            funding_rate: ctx.and_then(|c| c.funding),
        })
    }

    fn name(&self) -> &str {
        "hyperliquid+taapi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> HyperliquidInfoClient {
        HyperliquidInfoClient::new(&server.uri(), Some("0xabc".to_string()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_positions_and_account_from_clearinghouse_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "clearinghouseState", "user": "0xabc"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "assetPositions": [
                    {"position": {"coin": "ETH", "szi": "-1.5", "entryPx": "2000.0",
                                  "unrealizedPnl": "12.3", "leverage": {"type": "cross", "value": 5},
                                  "liquidationPx": "2500.0"}},
                    {"position": {"coin": "SOL", "szi": "0.0", "entryPx": null,
                                  "unrealizedPnl": "0.0", "liquidationPx": null}}
                ],
                "marginSummary": {"accountValue": "1050.5", "totalMarginUsed": "600"},
                "withdrawable": "450.5"
            })))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let positions = client.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].asset, "ETH");
        assert_eq!(positions[0].side, Side::Short);
        assert_eq!(positions[0].size, Decimal::new(15, 1));
        assert_eq!(positions[0].leverage, Some(Decimal::from(5)));

        let account = ExchangeStateProvider::account(&client).await.unwrap();
        assert_eq!(account.available_capital, Decimal::new(4505, 1));
        assert_eq!(account.account_value, Decimal::new(10505, 1));
    }

    #[tokio::test]
    async fn test_open_orders_classify_triggers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "frontendOpenOrders"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"coin": "BTC", "oid": 7, "side": "A", "sz": "0.1", "limitPx": "70000",
                 "triggerPx": "70000", "orderType": "Take Profit Market", "reduceOnly": true,
                 "isTrigger": true, "timestamp": 1700000000000i64},
                {"coin": "BTC", "oid": 8, "side": "B", "sz": "0.2", "limitPx": "60000",
                 "triggerPx": "0.0", "orderType": "Limit", "reduceOnly": false,
                 "isTrigger": false, "timestamp": 1700000000000i64}
            ])))
            .mount(&server)
            .await;

        let orders = client(&server).await.open_orders().await.unwrap();
        assert_eq!(orders[0].kind, OrderKind::TakeProfit);
        assert_eq!(orders[0].side, Side::Short);
        assert!(orders[0].reduce_only);
        assert_eq!(orders[1].kind, OrderKind::Limit);
        assert_eq!(orders[1].trigger_price, None);
        assert_eq!(orders[1].order_id, "8");
    }

    #[tokio::test]
    async fn test_mid_missing_asset_is_context_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "allMids"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"BTC": "65000.5"})))
            .mount(&server)
            .await;

        let client = client(&server).await;
        assert_eq!(client.mid("BTC").await.unwrap(), Decimal::new(650005, 1));
        let err = client.mid("DOGE").await.unwrap_err();
        assert_eq!(err.asset(), Some("DOGE"));
    }

    #[tokio::test]
    async fn test_asset_ctx_by_universe_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "metaAndAssetCtxs"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"universe": [{"name": "BTC", "szDecimals": 5}, {"name": "ETH", "szDecimals": 4}]},
                [{"funding": "0.00001", "openInterest": "100.0"},
                 {"funding": "-0.00002", "openInterest": "2000.5"}]
            ])))
            .mount(&server)
            .await;

        let ctx = client(&server).await.asset_ctx("ETH").await.unwrap();
        assert_eq!(ctx.funding, Some(-0.00002));
        assert_eq!(ctx.open_interest, Some(2000.5));
    }

    #[tokio::test]
    async fn test_missing_account_means_exchange_unavailable() {
        let client = HyperliquidInfoClient::new("http://localhost:1", None, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            client.positions().await,
            Err(AgentError::ExchangeUnavailable(_))
        ));
    }
}
