//! Paper exchange - in-process positions, margin and trigger orders
//!
//! Implements both the exchange state and execution seams so paper mode
//! runs the exact same cycle as live mode. Fills happen at the request's
//! reference price; TP/SL are kept as reduce-only trigger orders that fire
//! when a new mark crosses them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::providers::{
    ExchangeStateProvider, ExecutionLayer, IndicatorSpec, MarketSnapshotProvider, OrderAck,
    OrderRequest,
};
use crate::types::{
    AccountSummary, ExchangePosition, Fill, MarketSnapshot, OpenOrder, OrderKind, Side,
};

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Side,
    size: Decimal,
    entry_price: Decimal,
}

#[derive(Debug, Default)]
struct PaperBook {
    /// Collateral including realized PnL
    balance: Decimal,
    positions: HashMap<String, PaperPosition>,
    orders: Vec<OpenOrder>,
    fills: Vec<Fill>,
    marks: HashMap<String, Decimal>,
}

impl PaperBook {
    fn mark_for(&self, asset: &str, fallback: Decimal) -> Decimal {
        self.marks.get(asset).copied().unwrap_or(fallback)
    }

    fn margin_used(&self, leverage: Decimal) -> Decimal {
        self.positions
            .iter()
            .map(|(asset, p)| p.size * self.mark_for(asset, p.entry_price) / leverage)
            .sum()
    }

    fn unrealized(&self) -> Decimal {
        self.positions
            .iter()
            .map(|(asset, p)| {
                (self.mark_for(asset, p.entry_price) - p.entry_price) * p.size * p.side.sign()
            })
            .sum()
    }

    fn record_fill(&mut self, asset: &str, side: Side, size: Decimal, price: Decimal, closed_pnl: Decimal) -> String {
        let order_id = Uuid::new_v4().to_string();
        self.fills.push(Fill {
            asset: asset.to_string(),
            order_id: order_id.clone(),
            side,
            size,
            price,
            fee: Decimal::ZERO,
            closed_pnl,
            timestamp: Utc::now(),
        });
        order_id
    }

    /// Reduce a position, realizing PnL; returns the size actually closed
    fn reduce(&mut self, asset: &str, size: Decimal, price: Decimal) -> Decimal {
        let Some(pos) = self.positions.get_mut(asset) else {
            return Decimal::ZERO;
        };
        let closed = size.min(pos.size);
        let pnl = (price - pos.entry_price) * closed * pos.side.sign();
        pos.size -= closed;
        let side = pos.side;
        self.balance += pnl;

        info!("Paper reduce: {} {} {} @ {} | Realized PnL: {}", asset, side, closed, price, pnl);

        if pos.size <= Decimal::ZERO {
            self.positions.remove(asset);
            self.orders.retain(|o| o.asset != asset);
        }
        closed
    }

    fn set_trigger(&mut self, asset: &str, kind: OrderKind, price: Option<Decimal>) -> Option<String> {
        let price = price?;
        let pos = self.positions.get(asset)?.clone();
        self.orders.retain(|o| !(o.asset == asset && o.kind == kind));
        let order_id = Uuid::new_v4().to_string();
        self.orders.push(OpenOrder {
            asset: asset.to_string(),
            order_id: order_id.clone(),
            side: pos.side.opposite(),
            size: pos.size,
            limit_price: None,
            trigger_price: Some(price),
            kind,
            reduce_only: true,
            placed_at: Utc::now(),
        });
        Some(order_id)
    }

    fn resize_triggers(&mut self, asset: &str) {
        if let Some(size) = self.positions.get(asset).map(|p| p.size) {
            for order in self.orders.iter_mut().filter(|o| o.asset == asset && o.reduce_only) {
                order.size = size;
            }
        }
    }
}

/// Simulated exchange for paper trading
pub struct PaperExchange {
    leverage: Decimal,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(starting_balance: Decimal, leverage: Decimal) -> Self {
        info!(
            "Paper exchange initialized: balance={}, leverage={}x",
            starting_balance, leverage
        );
        Self {
            leverage,
            book: Mutex::new(PaperBook {
                balance: starting_balance,
                ..Default::default()
            }),
        }
    }

    /// Update the mark price and fire any crossed TP/SL trigger
    pub async fn mark(&self, asset: &str, price: Decimal) {
        let mut book = self.book.lock().await;
        book.marks.insert(asset.to_string(), price);

        let Some(pos) = book.positions.get(asset).cloned() else {
            return;
        };
        let fired = book.orders.iter().find(|o| {
            o.asset == asset
                && o.trigger_price.map_or(false, |trigger| match (pos.side, o.kind) {
                    (Side::Long, OrderKind::TakeProfit) | (Side::Short, OrderKind::StopLoss) => {
                        price >= trigger
                    }
                    (Side::Long, OrderKind::StopLoss) | (Side::Short, OrderKind::TakeProfit) => {
                        price <= trigger
                    }
                    (_, OrderKind::Limit) => false,
                })
        });

        if let Some(order) = fired.cloned() {
            info!("Paper trigger fired: {} {:?} @ {}", asset, order.kind, price);
            let pnl_before = book.balance;
            book.reduce(asset, pos.size, price);
            let pnl = book.balance - pnl_before;
            book.record_fill(asset, pos.side.opposite(), pos.size, price, pnl);
        }
    }

    /// Place a position directly, as if opened outside the agent
    pub async fn inject_position(&self, asset: &str, side: Side, size: Decimal, entry_price: Decimal) {
        let mut book = self.book.lock().await;
        book.positions.insert(
            asset.to_string(),
            PaperPosition {
                side,
                size,
                entry_price,
            },
        );
        book.marks.entry(asset.to_string()).or_insert(entry_price);
    }

    /// Flatten a position without a fill, as if liquidated or closed externally
    pub async fn clear_position(&self, asset: &str) {
        let mut book = self.book.lock().await;
        book.positions.remove(asset);
        book.orders.retain(|o| o.asset != asset);
    }

    /// Rest a plain limit order, as if placed outside the agent
    pub async fn inject_order(&self, asset: &str, side: Side, size: Decimal, limit_price: Decimal) -> String {
        let mut book = self.book.lock().await;
        let order_id = Uuid::new_v4().to_string();
        book.orders.push(OpenOrder {
            asset: asset.to_string(),
            order_id: order_id.clone(),
            side,
            size,
            limit_price: Some(limit_price),
            trigger_price: None,
            kind: OrderKind::Limit,
            reduce_only: false,
            placed_at: Utc::now(),
        });
        order_id
    }

    pub async fn balance(&self) -> Decimal {
        self.book.lock().await.balance
    }
}

#[async_trait::async_trait]
impl ExchangeStateProvider for PaperExchange {
    async fn positions(&self) -> Result<Vec<ExchangePosition>> {
        let book = self.book.lock().await;
        let mut positions: Vec<ExchangePosition> = book
            .positions
            .iter()
            .map(|(asset, p)| {
                let mark = book.mark_for(asset, p.entry_price);
                ExchangePosition {
                    asset: asset.clone(),
                    side: p.side,
                    size: p.size,
                    entry_price: p.entry_price,
                    unrealized_pnl: (mark - p.entry_price) * p.size * p.side.sign(),
                    leverage: Some(self.leverage),
                    liquidation_price: None,
                }
            })
            .collect();
        positions.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(positions)
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>> {
        Ok(self.book.lock().await.orders.clone())
    }

    async fn fills(&self, since: DateTime<Utc>) -> Result<Vec<Fill>> {
        let book = self.book.lock().await;
        Ok(book
            .fills
            .iter()
            .filter(|f| f.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn account(&self) -> Result<AccountSummary> {
        let book = self.book.lock().await;
        let margin_used = book.margin_used(self.leverage);
        let account_value = book.balance + book.unrealized();
        Ok(AccountSummary {
            available_capital: (account_value - margin_used).max(Decimal::ZERO),
            account_value,
            margin_used,
        })
    }
}

#[async_trait::async_trait]
impl ExecutionLayer for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        if request.size <= Decimal::ZERO || request.reference_price <= Decimal::ZERO {
            return Err(AgentError::execution(
                &request.asset,
                "size and reference price must be positive",
            ));
        }

        let mut book = self.book.lock().await;
        let asset = request.asset.as_str();
        let price = request.reference_price;
        book.marks.insert(asset.to_string(), price);

        let existing = book.positions.get(asset).cloned();

        if request.reduce_only {
            match existing {
                Some(pos) if pos.side == request.side.opposite() => {
                    let before = book.balance;
                    let closed = book.reduce(asset, request.size, price);
                    let pnl = book.balance - before;
                    let order_id = book.record_fill(asset, request.side, closed, price, pnl);
                    book.resize_triggers(asset);
                    return Ok(OrderAck {
                        order_ids: vec![order_id],
                        filled_size: closed,
                        avg_price: Some(price),
                    });
                }
                _ => {
                    return Err(AgentError::execution(asset, "no position to reduce"));
                }
            }
        }

        // Opposite-side exposure nets first; only the remainder needs margin
        let mut remaining = request.size;
        let mut realized = Decimal::ZERO;
        if let Some(pos) = existing.as_ref().filter(|p| p.side != request.side) {
            let before = book.balance;
            remaining -= book.reduce(asset, remaining.min(pos.size), price);
            realized = book.balance - before;
        }

        if remaining > Decimal::ZERO {
            let required = remaining * price / self.leverage;
            let available = book.balance + book.unrealized() - book.margin_used(self.leverage);
            if required > available {
                return Err(AgentError::execution(
                    asset,
                    format!("insufficient margin: required {} available {}", required, available),
                ));
            }

            match book.positions.get_mut(asset) {
                Some(pos) => {
                    let total = pos.size + remaining;
                    pos.entry_price = (pos.size * pos.entry_price + remaining * price) / total;
                    pos.size = total;
                    debug!("Paper add: {} size={} avg={}", asset, pos.size, pos.entry_price);
                }
                None => {
                    book.positions.insert(
                        asset.to_string(),
                        PaperPosition {
                            side: request.side,
                            size: remaining,
                            entry_price: price,
                        },
                    );
                    info!("Paper open: {} {} {} @ {}", asset, request.side, remaining, price);
                }
            }
        }

        let mut order_ids = vec![book.record_fill(asset, request.side, request.size, price, realized)];
        book.resize_triggers(asset);
        order_ids.extend(book.set_trigger(asset, OrderKind::TakeProfit, request.tp_price));
        order_ids.extend(book.set_trigger(asset, OrderKind::StopLoss, request.sl_price));

        Ok(OrderAck {
            order_ids,
            filled_size: request.size,
            avg_price: Some(price),
        })
    }
}

/// Market provider decorator that feeds mids into the paper exchange
pub struct MarkingMarketProvider {
    inner: Arc<dyn MarketSnapshotProvider>,
    exchange: Arc<PaperExchange>,
}

impl MarkingMarketProvider {
    pub fn new(inner: Arc<dyn MarketSnapshotProvider>, exchange: Arc<PaperExchange>) -> Self {
        Self { inner, exchange }
    }
}

#[async_trait::async_trait]
impl MarketSnapshotProvider for MarkingMarketProvider {
    async fn fetch(&self, asset: &str, spec: &IndicatorSpec) -> Result<MarketSnapshot> {
        let snapshot = self.inner.fetch(asset, spec).await?;
        self.exchange.mark(asset, snapshot.mid_price).await;
        Ok(snapshot)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(asset: &str, side: Side, size: i64, price: i64) -> OrderRequest {
        OrderRequest {
            asset: asset.to_string(),
            side,
            size: Decimal::from(size),
            reference_price: Decimal::from(price),
            tp_price: None,
            sl_price: None,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn test_open_reserves_margin() {
        let exchange = PaperExchange::new(Decimal::from(1000), Decimal::from(5));
        exchange.place_order(&order("BTC", Side::Long, 4, 100)).await.unwrap();

        let account = exchange.account().await.unwrap();
        assert_eq!(account.margin_used, Decimal::from(80));
        assert_eq!(account.available_capital, Decimal::from(920));

        let positions = exchange.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Long);
        assert_eq!(positions[0].size, Decimal::from(4));
    }

    #[tokio::test]
    async fn test_add_averages_entry() {
        let exchange = PaperExchange::new(Decimal::from(10_000), Decimal::from(5));
        exchange.place_order(&order("ETH", Side::Long, 1, 100)).await.unwrap();
        exchange.place_order(&order("ETH", Side::Long, 1, 200)).await.unwrap();

        let positions = exchange.positions().await.unwrap();
        assert_eq!(positions[0].size, Decimal::from(2));
        assert_eq!(positions[0].entry_price, Decimal::from(150));
    }

    #[tokio::test]
    async fn test_reduce_only_realizes_pnl_and_drops_triggers() {
        let exchange = PaperExchange::new(Decimal::from(1000), Decimal::from(5));
        let mut open = order("SOL", Side::Short, 10, 100);
        open.sl_price = Some(Decimal::from(110));
        let ack = exchange.place_order(&open).await.unwrap();
        assert_eq!(ack.order_ids.len(), 2);
        assert_eq!(exchange.open_orders().await.unwrap().len(), 1);

        let mut close = order("SOL", Side::Long, 10, 90);
        close.reduce_only = true;
        exchange.place_order(&close).await.unwrap();

        assert!(exchange.positions().await.unwrap().is_empty());
        assert!(exchange.open_orders().await.unwrap().is_empty());
        assert_eq!(exchange.balance().await, Decimal::from(1100));
    }

    #[tokio::test]
    async fn test_reduce_only_without_position_fails() {
        let exchange = PaperExchange::new(Decimal::from(1000), Decimal::from(5));
        let mut close = order("BTC", Side::Short, 1, 100);
        close.reduce_only = true;
        let err = exchange.place_order(&close).await.unwrap_err();
        assert_eq!(err.asset(), Some("BTC"));
    }

    #[tokio::test]
    async fn test_insufficient_margin_rejected() {
        let exchange = PaperExchange::new(Decimal::from(50), Decimal::from(5));
        let err = exchange
            .place_order(&order("BTC", Side::Long, 4, 100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("insufficient margin"));
        assert!(exchange.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_loss_fires_on_mark() {
        let exchange = PaperExchange::new(Decimal::from(1000), Decimal::from(5));
        let mut open = order("ETH", Side::Long, 2, 100);
        open.tp_price = Some(Decimal::from(120));
        open.sl_price = Some(Decimal::from(95));
        exchange.place_order(&open).await.unwrap();

        exchange.mark("ETH", Decimal::from(97)).await;
        assert_eq!(exchange.positions().await.unwrap().len(), 1);

        exchange.mark("ETH", Decimal::from(94)).await;
        assert!(exchange.positions().await.unwrap().is_empty());
        assert!(exchange.open_orders().await.unwrap().is_empty());
        assert_eq!(exchange.balance().await, Decimal::from(988));

        let fills = exchange.fills(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[1].closed_pnl, Decimal::from(-12));
    }
}
