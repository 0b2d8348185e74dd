//! Reconciliation - resolve local Active Trade Records against exchange truth
//!
//! Exchange state is authoritative. Every asset that appears locally or
//! remotely is classified into exactly one [`ReconcileState`] and the local
//! record set is brought in line: stale records are purged, unknown
//! positions adopted, divergent records corrected.

use std::collections::BTreeSet;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::diary::{Diary, DiaryEvent};
use crate::error::AgentError;
use crate::providers::ExchangeSnapshot;
use crate::store::ActiveTradeStore;
use crate::types::{ActiveTradeRecord, ExchangePosition, OpenOrder, OrderKind, RecordOrigin};

/// Where one asset stands between local intent and the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    /// Record and exchange agree, or the record is backed by a resting order
    Matched,
    /// Record with no position or order behind it
    LocalOnly,
    /// Position or order the agent has no record of
    RemoteOnly,
    /// Both sides exist but disagree on side or size
    Divergent,
    /// Nothing on either side
    Absent,
}

/// Sizes within a relative 1e-6 of each other are the same position
fn sizes_match(a: Decimal, b: Decimal) -> bool {
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= scale * Decimal::new(1, 6)
}

/// Classify one asset
pub fn classify(
    record: Option<&ActiveTradeRecord>,
    position: Option<&ExchangePosition>,
    orders: &[&OpenOrder],
) -> ReconcileState {
    match (record, position) {
        (None, None) if orders.is_empty() => ReconcileState::Absent,
        (None, _) => ReconcileState::RemoteOnly,
        (Some(_), None) if orders.is_empty() => ReconcileState::LocalOnly,
        (Some(_), None) => ReconcileState::Matched,
        (Some(record), Some(position)) => {
            if record.side == position.side && sizes_match(record.size, position.size) {
                ReconcileState::Matched
            } else {
                ReconcileState::Divergent
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub states: Vec<(String, ReconcileState)>,
    pub purged: Vec<String>,
    pub adopted: Vec<String>,
    pub corrected: Vec<String>,
    pub refreshed: Vec<String>,
    pub errors: Vec<AgentError>,
}

impl ReconcileReport {
    /// Purges, adoptions and corrections; refreshes of matched records don't count
    pub fn actions(&self) -> usize {
        self.purged.len() + self.adopted.len() + self.corrected.len()
    }

    pub fn state_of(&self, asset: &str) -> Option<ReconcileState> {
        self.states
            .iter()
            .find(|(a, _)| a == asset)
            .map(|(_, state)| *state)
    }
}

fn trigger_price(orders: &[&OpenOrder], kind: OrderKind) -> Option<Decimal> {
    orders
        .iter()
        .find(|o| o.kind == kind)
        .and_then(|o| o.trigger_price)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// Bring the record set in line with `snapshot`
    ///
    /// Storage failures are collected per asset; the remaining assets are
    /// still processed.
    pub async fn reconcile(
        &self,
        snapshot: &ExchangeSnapshot,
        store: &mut ActiveTradeStore,
        diary: &Diary,
        cycle: u64,
    ) -> ReconcileReport {
        let mut assets: BTreeSet<String> = store.assets().map(str::to_string).collect();
        assets.extend(
            snapshot
                .positions
                .iter()
                .filter(|p| p.size > Decimal::ZERO)
                .map(|p| p.asset.clone()),
        );
        assets.extend(snapshot.open_orders.iter().map(|o| o.asset.clone()));

        let mut report = ReconcileReport::default();

        for asset in assets {
            let record = store.get(&asset).cloned();
            let position = snapshot.position(&asset);
            let orders: Vec<&OpenOrder> = snapshot.orders_for(&asset).collect();
            let state = classify(record.as_ref(), position, &orders);
            debug!("Reconcile {}: {:?}", asset, state);

            let result = match (state, record) {
                (ReconcileState::Absent, _) => Ok(()),
                (ReconcileState::Matched, Some(record)) => {
                    self.refresh(record, position, &orders, store, &mut report).await
                }
                (ReconcileState::LocalOnly, Some(record)) => {
                    self.purge(record, store, diary, cycle, &mut report).await
                }
                (ReconcileState::RemoteOnly, _) => {
                    self.adopt(&asset, position, &orders, store, diary, cycle, &mut report)
                        .await
                }
                (ReconcileState::Divergent, Some(record)) => match position {
                    Some(position) => {
                        self.correct(record, position, &orders, store, diary, cycle, &mut report)
                            .await
                    }
                    None => Ok(()),
                },
                (_, None) => Ok(()),
            };

            if let Err(e) = result {
                warn!("Reconciliation for {} failed: {}", asset, e);
                report.errors.push(e);
            }
            report.states.push((asset, state));
        }

        info!(
            "Reconciliation complete: {} purged, {} adopted, {} corrected, {} refreshed",
            report.purged.len(),
            report.adopted.len(),
            report.corrected.len(),
            report.refreshed.len()
        );
        report
    }

    async fn refresh(
        &self,
        record: ActiveTradeRecord,
        position: Option<&ExchangePosition>,
        orders: &[&OpenOrder],
        store: &mut ActiveTradeStore,
        report: &mut ReconcileReport,
    ) -> crate::error::Result<()> {
        let mut updated = record.clone();
        if let Some(position) = position {
            updated.entry_price = position.entry_price;
        }
        if let Some(tp) = trigger_price(orders, OrderKind::TakeProfit) {
            updated.tp_price = Some(tp);
        }
        if let Some(sl) = trigger_price(orders, OrderKind::StopLoss) {
            updated.sl_price = Some(sl);
        }

        if updated != record {
            debug!("Refreshing record for {}", updated.asset);
            report.refreshed.push(updated.asset.clone());
            store.upsert(updated).await?;
        }
        Ok(())
    }

    async fn purge(
        &self,
        record: ActiveTradeRecord,
        store: &mut ActiveTradeStore,
        diary: &Diary,
        cycle: u64,
        report: &mut ReconcileReport,
    ) -> crate::error::Result<()> {
        info!(
            "Purging stale record for {} ({} {}): no position or order on exchange",
            record.asset, record.side, record.size
        );
        store.remove(&record.asset).await?;
        diary
            .record(
                cycle,
                DiaryEvent::ReconcilePurge {
                    asset: record.asset.clone(),
                    side: record.side,
                    size: record.size,
                    opened_at: record.opened_at,
                },
            )
            .await;
        report.purged.push(record.asset);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn adopt(
        &self,
        asset: &str,
        position: Option<&ExchangePosition>,
        orders: &[&OpenOrder],
        store: &mut ActiveTradeStore,
        diary: &Diary,
        cycle: u64,
        report: &mut ReconcileReport,
    ) -> crate::error::Result<()> {
        let (side, size, entry_price, from_order) = match position {
            Some(position) => (position.side, position.size, position.entry_price, false),
            None => match orders.iter().find(|o| !o.reduce_only) {
                Some(order) => (
                    order.side,
                    order.size,
                    order
                        .limit_price
                        .or(order.trigger_price)
                        .unwrap_or(Decimal::ZERO),
                    true,
                ),
                None => {
                    warn!(
                        "{} has {} reduce-only orders and no position; not adopting",
                        asset,
                        orders.len()
                    );
                    return Ok(());
                }
            },
        };

        info!("Adopting {} {} {} from exchange", asset, side, size);
        store
            .upsert(ActiveTradeRecord {
                asset: asset.to_string(),
                side,
                size,
                entry_price,
                opened_at: Utc::now(),
                order_ids: orders.iter().map(|o| o.order_id.clone()).collect(),
                tp_price: trigger_price(orders, OrderKind::TakeProfit),
                sl_price: trigger_price(orders, OrderKind::StopLoss),
                exit_plan: String::new(),
                setup_grade: None,
                origin: RecordOrigin::Adopted,
            })
            .await?;
        diary
            .record(
                cycle,
                DiaryEvent::ReconcileAdopt {
                    asset: asset.to_string(),
                    side,
                    size,
                    entry_price,
                    from_order,
                },
            )
            .await;
        report.adopted.push(asset.to_string());
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn correct(
        &self,
        record: ActiveTradeRecord,
        position: &ExchangePosition,
        orders: &[&OpenOrder],
        store: &mut ActiveTradeStore,
        diary: &Diary,
        cycle: u64,
        report: &mut ReconcileReport,
    ) -> crate::error::Result<()> {
        warn!(
            "Correcting {}: local {} {} vs exchange {} {}",
            record.asset, record.side, record.size, position.side, position.size
        );

        let flipped = record.side != position.side;
        let corrected = ActiveTradeRecord {
            side: position.side,
            size: position.size,
            entry_price: position.entry_price,
            opened_at: if flipped { Utc::now() } else { record.opened_at },
            tp_price: trigger_price(orders, OrderKind::TakeProfit).or(if flipped { None } else { record.tp_price }),
            sl_price: trigger_price(orders, OrderKind::StopLoss).or(if flipped { None } else { record.sl_price }),
            ..record.clone()
        };
        store.upsert(corrected).await?;

        diary
            .record(
                cycle,
                DiaryEvent::ReconcileCorrect {
                    asset: record.asset.clone(),
                    local_side: record.side,
                    local_size: record.size,
                    exchange_side: position.side,
                    exchange_size: position.size,
                },
            )
            .await;
        report.corrected.push(record.asset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountSummary, Side};

    fn record(asset: &str, side: Side, size: i64) -> ActiveTradeRecord {
        ActiveTradeRecord {
            asset: asset.to_string(),
            side,
            size: Decimal::from(size),
            entry_price: Decimal::from(100),
            opened_at: Utc::now(),
            order_ids: vec!["1".to_string()],
            tp_price: None,
            sl_price: None,
            exit_plan: "invalidate below 95".to_string(),
            setup_grade: None,
            origin: RecordOrigin::Executed,
        }
    }

    fn position(asset: &str, side: Side, size: Decimal, entry: i64) -> ExchangePosition {
        ExchangePosition {
            asset: asset.to_string(),
            side,
            size,
            entry_price: Decimal::from(entry),
            unrealized_pnl: Decimal::ZERO,
            leverage: None,
            liquidation_price: None,
        }
    }

    fn order(asset: &str, kind: OrderKind, reduce_only: bool, price: i64) -> OpenOrder {
        OpenOrder {
            asset: asset.to_string(),
            order_id: format!("{}-{:?}", asset, kind),
            side: Side::Short,
            size: Decimal::ONE,
            limit_price: (kind == OrderKind::Limit).then(|| Decimal::from(price)),
            trigger_price: (kind != OrderKind::Limit).then(|| Decimal::from(price)),
            kind,
            reduce_only,
            placed_at: Utc::now(),
        }
    }

    fn snapshot(positions: Vec<ExchangePosition>, open_orders: Vec<OpenOrder>) -> ExchangeSnapshot {
        ExchangeSnapshot {
            positions,
            open_orders,
            fills: Vec::new(),
            account: AccountSummary {
                available_capital: Decimal::from(1000),
                account_value: Decimal::from(1000),
                margin_used: Decimal::ZERO,
            },
            fetched_at: Utc::now(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ActiveTradeStore,
        diary: Diary,
    }

    async fn fixture(records: Vec<ActiveTradeRecord>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ActiveTradeStore::load(dir.path().join("active_trades.jsonl"))
            .await
            .unwrap();
        for record in records {
            store.upsert(record).await.unwrap();
        }
        let diary = Diary::new(dir.path().join("diary.jsonl"));
        Fixture {
            _dir: dir,
            store,
            diary,
        }
    }

    fn kinds(diary: &Diary) -> Vec<&'static str> {
        diary
            .entries()
            .unwrap()
            .map(|e| e.unwrap().event.kind())
            .collect()
    }

    #[test]
    fn test_classify_covers_all_states() {
        let rec = record("BTC", Side::Long, 1);
        let pos = position("BTC", Side::Long, Decimal::ONE, 100);
        let short = position("BTC", Side::Short, Decimal::ONE, 100);
        let tp = order("BTC", OrderKind::TakeProfit, true, 120);

        assert_eq!(classify(None, None, &[]), ReconcileState::Absent);
        assert_eq!(classify(None, Some(&pos), &[]), ReconcileState::RemoteOnly);
        assert_eq!(classify(None, None, &[&tp]), ReconcileState::RemoteOnly);
        assert_eq!(classify(Some(&rec), None, &[]), ReconcileState::LocalOnly);
        assert_eq!(classify(Some(&rec), None, &[&tp]), ReconcileState::Matched);
        assert_eq!(classify(Some(&rec), Some(&pos), &[]), ReconcileState::Matched);
        assert_eq!(classify(Some(&rec), Some(&short), &[]), ReconcileState::Divergent);
    }

    #[test]
    fn test_size_tolerance_is_relative() {
        let rec = record("BTC", Side::Long, 1000);
        let close = position("BTC", Side::Long, Decimal::new(10_000_000_001, 7), 100);
        let far = position("BTC", Side::Long, Decimal::new(1001, 0), 100);
        assert_eq!(classify(Some(&rec), Some(&close), &[]), ReconcileState::Matched);
        assert_eq!(classify(Some(&rec), Some(&far), &[]), ReconcileState::Divergent);
    }

    #[tokio::test]
    async fn test_stale_record_is_purged_once() {
        let mut fx = fixture(vec![record("ETH", Side::Long, 1)]).await;
        let exchange = snapshot(vec![], vec![]);

        let report = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 1)
            .await;
        assert_eq!(report.purged, vec!["ETH"]);
        assert_eq!(report.state_of("ETH"), Some(ReconcileState::LocalOnly));
        assert!(fx.store.get("ETH").is_none());
        assert_eq!(kinds(&fx.diary), vec!["reconcile-purge"]);

        let again = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 2)
            .await;
        assert_eq!(again.actions(), 0);
        assert_eq!(kinds(&fx.diary).len(), 1);

        let reloaded = ActiveTradeStore::load(fx.store.path()).await.unwrap();
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn test_failed_purge_is_retried_next_pass() {
        let mut fx = fixture(vec![record("ETH", Side::Long, 1)]).await;
        let exchange = snapshot(vec![], vec![]);
        let blocker = fx.store.path().with_extension("jsonl.tmp");
        tokio::fs::create_dir(&blocker).await.unwrap();

        let failed = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 1)
            .await;
        assert!(failed.purged.is_empty());
        assert_eq!(failed.errors.len(), 1);
        assert!(fx.store.get("ETH").is_some());
        assert!(kinds(&fx.diary).is_empty());

        tokio::fs::remove_dir(&blocker).await.unwrap();
        let retried = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 2)
            .await;
        assert_eq!(retried.purged, vec!["ETH"]);
        assert_eq!(kinds(&fx.diary), vec!["reconcile-purge"]);
        assert!(ActiveTradeStore::load(fx.store.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_position_is_adopted_with_triggers() {
        let mut fx = fixture(vec![]).await;
        let exchange = snapshot(
            vec![position("SOL", Side::Long, Decimal::from(3), 150)],
            vec![
                order("SOL", OrderKind::TakeProfit, true, 180),
                order("SOL", OrderKind::StopLoss, true, 140),
            ],
        );

        let report = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 1)
            .await;
        assert_eq!(report.adopted, vec!["SOL"]);

        let adopted = fx.store.get("SOL").unwrap();
        assert_eq!(adopted.origin, RecordOrigin::Adopted);
        assert_eq!(adopted.size, Decimal::from(3));
        assert_eq!(adopted.entry_price, Decimal::from(150));
        assert_eq!(adopted.tp_price, Some(Decimal::from(180)));
        assert_eq!(adopted.sl_price, Some(Decimal::from(140)));
        assert_eq!(adopted.order_ids.len(), 2);

        let again = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 2)
            .await;
        assert_eq!(again.actions(), 0);
        assert_eq!(again.state_of("SOL"), Some(ReconcileState::Matched));
        assert_eq!(kinds(&fx.diary), vec!["reconcile-adopt"]);
    }

    #[tokio::test]
    async fn test_pending_entry_order_is_adopted() {
        let mut fx = fixture(vec![]).await;
        let exchange = snapshot(vec![], vec![order("BTC", OrderKind::Limit, false, 60_000)]);

        let report = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 1)
            .await;
        assert_eq!(report.adopted, vec!["BTC"]);
        assert_eq!(fx.store.get("BTC").unwrap().entry_price, Decimal::from(60_000));

        let entries: Vec<_> = fx.diary.entries().unwrap().map(|e| e.unwrap()).collect();
        assert!(matches!(
            entries[0].event,
            DiaryEvent::ReconcileAdopt { from_order: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_orphan_reduce_only_orders_are_not_adopted() {
        let mut fx = fixture(vec![]).await;
        let exchange = snapshot(vec![], vec![order("ETH", OrderKind::StopLoss, true, 90)]);

        let report = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 1)
            .await;
        assert_eq!(report.state_of("ETH"), Some(ReconcileState::RemoteOnly));
        assert!(report.adopted.is_empty());
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_divergent_record_is_corrected() {
        let original = record("BTC", Side::Long, 2);
        let opened_at = original.opened_at;
        let mut fx = fixture(vec![original]).await;
        let exchange = snapshot(vec![position("BTC", Side::Long, Decimal::ONE, 101)], vec![]);

        let report = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 1)
            .await;
        assert_eq!(report.corrected, vec!["BTC"]);

        let corrected = fx.store.get("BTC").unwrap();
        assert_eq!(corrected.size, Decimal::ONE);
        assert_eq!(corrected.entry_price, Decimal::from(101));
        assert_eq!(corrected.opened_at, opened_at);
        assert_eq!(corrected.exit_plan, "invalidate below 95");
        assert_eq!(kinds(&fx.diary), vec!["reconcile-correct"]);
    }

    #[tokio::test]
    async fn test_matched_record_refreshes_silently() {
        let mut fx = fixture(vec![record("ETH", Side::Long, 1)]).await;
        let exchange = snapshot(
            vec![position("ETH", Side::Long, Decimal::ONE, 102)],
            vec![order("ETH", OrderKind::StopLoss, true, 95)],
        );

        let report = Reconciler::new()
            .reconcile(&exchange, &mut fx.store, &fx.diary, 1)
            .await;
        assert_eq!(report.actions(), 0);
        assert_eq!(report.refreshed, vec!["ETH"]);

        let refreshed = fx.store.get("ETH").unwrap();
        assert_eq!(refreshed.entry_price, Decimal::from(102));
        assert_eq!(refreshed.sl_price, Some(Decimal::from(95)));
        assert!(kinds(&fx.diary).is_empty());
    }
}
