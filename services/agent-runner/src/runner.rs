//! Agent Runtime - drives decision cycles on a fixed interval
//!
//! One cycle: exchange snapshot, context, decision, gate, execution, then a
//! fresh snapshot for reconciliation. Per-asset failures are recorded and the
//! other assets carry on; a missing exchange snapshot aborts the cycle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, TradingMode};
use crate::context::{ContextBuilder, ContextLimits, DecisionContext};
use crate::decision::{DecisionEngine, DecisionSource};
use crate::diary::{Diary, DiaryEvent};
use crate::error::AgentError;
use crate::executor::{ExecutionOutcome, TradeExecutor};
use crate::gate::{GateInputs, GateOutcome, RiskGate};
use crate::llm::DecisionModel;
use crate::providers::{ExchangeSnapshot, ExchangeStateProvider, ExecutionLayer, MarketSnapshotProvider};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::store::ActiveTradeStore;
use crate::types::{ActiveTradeRecord, RecordOrigin, TradeAction, TradeDecision};

/// Fills older than this are left out of the context
const FILL_LOOKBACK_HOURS: i64 = 24;

/// What happened in one cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    /// Assets that made it into the decision context
    pub assets: Vec<String>,
    /// Post-gate decisions
    pub decisions: Vec<TradeDecision>,
    pub decision_source: Option<DecisionSource>,
    pub model_invocations: u32,
    pub orders_placed: usize,
    pub errors: Vec<AgentError>,
    pub reconcile: Option<ReconcileReport>,
    /// Set when a cycle-fatal error stopped the cycle early
    pub aborted: Option<String>,
}

impl CycleReport {
    pub fn reconcile_actions(&self) -> usize {
        self.reconcile.as_ref().map(ReconcileReport::actions).unwrap_or(0)
    }

    pub fn decision_for(&self, asset: &str) -> Option<&TradeDecision> {
        self.decisions.iter().find(|d| d.asset == asset)
    }
}

pub struct AgentRuntime {
    config: AgentConfig,
    exchange: Arc<dyn ExchangeStateProvider>,
    context_builder: ContextBuilder,
    engine: DecisionEngine,
    gate: RiskGate,
    executor: TradeExecutor,
    reconciler: Reconciler,
    diary: Arc<Diary>,
    store: ActiveTradeStore,
    cycle: u64,
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        market: Arc<dyn MarketSnapshotProvider>,
        exchange: Arc<dyn ExchangeStateProvider>,
        execution: Arc<dyn ExecutionLayer>,
        model: Arc<dyn DecisionModel>,
        diary: Arc<Diary>,
        store: ActiveTradeStore,
    ) -> Self {
        let limits = ContextLimits {
            max_chars: config.max_context_chars,
            ..ContextLimits::default()
        };

        Self {
            context_builder: ContextBuilder::new(market, limits),
            engine: DecisionEngine::new(model, config.llm.structured_output),
            gate: RiskGate::new(&config.risk),
            executor: TradeExecutor::new(execution, config.risk.size_decimals),
            reconciler: Reconciler::new(),
            exchange,
            diary,
            store,
            config,
            cycle: 0,
        }
    }

    pub fn store(&self) -> &ActiveTradeStore {
        &self.store
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycle
    }

    /// Run cycles on the configured interval until `shutdown` resolves
    ///
    /// A cycle that has started always runs through reconciliation before
    /// the shutdown is honoured.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        match self.config.trading_mode {
            TradingMode::Paper => info!("Running in PAPER trading mode"),
            TradingMode::Live => warn!("Running in LIVE trading mode - real funds at risk"),
        }
        info!(
            "Agent starting: assets={:?} interval={:?}",
            self.config.assets, self.config.interval
        );

        tokio::pin!(shutdown);
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested after {} cycles", self.cycle);
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if let Some(reason) = &report.aborted {
                        warn!("Cycle {} aborted: {}", report.cycle, reason);
                    }
                }
            }
        }
    }

    /// Run a single cycle across all configured assets
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let cycle = self.cycle;
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };
        info!("Cycle {} starting", cycle);

        let since = Utc::now() - chrono::Duration::hours(FILL_LOOKBACK_HOURS);
        let snapshot = match ExchangeSnapshot::fetch(self.exchange.as_ref(), since).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Cycle {}: exchange state unavailable: {}", cycle, e);
                report.aborted = Some(e.to_string());
                self.fail(&mut report, e).await;
                self.summarize(&report).await;
                return report;
            }
        };

        let recent_diary = self
            .diary
            .tail(ContextLimits::default().diary_tail)
            .await
            .unwrap_or_else(|e| {
                warn!("Could not read diary tail: {}", e);
                Vec::new()
            });
        let built = self
            .context_builder
            .build(cycle, &self.config.assets, &snapshot, &self.store, recent_diary)
            .await;
        for failure in built.failures {
            self.fail(&mut report, failure).await;
        }
        let context = built.context;
        report.assets = context.assets().to_vec();

        if report.assets.is_empty() {
            warn!("Cycle {}: no asset has usable market data; skipping decisions", cycle);
        } else {
            self.decide_and_execute(&context, &snapshot, &mut report).await;
        }

        self.reconcile(&mut report).await;
        self.summarize(&report).await;

        info!(
            "Cycle {} complete: {} decisions, {} orders, {} errors, {} reconcile actions",
            cycle,
            report.decisions.len(),
            report.orders_placed,
            report.errors.len(),
            report.reconcile_actions()
        );
        report
    }

    async fn decide_and_execute(
        &mut self,
        context: &DecisionContext,
        snapshot: &ExchangeSnapshot,
        report: &mut CycleReport,
    ) {
        let cycle = report.cycle;
        let outcome = self.engine.decide(context).await;
        report.decision_source = Some(outcome.source);
        report.model_invocations = outcome.invocations;
        if !outcome.reasoning.is_empty() {
            debug!("Model reasoning: {}", outcome.reasoning);
        }
        for failure in outcome.failures {
            self.fail(report, failure).await;
        }
        let marks: HashMap<String, Decimal> = context
            .market_data
            .iter()
            .map(|a| (a.asset.clone(), a.mid_price))
            .collect();
        let exposure = snapshot.exposure(&marks);
        let inputs = GateInputs {
            available_capital: snapshot.account.available_capital,
            leverage: self.config.risk.max_leverage,
            exposure: &exposure,
            asset_order: &self.config.assets,
        };

        let gated = match self
            .gate
            .apply(outcome.decisions.clone(), &inputs, &self.diary, cycle)
            .await
        {
            Ok(gated) => gated,
            Err(e) => {
                error!("Cycle {}: gate rejected configuration, skipping execution: {}", cycle, e);
                report.decisions = outcome
                    .decisions
                    .into_iter()
                    .map(|d| d.into_hold("gate configuration error"))
                    .collect();
                self.fail(report, e).await;
                return;
            }
        };

        self.execute(&gated, &marks, snapshot, report).await;
        report.decisions = gated.into_iter().map(|o| o.decision).collect();
    }

    async fn execute(
        &mut self,
        gated: &[GateOutcome],
        marks: &HashMap<String, Decimal>,
        snapshot: &ExchangeSnapshot,
        report: &mut CycleReport,
    ) {
        let cycle = report.cycle;
        let actionable: Vec<(&TradeDecision, Decimal)> = gated
            .iter()
            .map(|o| &o.decision)
            .filter(|d| d.action != TradeAction::Hold)
            .filter_map(|d| marks.get(&d.asset).map(|mid| (d, *mid)))
            .collect();

        let executor = &self.executor;
        let results = join_all(actionable.iter().map(|(decision, mid)| {
            executor.execute(decision, *mid, snapshot.position(&decision.asset))
        }))
        .await;

        for ((decision, mid), result) in actionable.into_iter().zip(results) {
            match result {
                Ok(Some(outcome)) => {
                    report.orders_placed += 1;
                    self.record_execution(cycle, decision, &outcome).await;
                    if decision.action.open_side().is_some() {
                        if let Err(e) = self.open_record(decision, mid, &outcome).await {
                            self.fail(report, e).await;
                        }
                    }
                }
                Ok(None) => debug!("{} {} needs no order", decision.asset, decision.action),
                Err(e) => self.fail(report, e).await,
            }
        }
    }

    async fn record_execution(&self, cycle: u64, decision: &TradeDecision, outcome: &ExecutionOutcome) {
        self.diary
            .record(
                cycle,
                DiaryEvent::Execution {
                    asset: decision.asset.clone(),
                    action: decision.action,
                    side: outcome.request.side,
                    size: outcome.request.size,
                    reduce_only: outcome.request.reduce_only,
                    order_ids: outcome.ack.order_ids.clone(),
                    filled_size: outcome.ack.filled_size,
                    avg_price: outcome.ack.avg_price,
                },
            )
            .await;
    }

    /// Record local intent for a successful open
    async fn open_record(
        &mut self,
        decision: &TradeDecision,
        mid: Decimal,
        outcome: &ExecutionOutcome,
    ) -> crate::error::Result<()> {
        let filled = if outcome.ack.filled_size > Decimal::ZERO {
            outcome.ack.filled_size
        } else {
            outcome.request.size
        };
        let side = outcome.request.side;

        let record = match self.store.get(&decision.asset) {
            Some(existing) if existing.side == side => ActiveTradeRecord {
                size: existing.size + filled,
                order_ids: [existing.order_ids.clone(), outcome.ack.order_ids.clone()].concat(),
                tp_price: decision.tp_price.or(existing.tp_price),
                sl_price: decision.sl_price.or(existing.sl_price),
                exit_plan: decision.exit_plan.clone(),
                setup_grade: decision.setup_grade.or(existing.setup_grade),
                ..existing.clone()
            },
            _ => ActiveTradeRecord {
                asset: decision.asset.clone(),
                side,
                size: filled,
                entry_price: outcome.ack.avg_price.unwrap_or(mid),
                opened_at: Utc::now(),
                order_ids: outcome.ack.order_ids.clone(),
                tp_price: decision.tp_price,
                sl_price: decision.sl_price,
                exit_plan: decision.exit_plan.clone(),
                setup_grade: decision.setup_grade,
                origin: RecordOrigin::Executed,
            },
        };
        self.store.upsert(record).await
    }

    async fn reconcile(&mut self, report: &mut CycleReport) {
        let since = Utc::now() - chrono::Duration::hours(FILL_LOOKBACK_HOURS);
        match ExchangeSnapshot::fetch(self.exchange.as_ref(), since).await {
            Ok(snapshot) => {
                let result = self
                    .reconciler
                    .reconcile(&snapshot, &mut self.store, &self.diary, report.cycle)
                    .await;
                for e in &result.errors {
                    self.diary.record_error(report.cycle, e).await;
                }
                report.reconcile = Some(result);
            }
            Err(e) => {
                warn!("Skipping reconciliation for cycle {}: {}", report.cycle, e);
                self.fail(report, AgentError::Reconciliation(e.to_string())).await;
            }
        }
    }

    async fn fail(&self, report: &mut CycleReport, err: AgentError) {
        self.diary.record_error(report.cycle, &err).await;
        report.errors.push(err);
    }

    async fn summarize(&self, report: &CycleReport) {
        let errors = report.errors.len()
            + report.reconcile.as_ref().map(|r| r.errors.len()).unwrap_or(0);
        self.diary
            .record(
                report.cycle,
                DiaryEvent::CycleSummary {
                    assets: report.assets.clone(),
                    decisions: report.decisions.len(),
                    orders_placed: report.orders_placed,
                    errors,
                    reconcile_actions: report.reconcile_actions(),
                    decision_source: report.decision_source,
                    aborted: report.aborted.clone(),
                },
            )
            .await;
    }
}
