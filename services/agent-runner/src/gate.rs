//! Risk/Collateral Gate
//!
//! Walks the cycle's decisions in declared asset order and charges the margin
//! of every new or increased position against the capital left over from
//! earlier assets. Oversized requests are scaled down; requests that cannot be
//! funded become hold. Closes and reductions always pass.

use std::collections::HashMap;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RiskSettings;
use crate::diary::{Diary, DiaryEvent};
use crate::error::{AgentError, Result};
use crate::providers::Exposure;
use crate::types::{TradeAction, TradeDecision};

/// One decision after the gate, with the values that went into it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub decision: TradeDecision,
    pub action_before: TradeAction,
    /// Notional the decision asked to add
    pub requested_notional: Decimal,
    /// Notional allowed through after scaling
    pub approved_notional: Decimal,
    pub required_margin: Decimal,
    /// Capital left for later assets after this decision
    pub remaining_capital: Decimal,
    pub reason: Option<String>,
}

impl GateOutcome {
    pub fn was_modified(&self) -> bool {
        self.reason.is_some()
    }

    fn to_event(&self) -> DiaryEvent {
        DiaryEvent::Gate {
            asset: self.decision.asset.clone(),
            action_before: self.action_before,
            action_after: self.decision.action,
            setup_grade: self.decision.setup_grade,
            requested_notional: self.requested_notional,
            approved_notional: self.approved_notional,
            required_margin: self.required_margin,
            remaining_capital: self.remaining_capital,
            allocation_fraction: self.decision.allocation_fraction.unwrap_or(0.0),
            reason: self.reason.clone(),
        }
    }
}

/// Capital picture the gate allocates against
#[derive(Debug, Clone, Copy)]
pub struct GateInputs<'a> {
    pub available_capital: Decimal,
    pub leverage: Decimal,
    pub exposure: &'a HashMap<String, Exposure>,
    /// Declared asset order; assets missing from it go last
    pub asset_order: &'a [String],
}

#[derive(Debug, Clone)]
pub struct RiskGate {
    min_remaining_capital: Decimal,
    min_order_notional: Decimal,
}

impl RiskGate {
    pub fn new(settings: &RiskSettings) -> Self {
        Self {
            min_remaining_capital: settings.min_remaining_capital,
            min_order_notional: settings.min_order_notional,
        }
    }

    /// Gate decisions without side effects
    pub fn evaluate(&self, decisions: Vec<TradeDecision>, inputs: &GateInputs<'_>) -> Result<Vec<GateOutcome>> {
        let GateInputs {
            available_capital,
            leverage,
            exposure,
            asset_order,
        } = *inputs;

        if leverage <= Decimal::ZERO {
            return Err(AgentError::GateConfig(format!(
                "leverage limit must be positive, got {}",
                leverage
            )));
        }
        if available_capital <= Decimal::ZERO {
            return Err(AgentError::GateConfig(format!(
                "available capital must be positive, got {}",
                available_capital
            )));
        }

        let mut ordered = decisions;
        ordered.sort_by_key(|d| {
            asset_order
                .iter()
                .position(|a| *a == d.asset)
                .unwrap_or(asset_order.len())
        });

        let mut committed = Decimal::ZERO;
        let outcomes = ordered
            .into_iter()
            .map(|decision| {
                let outcome = self.gate_one(
                    decision,
                    available_capital,
                    available_capital - committed,
                    leverage,
                    exposure,
                );
                committed += outcome.required_margin;
                outcome
            })
            .collect();

        Ok(outcomes)
    }

    /// Evaluate and write one gate entry per decision to the diary
    pub async fn apply(
        &self,
        decisions: Vec<TradeDecision>,
        inputs: &GateInputs<'_>,
        diary: &Diary,
        cycle: u64,
    ) -> Result<Vec<GateOutcome>> {
        let outcomes = self.evaluate(decisions, inputs)?;
        for outcome in &outcomes {
            diary.record(cycle, outcome.to_event()).await;
        }
        Ok(outcomes)
    }

    fn gate_one(
        &self,
        mut decision: TradeDecision,
        capital: Decimal,
        remaining: Decimal,
        leverage: Decimal,
        exposure: &HashMap<String, Exposure>,
    ) -> GateOutcome {
        let action_before = decision.action;
        let current = exposure.get(&decision.asset);

        let increment = match decision.action {
            TradeAction::Hold | TradeAction::Close => Decimal::ZERO,
            TradeAction::OpenLong | TradeAction::OpenShort => {
                requested_notional(&decision, capital, leverage)
            }
            TradeAction::Adjust => match current {
                Some(current) => (decision.allocation_usd - current.notional).max(Decimal::ZERO),
                None => {
                    return held(decision, remaining, Decimal::ZERO, "adjust without an open position");
                }
            },
        };

        if increment.is_zero() {
            if decision.action.open_side().is_some() {
                return held(decision, remaining, increment, "no allocation requested");
            }
            decision.allocation_fraction = Some(0.0);
            return GateOutcome {
                decision,
                action_before,
                requested_notional: Decimal::ZERO,
                approved_notional: Decimal::ZERO,
                required_margin: Decimal::ZERO,
                remaining_capital: remaining,
                reason: None,
            };
        }

        if remaining <= self.min_remaining_capital {
            let reason = format!(
                "remaining capital {} at or below minimum {}",
                remaining.round_dp(2),
                self.min_remaining_capital
            );
            return held(decision, remaining, increment, &reason);
        }

        let mut approved = increment;
        let mut reason = None;
        if approved / leverage > remaining {
            approved = remaining * leverage;
            reason = Some(format!(
                "scaled from {} to {} to fit remaining capital",
                increment.round_dp(2),
                approved.round_dp(2)
            ));
        }

        if approved < self.min_order_notional {
            let reason = format!(
                "approved notional {} below minimum order {}",
                approved.round_dp(2),
                self.min_order_notional
            );
            return held(decision, remaining, increment, &reason);
        }

        let margin = approved / leverage;
        decision.allocation_usd = match (decision.action, current) {
            (TradeAction::Adjust, Some(current)) => current.notional + approved,
            _ => approved,
        };
        decision.allocation_fraction = Some(fraction(margin, capital));

        if reason.is_some() {
            info!(
                "Gate scaled {} {}: notional {} -> {}",
                decision.asset, decision.action, increment, approved
            );
        } else {
            debug!("Gate passed {} {} margin {}", decision.asset, decision.action, margin);
        }

        GateOutcome {
            decision,
            action_before,
            requested_notional: increment,
            approved_notional: approved,
            required_margin: margin,
            remaining_capital: remaining - margin,
            reason,
        }
    }
}

/// Notional asked for by an open, from `allocation_usd` or the margin fraction
fn requested_notional(decision: &TradeDecision, capital: Decimal, leverage: Decimal) -> Decimal {
    if decision.allocation_usd > Decimal::ZERO {
        return decision.allocation_usd;
    }
    decision
        .allocation_fraction
        .and_then(Decimal::from_f64)
        .map(|f| f * capital * leverage)
        .unwrap_or(Decimal::ZERO)
}

fn fraction(margin: Decimal, capital: Decimal) -> f64 {
    (margin / capital).to_f64().unwrap_or(0.0).clamp(0.0, 1.0)
}

fn held(decision: TradeDecision, remaining: Decimal, requested: Decimal, reason: &str) -> GateOutcome {
    info!("Gate converted {} {} to hold: {}", decision.asset, decision.action, reason);
    let action_before = decision.action;
    GateOutcome {
        decision: decision.into_hold(reason),
        action_before,
        requested_notional: requested,
        approved_notional: Decimal::ZERO,
        required_margin: Decimal::ZERO,
        remaining_capital: remaining,
        reason: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn gate() -> RiskGate {
        RiskGate::new(&RiskSettings::default())
    }

    fn open(asset: &str, action: TradeAction, usd: i64) -> TradeDecision {
        TradeDecision {
            action,
            allocation_usd: Decimal::from(usd),
            ..TradeDecision::hold(asset, "test")
        }
    }

    fn run(
        decisions: Vec<TradeDecision>,
        available_capital: Decimal,
        leverage: Decimal,
        exposure: &HashMap<String, Exposure>,
        asset_order: &[String],
    ) -> Result<Vec<GateOutcome>> {
        gate().evaluate(
            decisions,
            &GateInputs {
                available_capital,
                leverage,
                exposure,
                asset_order,
            },
        )
    }

    fn order(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn test_affordable_open_passes_unchanged() {
        let outcomes = run(
                vec![open("BTC", TradeAction::OpenLong, 400)],
                dec(1000),
                dec(5),
                &HashMap::new(),
                &order(&["BTC"]),
            )
            .unwrap();

        let btc = &outcomes[0];
        assert_eq!(btc.decision.action, TradeAction::OpenLong);
        assert_eq!(btc.decision.allocation_usd, dec(400));
        assert_eq!(btc.required_margin, dec(80));
        assert_eq!(btc.remaining_capital, dec(920));
        assert!((btc.decision.allocation_fraction.unwrap() - 0.08).abs() < 1e-9);
        assert!(!btc.was_modified());
    }

    #[test]
    fn test_oversized_open_is_scaled_to_capital() {
        let outcomes = run(
                vec![open("BTC", TradeAction::OpenLong, 400)],
                dec(50),
                dec(5),
                &HashMap::new(),
                &order(&["BTC"]),
            )
            .unwrap();

        let btc = &outcomes[0];
        assert_eq!(btc.decision.action, TradeAction::OpenLong);
        assert_eq!(btc.approved_notional, dec(250));
        assert_eq!(btc.required_margin, dec(50));
        assert_eq!(btc.decision.allocation_fraction, Some(1.0));
        assert!(btc.was_modified());
    }

    #[test]
    fn test_capital_is_shared_in_declared_order() {
        let decisions = vec![
            open("ETH", TradeAction::OpenShort, 400),
            open("BTC", TradeAction::OpenLong, 400),
            open("SOL", TradeAction::OpenLong, 400),
        ];
        let outcomes = run(decisions, dec(100), dec(5), &HashMap::new(), &order(&["BTC", "ETH", "SOL"]))
            .unwrap();

        let assets: Vec<_> = outcomes.iter().map(|o| o.decision.asset.as_str()).collect();
        assert_eq!(assets, vec!["BTC", "ETH", "SOL"]);

        assert_eq!(outcomes[0].required_margin, dec(80));
        assert_eq!(outcomes[1].required_margin, dec(20));
        assert_eq!(outcomes[1].approved_notional, dec(100));
        assert_eq!(outcomes[2].decision.action, TradeAction::Hold);

        let total: Decimal = outcomes.iter().map(|o| o.required_margin).sum();
        assert!(total <= dec(100));
        for outcome in &outcomes {
            let f = outcome.decision.allocation_fraction.unwrap();
            assert!((0.0..=1.0).contains(&f));
        }
    }

    #[test]
    fn test_close_never_blocked() {
        let mut exposure = HashMap::new();
        exposure.insert(
            "ETH".to_string(),
            Exposure {
                side: Side::Long,
                notional: dec(900),
            },
        );
        let decisions = vec![
            open("BTC", TradeAction::OpenLong, 10_000),
            open("ETH", TradeAction::Close, 0),
        ];
        let outcomes = run(decisions, dec(100), dec(5), &exposure, &order(&["BTC", "ETH"]))
            .unwrap();

        assert_eq!(outcomes[0].remaining_capital, Decimal::ZERO);
        assert_eq!(outcomes[1].decision.action, TradeAction::Close);
        assert!(!outcomes[1].was_modified());
    }

    #[test]
    fn test_below_minimum_becomes_hold() {
        let outcomes = run(
                vec![open("BTC", TradeAction::OpenLong, 5)],
                dec(1000),
                dec(5),
                &HashMap::new(),
                &order(&["BTC"]),
            )
            .unwrap();
        assert_eq!(outcomes[0].decision.action, TradeAction::Hold);
        assert_eq!(outcomes[0].decision.allocation_usd, Decimal::ZERO);
        assert!(outcomes[0].decision.rationale.contains("minimum order"));

        let outcomes = run(
                vec![open("BTC", TradeAction::OpenLong, 500)],
                Decimal::new(5, 1),
                dec(5),
                &HashMap::new(),
                &order(&["BTC"]),
            )
            .unwrap();
        assert_eq!(outcomes[0].decision.action, TradeAction::Hold);
        assert!(outcomes[0].reason.as_deref().unwrap().contains("remaining capital"));
    }

    #[test]
    fn test_adjust_charges_only_the_increase() {
        let mut exposure = HashMap::new();
        exposure.insert(
            "SOL".to_string(),
            Exposure {
                side: Side::Short,
                notional: dec(300),
            },
        );

        let up = run(vec![open("SOL", TradeAction::Adjust, 500)], dec(1000), dec(5), &exposure, &order(&["SOL"]))
            .unwrap();
        assert_eq!(up[0].requested_notional, dec(200));
        assert_eq!(up[0].required_margin, dec(40));
        assert_eq!(up[0].decision.allocation_usd, dec(500));

        let down = run(vec![open("SOL", TradeAction::Adjust, 100)], dec(1000), dec(5), &exposure, &order(&["SOL"]))
            .unwrap();
        assert_eq!(down[0].decision.action, TradeAction::Adjust);
        assert_eq!(down[0].required_margin, Decimal::ZERO);

        let flat = run(vec![open("BTC", TradeAction::Adjust, 100)], dec(1000), dec(5), &exposure, &order(&["BTC"]))
            .unwrap();
        assert_eq!(flat[0].decision.action, TradeAction::Hold);
    }

    #[test]
    fn test_fraction_sizing_when_no_usd() {
        let decision = TradeDecision {
            allocation_fraction: Some(0.1),
            ..open("BTC", TradeAction::OpenLong, 0)
        };
        let outcomes = run(vec![decision], dec(1000), dec(5), &HashMap::new(), &order(&["BTC"]))
            .unwrap();
        assert!((outcomes[0].approved_notional - dec(500)).abs() < Decimal::new(1, 6));
        assert!((outcomes[0].required_margin - dec(100)).abs() < Decimal::new(1, 6));
    }

    #[test]
    fn test_non_positive_inputs_are_config_errors() {
        let err = run(vec![], dec(1000), Decimal::ZERO, &HashMap::new(), &[])
            .unwrap_err();
        assert!(matches!(err, AgentError::GateConfig(_)));
        assert!(err.is_cycle_fatal());

        let err = run(vec![], dec(-1), dec(5), &HashMap::new(), &[])
            .unwrap_err();
        assert!(matches!(err, AgentError::GateConfig(_)));
    }

    #[tokio::test]
    async fn test_apply_records_gate_events() {
        let dir = tempfile::tempdir().unwrap();
        let diary = Diary::new(dir.path().join("diary.jsonl"));

        gate()
            .apply(
                vec![open("BTC", TradeAction::OpenLong, 400), open("ETH", TradeAction::Hold, 0)],
                &GateInputs {
                    available_capital: dec(50),
                    leverage: dec(5),
                    exposure: &HashMap::new(),
                    asset_order: &order(&["BTC", "ETH"]),
                },
                &diary,
                3,
            )
            .await
            .unwrap();

        let entries: Vec<_> = diary.entries().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        match &entries[0].event {
            DiaryEvent::Gate {
                asset,
                requested_notional,
                approved_notional,
                reason,
                ..
            } => {
                assert_eq!(asset, "BTC");
                assert_eq!(*requested_notional, dec(400));
                assert_eq!(*approved_notional, dec(250));
                assert!(reason.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(entries[1].cycle, 3);
    }
}
