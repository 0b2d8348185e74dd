//! Agent Runner
//!
//! LLM-driven perpetual futures agent. Each cycle builds a market and
//! account context, asks a model for one decision per asset, filters the
//! decisions through a capital/leverage gate, executes what passes and then
//! reconciles local trade records against the exchange.

pub mod api;
pub mod config;
pub mod context;
pub mod decision;
pub mod diary;
pub mod error;
pub mod executor;
pub mod gate;
pub mod hyperliquid;
pub mod llm;
pub mod logs;
pub mod paper;
pub mod providers;
pub mod reconciler;
pub mod runner;
pub mod store;
pub mod taapi;
pub mod types;


pub use config::{AgentConfig, TradingMode};
pub use decision::{DecisionEngine, DecisionOutcome, DecisionSource};
pub use diary::{Diary, DiaryEntry, DiaryEvent};
pub use error::{AgentError, ConfigError, Phase, Result};
pub use gate::{GateInputs, GateOutcome, RiskGate};
pub use reconciler::{ReconcileReport, ReconcileState, Reconciler};
pub use runner::{AgentRuntime, CycleReport};
pub use store::ActiveTradeStore;
pub use types::{ActiveTradeRecord, Side, TradeAction, TradeDecision};
