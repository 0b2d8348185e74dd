//! Error taxonomy for the decision-and-reconciliation loop
//!
//! Every error knows which phase of the cycle produced it and, when it is
//! asset-scoped, which asset. That is enough to write it to the diary without
//! access to live state.

use serde::{Deserialize, Serialize};

/// Cycle phase an error (or diary event) belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Context,
    Decision,
    Gate,
    Execution,
    Reconciliation,
    Storage,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Context => write!(f, "context"),
            Phase::Decision => write!(f, "decision"),
            Phase::Gate => write!(f, "gate"),
            Phase::Execution => write!(f, "execution"),
            Phase::Reconciliation => write!(f, "reconciliation"),
            Phase::Storage => write!(f, "storage"),
        }
    }
}

/// Errors raised inside the agent core
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A single asset could not be snapshotted; the asset is skipped this cycle
    #[error("context build failed for {asset}: {message}")]
    ContextBuild { asset: String, message: String },

    /// Exchange state could not be read at all; the cycle is abandoned
    #[error("exchange state unavailable: {0}")]
    ExchangeUnavailable(String),

    /// Model output for an asset failed validation after the sanitizer pass
    #[error("decision validation failed for {asset}: {message}")]
    DecisionValidation { asset: String, message: String },

    /// Leverage or capital inputs are unusable; fatal for the cycle
    #[error("gate configuration invalid: {0}")]
    GateConfig(String),

    #[error("execution failed for {asset}: {message}")]
    Execution { asset: String, message: String },

    /// Reconciliation skipped because exchange truth is unavailable
    #[error("reconciliation skipped: {0}")]
    Reconciliation(String),

    #[error("model request failed: {0}")]
    Model(String),

    #[error("provider request failed: {0}")]
    Provider(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    pub fn context(asset: impl Into<String>, message: impl std::fmt::Display) -> Self {
        AgentError::ContextBuild {
            asset: asset.into(),
            message: message.to_string(),
        }
    }

    pub fn validation(asset: impl Into<String>, message: impl std::fmt::Display) -> Self {
        AgentError::DecisionValidation {
            asset: asset.into(),
            message: message.to_string(),
        }
    }

    pub fn execution(asset: impl Into<String>, message: impl std::fmt::Display) -> Self {
        AgentError::Execution {
            asset: asset.into(),
            message: message.to_string(),
        }
    }

    /// Phase the error is attributed to in the diary
    pub fn phase(&self) -> Phase {
        match self {
            AgentError::ContextBuild { .. } | AgentError::ExchangeUnavailable(_) => Phase::Context,
            AgentError::DecisionValidation { .. } | AgentError::Model(_) => Phase::Decision,
            AgentError::GateConfig(_) => Phase::Gate,
            AgentError::Execution { .. } => Phase::Execution,
            AgentError::Reconciliation(_) => Phase::Reconciliation,
            AgentError::Provider(_) => Phase::Context,
            AgentError::Storage(_) | AgentError::Serialization(_) => Phase::Storage,
        }
    }

    /// Asset the error is scoped to, if any
    pub fn asset(&self) -> Option<&str> {
        match self {
            AgentError::ContextBuild { asset, .. }
            | AgentError::DecisionValidation { asset, .. }
            | AgentError::Execution { asset, .. } => Some(asset),
            _ => None,
        }
    }

    /// Whether the error aborts the remaining phases of the cycle
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::ExchangeUnavailable(_) | AgentError::GateConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Startup configuration errors (fatal to the process)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}
