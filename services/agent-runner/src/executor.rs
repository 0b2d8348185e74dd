//! Trade Executor - turns gated decisions into exchange orders

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{AgentError, Result};
use crate::providers::{ExecutionLayer, OrderAck, OrderRequest};
use crate::types::{ExchangePosition, TradeAction, TradeDecision};

/// Result of one placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub request: OrderRequest,
    pub ack: OrderAck,
}

pub struct TradeExecutor {
    layer: Arc<dyn ExecutionLayer>,
    size_decimals: u32,
}

impl TradeExecutor {
    pub fn new(layer: Arc<dyn ExecutionLayer>, size_decimals: u32) -> Self {
        Self {
            layer,
            size_decimals,
        }
    }

    fn size_for(&self, notional: Decimal, mid: Decimal) -> Decimal {
        if mid <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (notional / mid).round_dp_with_strategy(self.size_decimals, RoundingStrategy::ToZero)
    }

    /// Order for a gated decision, or `None` when nothing should be sent
    pub fn plan(
        &self,
        decision: &TradeDecision,
        mid: Decimal,
        position: Option<&ExchangePosition>,
    ) -> Option<OrderRequest> {
        let request = match decision.action {
            TradeAction::Hold => return None,
            TradeAction::OpenLong | TradeAction::OpenShort => {
                let side = decision.action.open_side()?;
                OrderRequest {
                    asset: decision.asset.clone(),
                    side,
                    size: self.size_for(decision.allocation_usd, mid),
                    reference_price: mid,
                    tp_price: decision.tp_price,
                    sl_price: decision.sl_price,
                    reduce_only: false,
                }
            }
            TradeAction::Close => {
                let position = position?;
                OrderRequest {
                    asset: decision.asset.clone(),
                    side: position.side.opposite(),
                    size: position.size,
                    reference_price: mid,
                    tp_price: None,
                    sl_price: None,
                    reduce_only: true,
                }
            }
            TradeAction::Adjust => {
                let position = position?;
                let delta = decision.allocation_usd - position.notional(mid);
                if delta > Decimal::ZERO {
                    OrderRequest {
                        asset: decision.asset.clone(),
                        side: position.side,
                        size: self.size_for(delta, mid),
                        reference_price: mid,
                        tp_price: decision.tp_price,
                        sl_price: decision.sl_price,
                        reduce_only: false,
                    }
                } else {
                    OrderRequest {
                        asset: decision.asset.clone(),
                        side: position.side.opposite(),
                        size: self.size_for(-delta, mid).min(position.size),
                        reference_price: mid,
                        tp_price: None,
                        sl_price: None,
                        reduce_only: true,
                    }
                }
            }
        };

        if request.size <= Decimal::ZERO {
            debug!("{} {} rounds to zero size; nothing to place", decision.asset, decision.action);
            return None;
        }
        Some(request)
    }

    /// Place the order for a decision; `Ok(None)` when the decision needs no order
    pub async fn execute(
        &self,
        decision: &TradeDecision,
        mid: Decimal,
        position: Option<&ExchangePosition>,
    ) -> Result<Option<ExecutionOutcome>> {
        let Some(request) = self.plan(decision, mid, position) else {
            return Ok(None);
        };

        info!(
            "Placing order: {} {} size={} ref={} reduce_only={}",
            request.asset, request.side, request.size, request.reference_price, request.reduce_only
        );

        match self.layer.place_order(&request).await {
            Ok(ack) => {
                info!("Order placed: {} ids={:?}", request.asset, ack.order_ids);
                Ok(Some(ExecutionOutcome { request, ack }))
            }
            Err(e) => {
                error!("Order failed for {}: {}", request.asset, e);
                Err(match e {
                    AgentError::Execution { .. } => e,
                    other => AgentError::execution(&request.asset, other),
                })
            }
        }
    }
}

/// Live execution layer: forwards orders to a signing order gateway
///
/// POST {gateway}/orders with an [`OrderRequest`] body, expecting an [`OrderAck`].
pub struct GatewayExecutor {
    gateway_url: String,
    http_client: Client,
    timeout: Duration,
}

impl GatewayExecutor {
    pub fn new(gateway_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            http_client,
            timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: String,
}

#[async_trait::async_trait]
impl ExecutionLayer for GatewayExecutor {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let url = format!("{}/orders", self.gateway_url);

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::execution(
                        &request.asset,
                        format!("order gateway timed out after {:?}", self.timeout),
                    )
                } else {
                    AgentError::execution(&request.asset, format!("order gateway request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GatewayErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return Err(AgentError::execution(
                &request.asset,
                format!("order gateway returned {}: {}", status, message),
            ));
        }

        response.json().await.map_err(|e| {
            AgentError::execution(&request.asset, format!("invalid order gateway response: {}", e))
        })
    }
}
