//! TAAPI technical indicator client
//!
//! Requests are spaced by a minimum interval (the basic plan allows five
//! calls per fifteen seconds) and retried with exponential backoff on
//! server errors and timeouts.

use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::TaapiSettings;
use crate::error::{AgentError, Result};

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 10;

pub struct TaapiClient {
    client: Client,
    base_url: String,
    api_key: String,
    exchange: String,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    backoff: Duration,
}

/// One indicator query
#[derive(Debug, Clone, Copy)]
pub struct IndicatorQuery<'a> {
    pub indicator: &'a str,
    pub interval: &'a str,
    pub period: Option<u32>,
    /// Response field holding the value(s), `value` or `valueMACD`
    pub value_key: &'a str,
}

impl<'a> IndicatorQuery<'a> {
    pub fn new(indicator: &'a str, interval: &'a str) -> Self {
        Self {
            indicator,
            interval,
            period: None,
            value_key: "value",
        }
    }

    pub fn period(mut self, period: u32) -> Self {
        self.period = Some(period);
        self
    }

    pub fn key(mut self, value_key: &'a str) -> Self {
        self.value_key = value_key;
        self
    }
}

impl TaapiClient {
    pub fn new(settings: &TaapiSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AgentError::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            exchange: settings.exchange.clone(),
            min_interval: settings.min_interval,
            last_request: Mutex::new(None),
            backoff: Duration::from_millis(500),
        })
    }

    fn symbol(asset: &str) -> String {
        format!("{}/USDT", asset)
    }

    /// Historical series, oldest first
    pub async fn series(&self, asset: &str, query: IndicatorQuery<'_>, results: usize) -> Result<Vec<f64>> {
        let body = self.get(asset, &query, Some(results)).await?;
        match body.get(query.value_key) {
            Some(Value::Array(values)) => Ok(values.iter().filter_map(Value::as_f64).collect()),
            Some(other) => Ok(other.as_f64().into_iter().collect()),
            None => Err(AgentError::Provider(format!(
                "TAAPI {} response for {} missing '{}'",
                query.indicator, asset, query.value_key
            ))),
        }
    }

    /// Latest value
    pub async fn value(&self, asset: &str, query: IndicatorQuery<'_>) -> Result<f64> {
        let body = self.get(asset, &query, None).await?;
        body.get(query.value_key)
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                AgentError::Provider(format!(
                    "TAAPI {} response for {} missing '{}'",
                    query.indicator, asset, query.value_key
                ))
            })
    }

    async fn wait_for_slot(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn get(&self, asset: &str, query: &IndicatorQuery<'_>, results: Option<usize>) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, query.indicator);
        let mut params = vec![
            ("secret", self.api_key.clone()),
            ("exchange", self.exchange.clone()),
            ("symbol", Self::symbol(asset)),
            ("interval", query.interval.to_string()),
        ];
        if let Some(period) = query.period {
            params.push(("period", period.to_string()));
        }
        if let Some(results) = results {
            params.push(("results", results.to_string()));
        }

        for attempt in 0..MAX_ATTEMPTS {
            self.wait_for_slot().await;
            let last_attempt = attempt + 1 == MAX_ATTEMPTS;
            let wait = self.backoff * 2u32.pow(attempt);

            match self.client.get(&url).query(&params).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!("TAAPI {} {} {} ok", query.indicator, asset, query.interval);
                        return response.json().await.map_err(|e| {
                            AgentError::Provider(format!("invalid TAAPI response: {}", e))
                        });
                    }
                    let retryable =
                        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                    if !retryable || last_attempt {
                        let body = response.text().await.unwrap_or_default();
                        return Err(AgentError::Provider(format!(
                            "TAAPI {} for {} returned {}: {}",
                            query.indicator, asset, status, body
                        )));
                    }
                    warn!("TAAPI {}, retrying in {:?}", status, wait);
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && !last_attempt => {
                    warn!("TAAPI request failed ({}), retrying in {:?}", e, wait);
                }
                Err(e) => {
                    return Err(AgentError::Provider(format!("TAAPI request failed: {}", e)));
                }
            }

            tokio::time::sleep(wait).await;
        }

        Err(AgentError::Provider("TAAPI max retries exceeded".to_string()))
    }
}
