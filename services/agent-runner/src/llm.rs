//! Language model client
//!
//! OpenRouter chat-completions over HTTP. The Decision Engine only sees the
//! [`DecisionModel`] trait, so tests can script model output.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::config::LlmSettings;
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Primary,
    Sanitizer,
}

/// One model invocation
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub role: ModelRole,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    /// Strict JSON schema for the response, when structured output is on
    pub response_schema: Option<Value>,
}

/// Text-in, text-out model seam
#[async_trait::async_trait]
pub trait DecisionModel: Send + Sync {
    /// Raw assistant content for the request
    async fn complete(&self, request: &ModelRequest) -> Result<String>;
}

/// OpenRouter chat-completions client
pub struct OpenRouterClient {
    base_url: String,
    api_key: String,
    model: String,
    sanitize_model: String,
    referer: Option<String>,
    app_title: Option<String>,
    reasoning_effort: Option<String>,
    http_client: Client,
    timeout: Duration,
    audit_log: Option<PathBuf>,
    /// Cleared once the provider rejects `response_format`; never set again
    structured_output: AtomicBool,
}

impl OpenRouterClient {
    pub fn new(settings: &LlmSettings, audit_log: Option<PathBuf>) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(settings.timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| AgentError::Model(format!("failed to build HTTP client: {}", e)))?;

        info!(
            "OpenRouter client initialized: url={}, model={}, sanitizer={}, timeout={:?}",
            settings.base_url, settings.model, settings.sanitize_model, settings.timeout
        );

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            sanitize_model: settings.sanitize_model.clone(),
            referer: settings.referer.clone(),
            app_title: settings.app_title.clone(),
            reasoning_effort: settings.reasoning_effort.clone(),
            http_client,
            timeout: settings.timeout,
            audit_log,
            structured_output: AtomicBool::new(true),
        })
    }

    fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Primary => &self.model,
            ModelRole::Sanitizer => &self.sanitize_model,
        }
    }

    fn build_payload(&self, request: &ModelRequest) -> Value {
        let mut payload = json!({
            "model": self.model_for(request.role),
            "messages": request.messages,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        let schema = request
            .response_schema
            .as_ref()
            .filter(|_| self.structured_output.load(Ordering::Relaxed));
        if let Some(schema) = schema {
            payload["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "trade_decisions",
                    "strict": true,
                    "schema": schema,
                },
            });
        }
        if request.role == ModelRole::Primary {
            if let Some(effort) = &self.reasoning_effort {
                payload["reasoning"] = json!({ "enabled": true, "effort": effort, "exclude": false });
            }
        }
        payload
    }

    async fn audit(&self, text: String) {
        let Some(path) = &self.audit_log else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(text.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to write LLM audit log {:?}: {}", path, e);
        }
    }
}

#[async_trait::async_trait]
impl DecisionModel for OpenRouterClient {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = self.build_payload(request);
        let model = self.model_for(request.role).to_string();

        self.audit(format!(
            "\n\n=== {} ===\nModel: {}\nPayload:\n{}\n",
            Utc::now().to_rfc3339(),
            model,
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        ))
        .await;

        debug!("Sending request to OpenRouter (model: {})", model);

        let mut builder = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .timeout(self.timeout);
        if let Some(referer) = &self.referer {
            builder = builder.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.app_title {
            builder = builder.header("X-Title", title);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Model(format!("request timed out after {:?}", self.timeout))
            } else if e.is_connect() {
                AgentError::Model(format!("failed to connect to {}: {}", url, e))
            } else {
                AgentError::Model(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("OpenRouter error: status={}, body={}", status, error_text);
            self.audit(format!("ERROR Response: {} - {}\n", status, error_text))
                .await;
            if payload.get("response_format").is_some() && rejects_structured_output(status, &error_text) {
                warn!("Provider rejected structured output; sending later requests without response_format");
                self.structured_output.store(false, Ordering::Relaxed);
            }
            return Err(AgentError::Model(format!(
                "status {}: {}",
                status, error_text
            )));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Model(format!("failed to parse response: {}", e)))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.into_text())
            .ok_or_else(|| AgentError::Model("response has no message content".to_string()))?;

        info!(
            "Received response from OpenRouter (model: {}, {} chars)",
            model,
            content.len()
        );
        self.audit(format!("Response:\n{}\n", content)).await;

        Ok(content)
    }
}

fn rejects_structured_output(status: StatusCode, body: &str) -> bool {
    matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY)
        && (body.contains("response_format") || body.to_ascii_lowercase().contains("structured"))
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    /// Some providers return structured output already parsed
    parsed: Option<Value>,
}

impl ResponseMessage {
    fn into_text(self) -> Option<String> {
        match (self.parsed, self.content) {
            (Some(parsed), _) if !parsed.is_null() => Some(parsed.to_string()),
            (_, Some(content)) if !content.trim().is_empty() => Some(content),
            _ => None,
        }
    }
}
