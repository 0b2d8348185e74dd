//! Decision Engine
//!
//! One primary model call, validated against a fixed contract. Invalid output
//! (or a failed call) earns exactly one sanitizer call; whatever is still
//! invalid after that becomes `hold` for the affected assets.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::context::DecisionContext;
use crate::error::AgentError;
use crate::llm::{ChatMessage, DecisionModel, ModelRequest, ModelRole};
use crate::types::{SetupGrade, TradeAction, TradeDecision};

const SYSTEM_PROMPT: &str = "\
You are a disciplined quantitative trader managing perpetual futures positions under real margin, \
funding and execution constraints. You receive account state, active trades with their exit plans, \
recent diary events and per-asset 5m and 4h indicators for several assets.

Policy:
1. Respect prior plans. If an active trade's exit_plan names an invalidation, do not close or flip \
before that invalidation (or a stronger one) has occurred.
2. Hysteresis. Changing a decision needs stronger evidence than keeping it. Flip only when the 4h \
structure supports the new direction and the 5m structure confirms with a break of about half an ATR.
3. Cooldown. After opening, adding, trimming or flipping, wait at least three decision bars before \
another direction change unless a hard invalidation occurs. Write the cooldown into exit_plan.
4. Funding tilts, it does not trigger. RSI extremes are pullback risk, not reversals.
5. Prefer adjusting size or TP/SL over exiting when the thesis weakens but is not invalidated.

Grade every setup by conviction: A (everything aligned, volume confirms), B (most conditions aligned), \
C (weak or unclear). Size risk by grade.

Actions: open-long, open-short, close, hold, adjust.
- allocation_usd is the position notional in USD. For adjust it is the target notional.
- allocation_fraction (optional) is the share of available capital to commit as margin, 0 to 1.
- TP/SL sanity: longs need tp_price above and sl_price below the current price; shorts the reverse. \
Use null when no sensible level exists.
- exit_plan must contain at least one explicit invalidation trigger.

Output contract: strict JSON, no Markdown. Either an array with exactly one decision per requested \
asset, or {\"reasoning\": string, \"trade_decisions\": [...]}. Each decision: \
{asset, action, allocation_usd, tp_price, sl_price, exit_plan, rationale, setup_grade}.";

const SANITIZER_PROMPT: &str = "\
You are a strict JSON normalizer. Return ONLY a JSON array of trade decision objects matching the \
item schema provided. If the input is wrapped, truncated or mixed with prose or Markdown, repair it. \
Emit exactly one object per requested asset. Do not add fields.";

/// Where the returned decisions came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Primary,
    Sanitized,
    /// Sanitizer output was still invalid; unresolved assets hold
    Fallback,
}

impl std::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionSource::Primary => write!(f, "primary"),
            DecisionSource::Sanitized => write!(f, "sanitized"),
            DecisionSource::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug)]
pub struct DecisionOutcome {
    /// One decision per requested asset, in requested order
    pub decisions: Vec<TradeDecision>,
    pub reasoning: String,
    pub source: DecisionSource,
    /// Model calls made for this outcome, never more than two
    pub invocations: u32,
    pub failures: Vec<AgentError>,
}

/// Result of validating one raw model output
#[derive(Debug, Default)]
pub struct Validation {
    pub reasoning: Option<String>,
    pub valid: HashMap<String, TradeDecision>,
    /// Problems found, optionally scoped to an asset
    pub problems: Vec<(Option<String>, String)>,
}

impl Validation {
    fn malformed(message: impl Into<String>) -> Self {
        Self {
            problems: vec![(None, message.into())],
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.problems.is_empty() && !self.valid.is_empty()
    }

    fn summary(&self) -> String {
        self.problems
            .iter()
            .map(|(asset, message)| match asset {
                Some(asset) => format!("{}: {}", asset, message),
                None => message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn problem_for(&self, asset: &str) -> Option<&str> {
        self.problems
            .iter()
            .find(|(a, _)| a.as_deref() == Some(asset))
            .map(|(_, m)| m.as_str())
    }
}

/// Validate raw model output against the requested asset set
///
/// Entries for unrequested assets are discarded. Assets simply omitted are
/// not problems; the caller defaults them to hold.
pub fn validate_output(raw: &str, assets: &[String]) -> Validation {
    let parsed: Value = match serde_json::from_str(raw.trim()) {
        Ok(value) => value,
        Err(e) => return Validation::malformed(format!("malformed JSON: {}", e)),
    };

    let (reasoning, entries) = match parsed {
        Value::Array(entries) => (None, entries),
        Value::Object(mut object) => match object.remove("trade_decisions") {
            Some(Value::Array(entries)) => {
                let reasoning = object
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                (reasoning, entries)
            }
            _ => return Validation::malformed("expected a JSON array of decisions"),
        },
        _ => return Validation::malformed("expected a JSON array of decisions"),
    };

    let mut validation = Validation {
        reasoning,
        ..Default::default()
    };
    let mut seen: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        let Value::Object(fields) = entry else {
            validation
                .problems
                .push((None, "decision entry is not an object".to_string()));
            continue;
        };
        let Some(asset) = fields
            .get("asset")
            .and_then(Value::as_str)
            .map(|a| a.trim().to_ascii_uppercase())
        else {
            validation
                .problems
                .push((None, "decision entry has no asset".to_string()));
            continue;
        };
        if !assets.contains(&asset) {
            continue;
        }

        *seen.entry(asset.clone()).or_default() += 1;
        match parse_entry(&asset, &fields) {
            Ok(decision) => {
                validation.valid.insert(asset, decision);
            }
            Err(message) => validation.problems.push((Some(asset), message)),
        }
    }

    for (asset, count) in seen {
        if count > 1 {
            validation.valid.remove(&asset);
            validation
                .problems
                .push((Some(asset), format!("{} decisions for one asset", count)));
        }
    }

    if validation.valid.is_empty() && validation.problems.is_empty() {
        validation
            .problems
            .push((None, "no decision for any requested asset".to_string()));
    }

    validation
}

fn decimal_from(value: &Value) -> Option<Decimal> {
    let Value::Number(n) = value else {
        return None;
    };
    let text = n.to_string();
    text.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(&text).ok())
}

fn optional_price(fields: &Map<String, Value>, key: &str) -> Result<Option<Decimal>, String> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match decimal_from(value) {
            Some(price) if price > Decimal::ZERO => Ok(Some(price)),
            Some(price) => Err(format!("{} must be positive, got {}", key, price)),
            None => Err(format!("{} must be a number or null", key)),
        },
    }
}

fn optional_text(fields: &Map<String, Value>, key: &str) -> Result<String, String> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(format!("{} must be a string", key)),
    }
}

fn parse_entry(asset: &str, fields: &Map<String, Value>) -> Result<TradeDecision, String> {
    let action: TradeAction = match fields.get("action") {
        Some(Value::String(action)) => action.parse()?,
        _ => return Err("action missing".to_string()),
    };

    let allocation_usd = match fields.get("allocation_usd") {
        None | Some(Value::Null) => Decimal::ZERO,
        Some(value) => match decimal_from(value) {
            Some(usd) if usd >= Decimal::ZERO => usd,
            Some(usd) => return Err(format!("allocation_usd must not be negative, got {}", usd)),
            None => return Err("allocation_usd must be a number".to_string()),
        },
    };

    let allocation_fraction = match fields.get("allocation_fraction") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_f64() {
            Some(fraction) => Some(fraction.clamp(0.0, 1.0)),
            None => return Err("allocation_fraction must be a number".to_string()),
        },
    };

    let setup_grade = match fields.get("setup_grade") {
        None | Some(Value::Null) => None,
        Some(Value::String(grade)) => Some(grade.parse::<SetupGrade>()?),
        Some(_) => return Err("setup_grade must be a string".to_string()),
    };

    Ok(TradeDecision {
        asset: asset.to_string(),
        action,
        allocation_usd,
        allocation_fraction,
        tp_price: optional_price(fields, "tp_price")?,
        sl_price: optional_price(fields, "sl_price")?,
        exit_plan: optional_text(fields, "exit_plan")?,
        rationale: optional_text(fields, "rationale")?,
        setup_grade,
    })
}

/// JSON schema for one decision item
pub fn decision_item_schema(assets: &[String]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "asset": {"type": "string", "enum": assets},
            "action": {"type": "string", "enum": TradeAction::all().iter().map(|a| a.to_string()).collect::<Vec<_>>()},
            "allocation_usd": {"type": "number", "minimum": 0},
            "tp_price": {"type": ["number", "null"]},
            "sl_price": {"type": ["number", "null"]},
            "exit_plan": {"type": "string"},
            "rationale": {"type": "string"},
            "setup_grade": {"type": "string", "enum": ["A", "B", "C"]}
        },
        "required": ["asset", "action", "allocation_usd", "tp_price", "sl_price", "exit_plan", "rationale", "setup_grade"],
        "additionalProperties": false
    })
}

/// Structured-output schema for the primary call
///
/// Strict schemas need an object at the top level, so the array sits under
/// `trade_decisions`.
pub fn decision_schema(assets: &[String]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "reasoning": {"type": "string"},
            "trade_decisions": {
                "type": "array",
                "items": decision_item_schema(assets),
                "minItems": 1
            }
        },
        "required": ["reasoning", "trade_decisions"],
        "additionalProperties": false
    })
}

pub struct DecisionEngine {
    model: Arc<dyn DecisionModel>,
    structured_output: bool,
}

impl DecisionEngine {
    pub fn new(model: Arc<dyn DecisionModel>, structured_output: bool) -> Self {
        Self {
            model,
            structured_output,
        }
    }

    fn primary_request(&self, prompt: &str, assets: &[String]) -> ModelRequest {
        ModelRequest {
            role: ModelRole::Primary,
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
            temperature: None,
            response_schema: self.structured_output.then(|| decision_schema(assets)),
        }
    }

    fn sanitizer_request(&self, prompt: &str, assets: &[String], malformed: &str, problems: &str) -> ModelRequest {
        let user = json!({
            "requested_assets": assets,
            "item_schema": decision_item_schema(assets),
            "problems": problems,
            "malformed_output": malformed,
            "context": prompt,
            "instruction": "Emit array-only JSON with exactly one schema-conforming object per requested asset.",
        });
        ModelRequest {
            role: ModelRole::Sanitizer,
            messages: vec![
                ChatMessage::system(SANITIZER_PROMPT),
                ChatMessage::user(user.to_string()),
            ],
            temperature: Some(0.0),
            response_schema: None,
        }
    }

    /// Turn a context into one decision per asset in it
    pub async fn decide(&self, context: &DecisionContext) -> DecisionOutcome {
        let assets = context.assets().to_vec();

        let prompt = match context.to_prompt() {
            Ok(prompt) => prompt,
            Err(e) => {
                return all_hold(&assets, 0, |asset| {
                    AgentError::validation(asset, format!("context could not be serialized: {}", e))
                });
            }
        };

        let (malformed, primary) = match self.model.complete(&self.primary_request(&prompt, &assets)).await {
            Ok(raw) => {
                let validation = validate_output(&raw, &assets);
                if validation.is_valid() {
                    info!("Primary decision output valid for {} assets", validation.valid.len());
                    return assemble(&assets, validation, None, DecisionSource::Primary, 1);
                }
                warn!("Primary decision output invalid: {}", validation.summary());
                (raw, validation)
            }
            Err(e) => {
                warn!("Primary decision call failed: {}", e);
                (String::new(), Validation::malformed(e.to_string()))
            }
        };

        let request = self.sanitizer_request(&prompt, &assets, &malformed, &primary.summary());
        let sanitized = match self.model.complete(&request).await {
            Ok(raw) => validate_output(&raw, &assets),
            Err(e) => {
                warn!("Sanitizer call failed: {}", e);
                Validation::malformed(e.to_string())
            }
        };

        if sanitized.is_valid() {
            info!("Sanitized decision output valid for {} assets", sanitized.valid.len());
            return assemble(&assets, sanitized, None, DecisionSource::Sanitized, 2);
        }

        warn!("Sanitized decision output still invalid: {}", sanitized.summary());
        assemble(&assets, sanitized, Some(primary), DecisionSource::Fallback, 2)
    }
}

fn all_hold(assets: &[String], invocations: u32, error: impl Fn(&str) -> AgentError) -> DecisionOutcome {
    DecisionOutcome {
        decisions: assets
            .iter()
            .map(|a| TradeDecision::hold(a.as_str(), "no valid decision this cycle"))
            .collect(),
        reasoning: String::new(),
        source: DecisionSource::Fallback,
        invocations,
        failures: assets.iter().map(|a| error(a)).collect(),
    }
}

/// Order decisions by requested asset, filling gaps with hold
///
/// With a `fallback`, an asset the final output could not resolve may use a
/// valid entry from the earlier output; anything else is a validation failure.
fn assemble(
    assets: &[String],
    mut last: Validation,
    fallback: Option<Validation>,
    source: DecisionSource,
    invocations: u32,
) -> DecisionOutcome {
    let mut earlier = fallback;
    let mut failures = Vec::new();
    let strict = earlier.is_some();

    let decisions = assets
        .iter()
        .map(|asset| {
            if let Some(decision) = last.valid.remove(asset) {
                return decision;
            }
            if let Some(decision) = earlier.as_mut().and_then(|v| v.valid.remove(asset)) {
                return decision;
            }
            if strict {
                let reason = last
                    .problem_for(asset)
                    .map(str::to_string)
                    .unwrap_or_else(|| last.summary());
                failures.push(AgentError::validation(asset.as_str(), reason));
                return TradeDecision::hold(asset.as_str(), "decision output invalid after sanitizer");
            }
            TradeDecision::hold(asset.as_str(), "omitted by model")
        })
        .collect();

    let reasoning = last
        .reasoning
        .or_else(|| earlier.and_then(|v| v.reasoning))
        .unwrap_or_default();

    DecisionOutcome {
        decisions,
        reasoning,
        source,
        invocations,
        failures,
    }
}
