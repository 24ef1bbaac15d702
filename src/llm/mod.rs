//! LLM Adapter (spec §4.F): a provider-agnostic interface to a chat model with
//! tool-use capability. Variants differ only in wire format; capability set is a
//! flat trait rather than an inheritance hierarchy (spec §9).
//!
//! Grounded on the pack's `LlmProvider` trait shape (a `multi-llm`-style
//! `execute_llm(request) -> Response` contract) and on the teacher's
//! `Provider`/`ProviderRegistry` pattern for how a small closed set of
//! implementations is declared and looked up.

pub mod anthropic;
pub mod openai;

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: Provider,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub call_id: String,
    pub content: serde_json::Value,
    pub is_error: bool,
}

/// One entry in the message sequence the Agent Loop carries between turns (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_result: Option<ToolResultMessage>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: Some(content.into()), tool_calls: vec![], tool_result: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: Some(content.into()), tool_calls: vec![], tool_result: None }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: Some(content.into()), tool_calls: vec![], tool_result: None }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self { role: Role::Assistant, content: None, tool_calls: calls, tool_result: None }
    }

    pub fn tool_result(result: ToolResultMessage) -> Self {
        Self { role: Role::Tool, content: None, tool_calls: vec![], tool_result: Some(result) }
    }
}

/// A declared backend capability the LLM may invoke (the wire-format projection of a
/// `Tool` from the Tool Registry, spec §4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Either a terminal textual answer or one or more structured tool invocations
/// (spec §4.F / §9: "Action | Answer + Usage").
#[derive(Debug, Clone)]
pub enum LlmAction {
    Answer { content: String },
    ToolCalls(Vec<ToolCall>),
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub action: LlmAction,
    pub usage: Usage,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message], tools: &[ToolDeclaration]) -> AppResult<LlmResponse>;

    fn provider(&self) -> Provider;
}

/// Per-model `{input_price, output_price}` (USD per 1K tokens). Supplements spec
/// §4.F, which requires the lookup without naming a source; unknown models report
/// `cost = 0` with `cost_unknown = true` (see [`price_for`]).
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

const OPENAI_PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4o", ModelPrice { input_per_1k: 0.0025, output_per_1k: 0.01 }),
    ("gpt-4o-mini", ModelPrice { input_per_1k: 0.00015, output_per_1k: 0.0006 }),
    ("gpt-4-turbo", ModelPrice { input_per_1k: 0.01, output_per_1k: 0.03 }),
];

const ANTHROPIC_PRICES: &[(&str, ModelPrice)] = &[
    ("claude-3-5-sonnet-20241022", ModelPrice { input_per_1k: 0.003, output_per_1k: 0.015 }),
    ("claude-3-5-haiku-20241022", ModelPrice { input_per_1k: 0.0008, output_per_1k: 0.004 }),
    ("claude-3-opus-20240229", ModelPrice { input_per_1k: 0.015, output_per_1k: 0.075 }),
];

/// Looks up the per-model price table for `provider`. Returns `None` for an unknown
/// model, which callers surface as `cost_unknown = true` rather than guessing.
pub fn price_for(provider: Provider, model: &str) -> Option<ModelPrice> {
    let table = match provider {
        Provider::OpenAi => OPENAI_PRICES,
        Provider::Anthropic => ANTHROPIC_PRICES,
    };
    table.iter().find(|(name, _)| *name == model).map(|(_, p)| *p)
}

pub fn cost_usd(provider: Provider, model: &str, usage: Usage) -> (f64, bool) {
    match price_for(provider, model) {
        Some(price) => {
            let cost = (usage.prompt_tokens as f64 / 1000.0) * price.input_per_1k
                + (usage.completion_tokens as f64 / 1000.0) * price.output_per_1k;
            (cost, false)
        }
        None => (0.0, true),
    }
}

/// Builds a concrete `LlmClient` for the given config, grounded on the teacher's
/// `ProviderRegistry::get` dispatch-by-id pattern.
pub fn build_client(config: &LlmConfig) -> AppResult<Box<dyn LlmClient>> {
    match config.provider {
        Provider::OpenAi => Ok(Box::new(openai::OpenAiChatClient::new(config.clone())?)),
        Provider::Anthropic => Ok(Box::new(anthropic::AnthropicMessagesClient::new(config.clone())?)),
    }
}

pub(crate) fn require_api_key(config: &LlmConfig) -> AppResult<&str> {
    if config.api_key.trim().is_empty() {
        return Err(AppError::LlmError { message: "missing api_key".to_string() });
    }
    Ok(&config.api_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_reports_cost_unknown() {
        let (cost, unknown) = cost_usd(Provider::OpenAi, "some-future-model", Usage { prompt_tokens: 100, completion_tokens: 50 });
        assert_eq!(cost, 0.0);
        assert!(unknown);
    }

    #[test]
    fn known_model_computes_cost() {
        let (cost, unknown) = cost_usd(Provider::OpenAi, "gpt-4o", Usage { prompt_tokens: 1000, completion_tokens: 1000 });
        assert!(!unknown);
        assert!((cost - 0.0125).abs() < 1e-9);
    }
}
