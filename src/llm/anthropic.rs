//! Anthropic Messages API wire format (spec §4.F variant 2).

use super::{require_api_key, LlmAction, LlmClient, LlmConfig, LlmResponse, Message, Provider, Role, ToolCall, ToolDeclaration, Usage};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicMessagesClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl AnthropicMessagesClient {
    pub fn new(config: LlmConfig) -> AppResult<Self> {
        require_api_key(&config)?;
        Ok(Self { http: reqwest::Client::new(), config })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/v1/messages", base.trim_end_matches('/'))
    }

    fn to_wire(messages: &[Message]) -> (Option<String>, Vec<serde_json::Value>) {
        let mut system_parts = Vec::new();
        let mut wire = Vec::new();
        for m in messages {
            match m.role {
                Role::System => system_parts.push(m.content.clone().unwrap_or_default()),
                Role::User => wire.push(json!({"role": "user", "content": m.content.clone().unwrap_or_default()})),
                Role::Assistant if !m.tool_calls.is_empty() => {
                    let blocks: Vec<serde_json::Value> = m
                        .tool_calls
                        .iter()
                        .map(|tc| json!({"type": "tool_use", "id": tc.call_id, "name": tc.tool_name, "input": tc.args}))
                        .collect();
                    wire.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Assistant => wire.push(json!({"role": "assistant", "content": m.content.clone().unwrap_or_default()})),
                Role::Tool => {
                    if let Some(result) = &m.tool_result {
                        wire.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": result.call_id,
                                "content": result.content.to_string(),
                                "is_error": result.is_error,
                            }]
                        }));
                    }
                }
            }
        }
        let system = if system_parts.is_empty() { None } else { Some(system_parts.join("\n\n")) };
        (system, wire)
    }

    fn to_wire_tools(tools: &[ToolDeclaration]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.parameters}))
            .collect()
    }
}

#[async_trait]
impl LlmClient for AnthropicMessagesClient {
    async fn complete(&self, messages: &[Message], tools: &[ToolDeclaration]) -> AppResult<LlmResponse> {
        let (system, wire_messages) = Self::to_wire(messages);
        let mut body = json!({
            "model": self.config.model,
            "max_tokens": MAX_TOKENS,
            "messages": wire_messages,
            "tools": Self::to_wire_tools(tools),
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }

        let resp = self
            .http
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LlmError { message: e.to_string() })?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::LlmRateLimited);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::LlmError { message: format!("anthropic http {status}: {text}") });
        }

        let parsed: serde_json::Value = resp.json().await.map_err(|e| AppError::LlmError { message: e.to_string() })?;
        parse_response(&parsed)
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

fn parse_response(parsed: &serde_json::Value) -> AppResult<LlmResponse> {
    let content = parsed
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| AppError::LlmError { message: "missing content array in response".to_string() })?;

    let usage = parsed
        .get("usage")
        .map(|u| Usage {
            prompt_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            completion_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        })
        .unwrap_or_default();

    let tool_calls: Vec<ToolCall> = content
        .iter()
        .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_use"))
        .map(|b| ToolCall {
            call_id: b.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            tool_name: b.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            args: b.get("input").cloned().unwrap_or(serde_json::Value::Null),
        })
        .collect();

    let action = if !tool_calls.is_empty() {
        LlmAction::ToolCalls(tool_calls)
    } else {
        let text = content
            .iter()
            .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("");
        LlmAction::Answer { content: text }
    };

    Ok(LlmResponse { action, usage })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_answer() {
        let body = json!({
            "content": [{"type": "text", "text": "42"}],
            "usage": {"input_tokens": 10, "output_tokens": 2}
        });
        let resp = parse_response(&body).unwrap();
        match resp.action {
            LlmAction::Answer { content } => assert_eq!(content, "42"),
            _ => panic!("expected answer"),
        }
    }

    #[test]
    fn parses_tool_use_block() {
        let body = json!({
            "content": [{"type": "tool_use", "id": "call_1", "name": "run_query", "input": {"dataset_id": "sales"}}],
            "usage": {"input_tokens": 5, "output_tokens": 1}
        });
        let resp = parse_response(&body).unwrap();
        match resp.action {
            LlmAction::ToolCalls(calls) => assert_eq!(calls[0].tool_name, "run_query"),
            _ => panic!("expected tool calls"),
        }
    }
}
