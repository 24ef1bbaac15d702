//! OpenAI-compatible chat-completions wire format (spec §4.F variant 1).

use super::{require_api_key, LlmAction, LlmClient, LlmConfig, LlmResponse, Message, Provider, Role, ToolCall, ToolDeclaration, Usage};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiChatClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiChatClient {
    pub fn new(config: LlmConfig) -> AppResult<Self> {
        require_api_key(&config)?;
        Ok(Self { http: reqwest::Client::new(), config })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    fn to_wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::System => json!({"role": "system", "content": m.content.clone().unwrap_or_default()}),
                Role::User => json!({"role": "user", "content": m.content.clone().unwrap_or_default()}),
                Role::Assistant if !m.tool_calls.is_empty() => json!({
                    "role": "assistant",
                    "content": serde_json::Value::Null,
                    "tool_calls": m.tool_calls.iter().map(|tc| json!({
                        "id": tc.call_id,
                        "type": "function",
                        "function": {"name": tc.tool_name, "arguments": tc.args.to_string()}
                    })).collect::<Vec<_>>()
                }),
                Role::Assistant => json!({"role": "assistant", "content": m.content.clone().unwrap_or_default()}),
                Role::Tool => {
                    let result = m.tool_result.as_ref();
                    json!({
                        "role": "tool",
                        "tool_call_id": result.map(|r| r.call_id.clone()).unwrap_or_default(),
                        "content": result.map(|r| r.content.to_string()).unwrap_or_default(),
                    })
                }
            })
            .collect()
    }

    fn to_wire_tools(tools: &[ToolDeclaration]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn complete(&self, messages: &[Message], tools: &[ToolDeclaration]) -> AppResult<LlmResponse> {
        let body = json!({
            "model": self.config.model,
            "messages": Self::to_wire_messages(messages),
            "tools": Self::to_wire_tools(tools),
            "tool_choice": "auto",
        });

        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
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
            return Err(AppError::LlmError { message: format!("openai http {status}: {text}") });
        }

        let parsed: serde_json::Value = resp.json().await.map_err(|e| AppError::LlmError { message: e.to_string() })?;
        parse_response(&parsed)
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }
}

fn parse_response(parsed: &serde_json::Value) -> AppResult<LlmResponse> {
    let choice = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| AppError::LlmError { message: "missing choices[0] in response".to_string() })?;
    let message = choice
        .get("message")
        .ok_or_else(|| AppError::LlmError { message: "missing choices[0].message".to_string() })?;

    let usage = parsed
        .get("usage")
        .map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            completion_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        })
        .unwrap_or_default();

    let action = if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        if !tool_calls.is_empty() {
            let calls = tool_calls
                .iter()
                .map(|tc| {
                    let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let func = tc.get("function").cloned().unwrap_or_default();
                    let name = func.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let args_str = func.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
                    let args = serde_json::from_str(args_str).unwrap_or(serde_json::Value::Null);
                    ToolCall { call_id: id, tool_name: name, args }
                })
                .collect();
            LlmAction::ToolCalls(calls)
        } else {
            LlmAction::Answer { content: message.get("content").and_then(|v| v.as_str()).unwrap_or_default().to_string() }
        }
    } else {
        LlmAction::Answer { content: message.get("content").and_then(|v| v.as_str()).unwrap_or_default().to_string() }
    };

    Ok(LlmResponse { action, usage })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_terminal_answer() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "42"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2}
        });
        let resp = parse_response(&body).unwrap();
        match resp.action {
            LlmAction::Answer { content } => assert_eq!(content, "42"),
            _ => panic!("expected answer"),
        }
        assert_eq!(resp.usage.total(), 12);
    }

    #[test]
    fn parses_tool_calls() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "tool_calls": [
                {"id": "call_1", "function": {"name": "run_query", "arguments": "{\"dataset_id\":\"sales\"}"}}
            ]}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1}
        });
        let resp = parse_response(&body).unwrap();
        match resp.action {
            LlmAction::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].tool_name, "run_query");
            }
            _ => panic!("expected tool calls"),
        }
    }
}
