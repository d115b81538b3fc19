//! OpenAI-compatible family adapter (C3).
//!
//! Identity role mapping — every canonical [`Role`] serializes to its exact
//! OpenAI Chat Completions counterpart — with `system_prompt` prepended as a
//! leading `system` message. Covers OpenAI itself and any endpoint that
//! mirrors its wire shape (Anthropic's OpenAI-compatible proxy, xAI Grok,
//! self-hosted gateways).
//!
//! # Example
//!
//! ```rust,no_run
//! use llm_orchestrator_core::clients::common::ProviderAdapter;
//! use llm_orchestrator_core::clients::openai::OpenAiCompatibleAdapter;
//! use llm_orchestrator_core::config::GenerationConfig;
//! use llm_orchestrator_core::client_wrapper::Message;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = OpenAiCompatibleAdapter::new("https://api.openai.com/v1", "sk-...", "gpt-4.1-mini");
//! let messages = [Message::user("2+2?")];
//! let call = adapter.send(&messages, &[], &GenerationConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

use crate::cloudllm::client_wrapper::{DurationUsage, Message, Role, ToolCall, TokenUsage};
use crate::cloudllm::clients::common::{
    get_shared_http_client, http_status_error, multiplex_raw_chunks, sse_data_lines, ProviderAdapter, ProviderCall,
    ProviderResponse, RawChunk,
};
use crate::cloudllm::config::GenerationConfig;
use crate::cloudllm::error::AdapterError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct OpenAiCompatibleAdapter {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiCompatibleAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            http: get_shared_http_client().clone(),
        }
    }

    fn wire_messages(&self, messages: &[Message], config: &GenerationConfig) -> Vec<JsonValue> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if let Some(system_prompt) = &config.system_prompt {
            wire.push(serde_json::json!({ "role": "system", "content": system_prompt }));
        }
        for msg in messages {
            wire.push(match msg.role {
                Role::System => serde_json::json!({ "role": "system", "content": msg.content.as_deref() }),
                Role::User => serde_json::json!({ "role": "user", "content": msg.content.as_deref() }),
                Role::Assistant => match &msg.tool_calls {
                    Some(calls) if !calls.is_empty() => serde_json::json!({
                        "role": "assistant",
                        "content": JsonValue::Null,
                        "tool_calls": calls.iter().map(|tc| serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.function_name, "arguments": tc.arguments_json },
                        })).collect::<Vec<_>>(),
                    }),
                    _ => serde_json::json!({ "role": "assistant", "content": msg.content.as_deref() }),
                },
                Role::Tool => serde_json::json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id,
                    "content": msg.content.as_deref(),
                }),
            });
        }
        wire
    }

    fn wire_body(&self, messages: &[Message], tools: &[JsonValue], config: &GenerationConfig, stream: bool) -> JsonValue {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": self.wire_messages(messages, config),
            "max_tokens": config.max_output_tokens,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "presence_penalty": config.presence_penalty,
            "frequency_penalty": config.frequency_penalty,
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = JsonValue::Array(
                tools
                    .iter()
                    .map(|schema| {
                        serde_json::json!({ "type": "function", "function": schema })
                    })
                    .collect(),
            );
        }
        body
    }

    async fn send_non_streaming(&self, body: JsonValue) -> Result<ProviderResponse, AdapterError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_status_error(response).await);
        }

        let parsed: JsonValue = response.json().await.map_err(|e| AdapterError::invalid_response(e.to_string()))?;
        parse_completion(&parsed)
    }

    async fn send_streaming(&self, body: JsonValue) -> Result<ProviderCall, AdapterError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_status_error(response).await);
        }

        let mut lines = Box::pin(sse_data_lines(response.bytes_stream()));
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut tool_call_builders: HashMap<usize, (String, String, String)> = HashMap::new();
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                let chunk: JsonValue = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
                    let prompt = usage.get("prompt_tokens").and_then(JsonValue::as_u64).unwrap_or(0);
                    let completion = usage.get("completion_tokens").and_then(JsonValue::as_u64).unwrap_or(0);
                    if tx.send(Ok(RawChunk::Usage(TokenUsage::new(prompt, completion)))).await.is_err() {
                        return;
                    }
                }
                let Some(delta) = chunk.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("delta")) else {
                    continue;
                };
                if let Some(text) = delta.get("content").and_then(JsonValue::as_str) {
                    if !text.is_empty() && tx.send(Ok(RawChunk::Text(Arc::from(text)))).await.is_err() {
                        return;
                    }
                }
                if let Some(tool_call_deltas) = delta.get("tool_calls").and_then(JsonValue::as_array) {
                    for delta_call in tool_call_deltas {
                        let index = delta_call.get("index").and_then(JsonValue::as_u64).unwrap_or(0) as usize;
                        let entry = tool_call_builders.entry(index).or_insert_with(|| (String::new(), String::new(), String::new()));
                        if let Some(id) = delta_call.get("id").and_then(JsonValue::as_str) {
                            entry.0 = id.to_string();
                        }
                        if let Some(func) = delta_call.get("function") {
                            if let Some(name) = func.get("name").and_then(JsonValue::as_str) {
                                entry.1.push_str(name);
                            }
                            if let Some(args) = func.get("arguments").and_then(JsonValue::as_str) {
                                entry.2.push_str(args);
                            }
                        }
                    }
                }
                let finished_with_tool_calls = chunk
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("finish_reason"))
                    .and_then(JsonValue::as_str)
                    == Some("tool_calls");
                if finished_with_tool_calls && !tool_call_builders.is_empty() {
                    let mut indices: Vec<_> = tool_call_builders.keys().copied().collect();
                    indices.sort_unstable();
                    let calls = indices
                        .into_iter()
                        .map(|i| {
                            let (id, name, args) = tool_call_builders.remove(&i).unwrap();
                            ToolCall { id, function_name: name, arguments_json: if args.is_empty() { "{}".into() } else { args } }
                        })
                        .collect();
                    if tx.send(Ok(RawChunk::ToolCalls(calls))).await.is_err() {
                        return;
                    }
                }
            }
        });

        multiplex_raw_chunks(rx).await
    }
}

fn parse_completion(parsed: &JsonValue) -> Result<ProviderResponse, AdapterError> {
    let choice = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| AdapterError::invalid_response("response has no choices"))?;
    let message = choice.get("message").ok_or_else(|| AdapterError::invalid_response("choice has no message"))?;

    let content = message.get("content").and_then(JsonValue::as_str).map(Arc::from);

    let tool_calls: Vec<ToolCall> = message
        .get("tool_calls")
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let function_name = func.get("name")?.as_str()?.to_string();
                    let arguments_json = func.get("arguments")?.as_str().unwrap_or("{}").to_string();
                    Some(ToolCall { id, function_name, arguments_json })
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = parsed.get("usage").map(|u| {
        let prompt = u.get("prompt_tokens").and_then(JsonValue::as_u64).unwrap_or(0);
        let completion = u.get("completion_tokens").and_then(JsonValue::as_u64).unwrap_or(0);
        TokenUsage::new(prompt, completion)
    });

    Ok(ProviderResponse {
        content,
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        usage,
        duration: None::<DurationUsage>,
    })
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn family_name(&self) -> &str {
        "openai-compatible"
    }

    async fn send(
        &self,
        messages: &[Message],
        tools_json_schema: &[JsonValue],
        config: &GenerationConfig,
    ) -> Result<ProviderCall, AdapterError> {
        if config.stream {
            self.send_streaming(self.wire_body(messages, tools_json_schema, config, true)).await
        } else {
            self.send_non_streaming(self.wire_body(messages, tools_json_schema, config, false))
                .await
                .map(ProviderCall::Complete)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_prepends_system_prompt() {
        let adapter = OpenAiCompatibleAdapter::new("http://localhost", "key", "test-model");
        let config = GenerationConfig { system_prompt: Some("be terse".into()), ..GenerationConfig::default() };
        let wire = adapter.wire_messages(&[Message::user("hi")], &config);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
    }

    #[test]
    fn wire_messages_serializes_assistant_tool_calls_with_null_content() {
        let adapter = OpenAiCompatibleAdapter::new("http://localhost", "key", "test-model");
        let messages = [Message::assistant_tool_calls(vec![ToolCall {
            id: "t1".into(),
            function_name: "lookup".into(),
            arguments_json: "{}".into(),
        }])];
        let wire = adapter.wire_messages(&messages, &GenerationConfig::default());
        assert!(wire[0]["content"].is_null());
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "lookup");
    }

    #[test]
    fn parse_completion_extracts_tool_calls_and_usage() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{ "id": "t1", "function": { "name": "get_weather", "arguments": "{\"city\":\"NYC\"}" } }]
                }
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 4 }
        });
        let response = parse_completion(&body).unwrap();
        assert_eq!(response.tool_calls.unwrap()[0].function_name, "get_weather");
        assert_eq!(response.usage.unwrap(), TokenUsage::new(10, 4));
    }
}
