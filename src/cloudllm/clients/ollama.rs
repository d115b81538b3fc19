//! Ollama-family adapter (C3).
//!
//! Roles pass through unchanged; tool-call arguments are native JSON objects
//! on the wire rather than a stringified blob, so this adapter parses/
//! restringifies at the boundary to stay on the canonical [`ToolCall`]'s
//! `arguments_json` string. Parameter names are remapped
//! (`max_output_tokens → num_predict`); `presence_penalty`/`frequency_penalty`
//! have no Ollama equivalent and are dropped. `system_prompt`, if set,
//! replaces (or is inserted as) the first `system` message.
//!
//! Streaming framing is newline-delimited JSON, not SSE — each line is one
//! complete `/api/chat` response object; the final line (`done: true`) also
//! carries the full duration breakdown, which Ollama already reports in
//! nanoseconds.
//!
//! # Example
//!
//! ```rust,no_run
//! use llm_orchestrator_core::clients::common::ProviderAdapter;
//! use llm_orchestrator_core::clients::ollama::OllamaAdapter;
//! use llm_orchestrator_core::config::GenerationConfig;
//! use llm_orchestrator_core::client_wrapper::Message;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = OllamaAdapter::new("http://localhost:11434", "llama3.1");
//! let call = adapter.send(&[Message::user("2+2?")], &[], &GenerationConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

use crate::cloudllm::client_wrapper::{DurationUsage, Message, Role, ToolCall, TokenUsage};
use crate::cloudllm::clients::common::{
    get_shared_http_client, http_status_error, multiplex_raw_chunks, ndjson_lines, ProviderAdapter, ProviderCall,
    ProviderResponse, RawChunk,
};
use crate::cloudllm::config::GenerationConfig;
use crate::cloudllm::error::AdapterError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct OllamaAdapter {
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), model: model.into(), http: get_shared_http_client().clone() }
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    fn wire_messages(&self, messages: &[Message], config: &GenerationConfig) -> Vec<JsonValue> {
        let mut wire: Vec<JsonValue> = messages
            .iter()
            .map(|msg| match (msg.role, &msg.tool_calls) {
                (Role::Assistant, Some(calls)) if !calls.is_empty() => serde_json::json!({
                    "role": "assistant",
                    "content": msg.content.as_deref().unwrap_or(""),
                    "tool_calls": calls.iter().map(|tc| serde_json::json!({
                        "function": {
                            "name": tc.function_name,
                            "arguments": serde_json::from_str::<JsonValue>(&tc.arguments_json)
                                .unwrap_or(JsonValue::Object(serde_json::Map::new())),
                        }
                    })).collect::<Vec<_>>(),
                }),
                (Role::Tool, _) => serde_json::json!({
                    "role": "tool",
                    "tool_name": msg.tool_name,
                    "content": msg.content.as_deref().unwrap_or(""),
                }),
                (role, _) => serde_json::json!({ "role": Self::role_str(role), "content": msg.content.as_deref().unwrap_or("") }),
            })
            .collect();

        if let Some(system_prompt) = &config.system_prompt {
            let entry = serde_json::json!({ "role": "system", "content": system_prompt });
            match wire.iter().position(|m| m["role"] == "system") {
                Some(pos) => wire[pos] = entry,
                None => wire.insert(0, entry),
            }
        }
        wire
    }

    fn wire_body(&self, messages: &[Message], tools: &[JsonValue], config: &GenerationConfig, stream: bool) -> JsonValue {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": self.wire_messages(messages, config),
            "stream": stream,
            "options": {
                "temperature": config.temperature,
                "top_p": config.top_p,
                "num_predict": config.max_output_tokens,
            },
        });
        if !tools.is_empty() {
            body["tools"] = JsonValue::Array(
                tools.iter().map(|schema| serde_json::json!({ "type": "function", "function": schema })).collect(),
            );
        }
        body
    }

    async fn send_non_streaming(&self, body: JsonValue) -> Result<ProviderResponse, AdapterError> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_status_error(response).await);
        }

        let parsed: JsonValue = response.json().await.map_err(|e| AdapterError::invalid_response(e.to_string()))?;
        parse_chat_response(&parsed)
    }

    async fn send_streaming(&self, body: JsonValue) -> Result<ProviderCall, AdapterError> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_status_error(response).await);
        }

        let mut lines = Box::pin(ndjson_lines(response.bytes_stream()));
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
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
                for raw in raw_chunks_from_chat_line(&chunk) {
                    if tx.send(Ok(raw)).await.is_err() {
                        return;
                    }
                }
            }
        });

        multiplex_raw_chunks(rx).await
    }
}

fn message_tool_calls(message: &JsonValue) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let args = func.get("arguments").cloned().unwrap_or(JsonValue::Object(serde_json::Map::new()));
                    Some(ToolCall { id: uuid::Uuid::new_v4().to_string(), function_name: name, arguments_json: args.to_string() })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn duration_from_done_chunk(chunk: &JsonValue) -> DurationUsage {
    let field = |name: &str| chunk.get(name).and_then(JsonValue::as_u64).unwrap_or(0);
    DurationUsage {
        total_duration: field("total_duration"),
        load_duration: field("load_duration"),
        prompt_eval_duration: field("prompt_eval_duration"),
        eval_duration: field("eval_duration"),
    }
}

fn usage_from_done_chunk(chunk: &JsonValue) -> TokenUsage {
    let prompt = chunk.get("prompt_eval_count").and_then(JsonValue::as_u64).unwrap_or(0);
    let completion = chunk.get("eval_count").and_then(JsonValue::as_u64).unwrap_or(0);
    TokenUsage::new(prompt, completion)
}

fn parse_chat_response(parsed: &JsonValue) -> Result<ProviderResponse, AdapterError> {
    let message = parsed.get("message").ok_or_else(|| AdapterError::invalid_response("response has no 'message'"))?;
    let tool_calls = message_tool_calls(message);
    let usage = Some(usage_from_done_chunk(parsed));
    let duration = Some(duration_from_done_chunk(parsed));

    if !tool_calls.is_empty() {
        return Ok(ProviderResponse { content: None, tool_calls: Some(tool_calls), usage, duration });
    }

    let content = message.get("content").and_then(JsonValue::as_str).filter(|s| !s.is_empty()).map(Arc::from);
    Ok(ProviderResponse { content, tool_calls: None, usage, duration })
}

fn raw_chunks_from_chat_line(chunk: &JsonValue) -> Vec<RawChunk> {
    let mut out = Vec::new();
    if let Some(message) = chunk.get("message") {
        let tool_calls = message_tool_calls(message);
        if !tool_calls.is_empty() {
            out.push(RawChunk::ToolCalls(tool_calls));
        } else if let Some(text) = message.get("content").and_then(JsonValue::as_str) {
            if !text.is_empty() {
                out.push(RawChunk::Text(Arc::from(text)));
            }
        }
    }
    if chunk.get("done").and_then(JsonValue::as_bool) == Some(true) {
        out.push(RawChunk::Usage(usage_from_done_chunk(chunk)));
        out.push(RawChunk::Duration(duration_from_done_chunk(chunk)));
    }
    out
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn family_name(&self) -> &str {
        "ollama"
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
