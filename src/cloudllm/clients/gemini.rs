//! Gemini-family adapter (C3).
//!
//! Genuinely native: talks to Google's Generative Language API directly
//! rather than through an OpenAI-compatible shim. Role remap is
//! `assistant → model`, `tool → function` (wrapped in a `functionResponse`
//! part); `system` messages are lifted out of the conversation entirely into
//! a top-level `systemInstruction`. Tool calls are emitted/parsed as
//! `functionCall` parts. `presence_penalty`/`frequency_penalty` have no
//! Gemini equivalent and are dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! use llm_orchestrator_core::clients::common::ProviderAdapter;
//! use llm_orchestrator_core::clients::gemini::GeminiAdapter;
//! use llm_orchestrator_core::config::GenerationConfig;
//! use llm_orchestrator_core::client_wrapper::Message;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = GeminiAdapter::new("api-key", "gemini-2.0-flash");
//! let call = adapter.send(&[Message::user("2+2?")], &[], &GenerationConfig::default()).await?;
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
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiAdapter {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, api_key, model)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), api_key: api_key.into(), model: model.into(), http: get_shared_http_client().clone() }
    }

    fn wire_contents(&self, messages: &[Message]) -> Vec<JsonValue> {
        messages
            .iter()
            .filter(|m| !matches!(m.role, Role::System))
            .map(|msg| match msg.role {
                Role::User => serde_json::json!({ "role": "user", "parts": [{ "text": msg.content.as_deref().unwrap_or("") }] }),
                Role::Assistant => match &msg.tool_calls {
                    Some(calls) if !calls.is_empty() => serde_json::json!({
                        "role": "model",
                        "parts": calls.iter().map(|tc| serde_json::json!({
                            "functionCall": {
                                "name": tc.function_name,
                                "args": serde_json::from_str::<JsonValue>(&tc.arguments_json)
                                    .unwrap_or(JsonValue::Object(serde_json::Map::new())),
                            }
                        })).collect::<Vec<_>>(),
                    }),
                    _ => serde_json::json!({ "role": "model", "parts": [{ "text": msg.content.as_deref().unwrap_or("") }] }),
                },
                Role::Tool => serde_json::json!({
                    "role": "function",
                    "parts": [{
                        "functionResponse": {
                            "name": msg.tool_name.as_deref().unwrap_or_default(),
                            "response": { "result": msg.content.as_deref().unwrap_or("") },
                        }
                    }]
                }),
                Role::System => unreachable!("filtered above"),
            })
            .collect()
    }

    fn wire_body(&self, messages: &[Message], tools: &[JsonValue], config: &GenerationConfig) -> JsonValue {
        let mut body = serde_json::json!({
            "contents": self.wire_contents(messages),
            "generationConfig": {
                "temperature": config.temperature,
                "topP": config.top_p,
                "maxOutputTokens": config.max_output_tokens,
            },
        });
        if let Some(system_prompt) = &config.system_prompt {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system_prompt }] });
        } else if let Some(system_msg) = messages.iter().find(|m| matches!(m.role, Role::System)) {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system_msg.content.as_deref().unwrap_or("") }] });
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::json!([{ "functionDeclarations": tools }]);
        }
        body
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{}?key={}", self.base_url.trim_end_matches('/'), self.model, method, self.api_key)
    }

    async fn send_non_streaming(&self, body: JsonValue) -> Result<ProviderResponse, AdapterError> {
        let response = self
            .http
            .post(self.endpoint("generateContent"))
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_status_error(response).await);
        }

        let parsed: JsonValue = response.json().await.map_err(|e| AdapterError::invalid_response(e.to_string()))?;
        parse_generate_content_response(&parsed)
    }

    async fn send_streaming(&self, body: JsonValue) -> Result<ProviderCall, AdapterError> {
        let url = format!("{}&alt=sse", self.endpoint("streamGenerateContent"));
        let response = self.http.post(url).json(&body).send().await.map_err(|e| AdapterError::transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_status_error(response).await);
        }

        let mut lines = Box::pin(sse_data_lines(response.bytes_stream()));
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
                for raw in raw_chunks_from_generate_content(&chunk) {
                    if tx.send(Ok(raw)).await.is_err() {
                        return;
                    }
                }
            }
        });

        multiplex_raw_chunks(rx).await
    }
}

fn parts_to_tool_calls(parts: &[JsonValue]) -> Vec<ToolCall> {
    parts
        .iter()
        .filter_map(|part| {
            let call = part.get("functionCall")?;
            let name = call.get("name")?.as_str()?.to_string();
            let args = call.get("args").cloned().unwrap_or(JsonValue::Object(serde_json::Map::new()));
            Some(ToolCall {
                id: uuid::Uuid::new_v4().to_string(),
                function_name: name,
                arguments_json: args.to_string(),
            })
        })
        .collect()
}

fn parts_to_text(parts: &[JsonValue]) -> String {
    parts.iter().filter_map(|part| part.get("text").and_then(JsonValue::as_str)).collect()
}

fn usage_from_metadata(metadata: &JsonValue) -> TokenUsage {
    let prompt = metadata.get("promptTokenCount").and_then(JsonValue::as_u64).unwrap_or(0);
    let completion = metadata.get("candidatesTokenCount").and_then(JsonValue::as_u64).unwrap_or(0);
    TokenUsage::new(prompt, completion)
}

fn parse_generate_content_response(parsed: &JsonValue) -> Result<ProviderResponse, AdapterError> {
    let parts = parsed
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::invalid_response("response has no candidate content parts"))?;

    let tool_calls = parts_to_tool_calls(parts);
    let usage = parsed.get("usageMetadata").map(usage_from_metadata);

    if !tool_calls.is_empty() {
        return Ok(ProviderResponse { content: None, tool_calls: Some(tool_calls), usage, duration: None::<DurationUsage> });
    }

    let text = parts_to_text(parts);
    Ok(ProviderResponse {
        content: if text.is_empty() { None } else { Some(Arc::from(text)) },
        tool_calls: None,
        usage,
        duration: None,
    })
}

fn raw_chunks_from_generate_content(chunk: &JsonValue) -> Vec<RawChunk> {
    let mut out = Vec::new();
    if let Some(parts) = chunk
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(JsonValue::as_array)
    {
        let tool_calls = parts_to_tool_calls(parts);
        if !tool_calls.is_empty() {
            out.push(RawChunk::ToolCalls(tool_calls));
        } else {
            let text = parts_to_text(parts);
            if !text.is_empty() {
                out.push(RawChunk::Text(Arc::from(text)));
            }
        }
    }
    if let Some(metadata) = chunk.get("usageMetadata") {
        out.push(RawChunk::Usage(usage_from_metadata(metadata)));
    }
    out
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn family_name(&self) -> &str {
        "gemini"
    }

    async fn send(
        &self,
        messages: &[Message],
        tools_json_schema: &[JsonValue],
        config: &GenerationConfig,
    ) -> Result<ProviderCall, AdapterError> {
        let body = self.wire_body(messages, tools_json_schema, config);
        if config.stream {
            self.send_streaming(body).await
        } else {
            self.send_non_streaming(body).await.map(ProviderCall::Complete)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_contents_drops_system_and_remaps_assistant_to_model() {
        let adapter = GeminiAdapter::new("key", "gemini-2.0-flash");
        let messages = [Message::system("be terse"), Message::user("hi"), Message::assistant("hello")];
        let contents = adapter.wire_contents(&messages);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn wire_body_lifts_system_message_into_system_instruction() {
        let adapter = GeminiAdapter::new("key", "gemini-2.0-flash");
        let messages = [Message::system("be terse"), Message::user("hi")];
        let body = adapter.wire_body(&messages, &[], &GenerationConfig::default());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn wire_contents_wraps_tool_result_in_function_response() {
        let adapter = GeminiAdapter::new("key", "gemini-2.0-flash");
        let messages = [Message::tool_result("call_1", "get_weather", "42")];
        let contents = adapter.wire_contents(&messages);
        assert_eq!(contents[0]["role"], "function");
        assert_eq!(contents[0]["parts"][0]["functionResponse"]["name"], "get_weather");
        assert_eq!(contents[0]["parts"][0]["functionResponse"]["response"]["result"], "42");
    }

    #[test]
    fn parse_generate_content_response_extracts_function_call() {
        let body = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "functionCall": { "name": "get_weather", "args": { "city": "NYC" } } }] } }],
            "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 3 }
        });
        let response = parse_generate_content_response(&body).unwrap();
        let calls = response.tool_calls.unwrap();
        assert_eq!(calls[0].function_name, "get_weather");
        assert_eq!(response.usage.unwrap(), TokenUsage::new(12, 3));
    }
}
