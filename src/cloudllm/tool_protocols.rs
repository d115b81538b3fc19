//! Concrete tool-server transports and the protocol auto-detection / singleton
//! registry that picks between them.
//!
//! A tool server can speak one of three wire variants: MCP over server-sent
//! events, MCP over a streamable HTTP POST transport, or a plain HTTP/JSON
//! "FastAPI"-style handler. [`resolve_tool_client`] is the single entry point
//! the tool-calling loop (C4) uses: given a base URL it detects the variant at
//! most once, builds the matching [`ToolProtocol`] implementation, and caches
//! it for the process lifetime so concurrent callers share one transport.
//!
//! # Example
//!
//! ```rust,no_run
//! use llm_orchestrator_core::tool_protocols::resolve_tool_client;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = resolve_tool_client("http://localhost:8080").await?;
//! let tools = client.list_tools().await?;
//! # Ok(())
//! # }
//! ```

use crate::cloudllm::error::OrchestratorError;
use crate::cloudllm::tool_protocol::{ToolError, ToolMetadata, ToolProtocol, ToolResult};
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, OnceCell};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(15);
const CALL_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
const DETECT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DETECT_ROOT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Which of the three transport variants a base URL was detected to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedProtocol {
    McpStreamableHttp,
    McpSse,
    PlainHttp,
}

/// Runs the detection algorithm against `base_url`, trying each variant in
/// order and stopping at the first that answers. Does not cache — callers go
/// through [`resolve_tool_client`] for the cached, singleton-backed path.
pub async fn detect_protocol(
    http: &reqwest::Client,
    base_url: &str,
) -> Result<DetectedProtocol, OrchestratorError> {
    let base_url = base_url.trim_end_matches('/');

    if probe_streamable_http(http, base_url).await {
        return Ok(DetectedProtocol::McpStreamableHttp);
    }

    if probe_sse(http, base_url).await {
        return Ok(DetectedProtocol::McpSse);
    }

    if probe_plain_http_tools(http, base_url).await {
        return Ok(DetectedProtocol::PlainHttp);
    }

    if probe_root(http, base_url).await {
        return Ok(DetectedProtocol::PlainHttp);
    }

    Err(OrchestratorError::ProtocolUnknown(base_url.to_string()))
}

async fn probe_streamable_http(http: &reqwest::Client, base_url: &str) -> bool {
    let body = jsonrpc_request(1, "initialize", serde_json::json!({}));
    let probe = http
        .post(format!("{base_url}/mcp"))
        .json(&body)
        .send();
    matches!(tokio::time::timeout(DETECT_PROBE_TIMEOUT, probe).await, Ok(Ok(resp)) if resp.status().is_success())
}

async fn probe_sse(http: &reqwest::Client, base_url: &str) -> bool {
    let probe = http
        .get(format!("{base_url}/sse"))
        .header("Accept", "text/event-stream")
        .send();
    matches!(tokio::time::timeout(DETECT_PROBE_TIMEOUT, probe).await, Ok(Ok(resp)) if resp.status().is_success())
}

async fn probe_plain_http_tools(http: &reqwest::Client, base_url: &str) -> bool {
    let probe = http.get(format!("{base_url}/tools")).send();
    match tokio::time::timeout(DETECT_PROBE_TIMEOUT, probe).await {
        Ok(Ok(resp)) if resp.status().is_success() => {
            matches!(resp.json::<JsonValue>().await, Ok(v) if v.is_array() || v.is_object())
        }
        _ => false,
    }
}

async fn probe_root(http: &reqwest::Client, base_url: &str) -> bool {
    let probe = http.get(format!("{base_url}/")).send();
    matches!(tokio::time::timeout(DETECT_ROOT_PROBE_TIMEOUT, probe).await, Ok(Ok(resp)) if resp.status().is_success())
}

fn jsonrpc_request(id: u64, method: &str, params: JsonValue) -> JsonValue {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

fn parse_tool_metadata_array(value: &JsonValue) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
    let array = value
        .as_array()
        .ok_or_else(|| ToolError::ProtocolError("expected a JSON array of tool schemas".into()))?;
    let mut tools = Vec::with_capacity(array.len());
    for entry in array {
        let name = entry
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ToolError::ProtocolError("tool schema missing 'name'".into()))?
            .to_string();
        let description = entry.get("description").and_then(JsonValue::as_str).unwrap_or_default().to_string();
        tools.push(ToolMetadata::new(name, description));
    }
    Ok(tools)
}

/// Plain HTTP/JSON "FastAPI" transport: `GET <base>/tools`, `POST <base>/call`.
pub struct PlainHttpToolClient {
    base_url: String,
    http: reqwest::Client,
    tools_cache: OnceCell<Vec<ToolMetadata>>,
}

impl PlainHttpToolClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self { base_url: base_url.into(), http, tools_cache: OnceCell::new() }
    }
}

#[async_trait]
impl ToolProtocol for PlainHttpToolClient {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: JsonValue,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let call = self
            .http
            .post(format!("{}/call", self.base_url))
            .json(&serde_json::json!({ "tool_name": tool_name, "arguments": parameters }))
            .send();
        let response = tokio::time::timeout(CALL_TOOL_TIMEOUT, call)
            .await
            .map_err(|_| ToolError::ProtocolError("call_tool timed out".into()))??;
        if !response.status().is_success() {
            return Err(Box::new(ToolError::ExecutionFailed(format!(
                "tool server returned status {}",
                response.status()
            ))));
        }
        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| ToolError::ProtocolError(format!("non-JSON response body: {e}")))?;
        let result = body.get("result").cloned().unwrap_or(JsonValue::Null);
        Ok(ToolResult::success(result))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        let tools = self
            .tools_cache
            .get_or_try_init(|| async {
                let fetch = self.http.get(format!("{}/tools", self.base_url)).send();
                let response = tokio::time::timeout(LIST_TOOLS_TIMEOUT, fetch)
                    .await
                    .map_err(|_| ToolError::ProtocolError("list_tools timed out".into()))??;
                let body: JsonValue = response.json().await?;
                parse_tool_metadata_array(&body)
            })
            .await?;
        Ok(tools.clone())
    }

    async fn get_tool_metadata(&self, tool_name: &str) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
        self.list_tools()
            .await?
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| Box::new(ToolError::NotFound(tool_name.to_string())) as Box<dyn Error + Send + Sync>)
    }

    fn protocol_name(&self) -> &str {
        "plain-http"
    }
}

/// MCP-over-streamable-HTTP transport: every call is a JSON-RPC 2.0 request
/// POSTed to `<base>/mcp`. The transport may answer with a plain JSON body or
/// with a single `text/event-stream` frame carrying the JSON-RPC response.
pub struct McpStreamableHttpToolClient {
    base_url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    tools_cache: OnceCell<Vec<ToolMetadata>>,
}

impl McpStreamableHttpToolClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self { base_url: base_url.into(), http, next_id: AtomicU64::new(1), tools_cache: OnceCell::new() }
    }

    async fn call(&self, method: &str, params: JsonValue) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = jsonrpc_request(id, method, params);
        let send = self.http.post(format!("{}/mcp", self.base_url)).json(&body).send();
        let response = tokio::time::timeout(CALL_TOOL_TIMEOUT, send)
            .await
            .map_err(|_| ToolError::ProtocolError(format!("'{method}' timed out")))??;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let envelope: JsonValue = if content_type.starts_with("text/event-stream") {
            let text = response.text().await?;
            let data_line = text
                .lines()
                .find_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
                .ok_or_else(|| ToolError::ProtocolError("empty SSE response to streamable-HTTP call".into()))?;
            serde_json::from_str(data_line)?
        } else {
            response.json().await?
        };

        if let Some(error) = envelope.get("error") {
            return Err(Box::new(ToolError::ProtocolError(error.to_string())));
        }
        Ok(envelope.get("result").cloned().unwrap_or(JsonValue::Null))
    }
}

#[async_trait]
impl ToolProtocol for McpStreamableHttpToolClient {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: JsonValue,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let result = self
            .call("tools/call", serde_json::json!({ "name": tool_name, "arguments": parameters }))
            .await?;
        Ok(ToolResult::success(result))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        let tools = self
            .tools_cache
            .get_or_try_init(|| async {
                let result = self.call("tools/list", serde_json::json!({})).await?;
                let array = result.get("tools").cloned().unwrap_or(result);
                parse_tool_metadata_array(&array)
            })
            .await?;
        Ok(tools.clone())
    }

    async fn get_tool_metadata(&self, tool_name: &str) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
        self.list_tools()
            .await?
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| Box::new(ToolError::NotFound(tool_name.to_string())) as Box<dyn Error + Send + Sync>)
    }

    fn protocol_name(&self) -> &str {
        "mcp-streamable-http"
    }
}

/// MCP-over-SSE transport. The initial `GET <base>/sse` stream's first frame
/// is an `event: endpoint` announcing the session-scoped URL that subsequent
/// JSON-RPC requests must be POSTed to; responses to those requests arrive
/// asynchronously as further frames on the same SSE stream, correlated by
/// JSON-RPC `id`. A background task owns the stream and demultiplexes
/// responses to the caller awaiting each `id` via a one-shot channel.
pub struct McpSseToolClient {
    base_url: String,
    http: reqwest::Client,
    session: OnceCell<SseSession>,
    tools_cache: OnceCell<Vec<ToolMetadata>>,
}

struct SseSession {
    message_endpoint: String,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonValue>>>>,
    next_id: AtomicU64,
}

impl McpSseToolClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self { base_url: base_url.into(), http, session: OnceCell::new(), tools_cache: OnceCell::new() }
    }

    async fn session(&self) -> Result<&SseSession, Box<dyn Error + Send + Sync>> {
        self.session
            .get_or_try_init(|| async {
                let connect = self.http.get(format!("{}/sse", self.base_url)).header("Accept", "text/event-stream").send();
                let response = tokio::time::timeout(CONNECT_TIMEOUT, connect)
                    .await
                    .map_err(|_| ToolError::ProtocolError("SSE connect timed out".into()))??;

                let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonValue>>>> = Arc::new(Mutex::new(HashMap::new()));
                let (endpoint_tx, endpoint_rx) = oneshot::channel();
                let base_url = self.base_url.clone();
                let pending_for_task = pending.clone();

                tokio::spawn(async move {
                    use futures_util::StreamExt;
                    let mut byte_stream = response.bytes_stream();
                    let mut buffer = String::new();
                    let mut endpoint_tx = Some(endpoint_tx);
                    while let Some(chunk) = byte_stream.next().await {
                        let Ok(chunk) = chunk else { break };
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(frame_end) = buffer.find("\n\n") {
                            let frame: String = buffer.drain(..frame_end + 2).collect();
                            let mut event_name = "message".to_string();
                            let mut data = String::new();
                            for line in frame.lines() {
                                if let Some(rest) = line.strip_prefix("event:") {
                                    event_name = rest.trim().to_string();
                                } else if let Some(rest) = line.strip_prefix("data:") {
                                    data.push_str(rest.trim());
                                }
                            }
                            if event_name == "endpoint" {
                                let resolved = if data.starts_with("http") {
                                    data.clone()
                                } else {
                                    format!("{}{}", base_url, data)
                                };
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(resolved);
                                }
                            } else if let Ok(envelope) = serde_json::from_str::<JsonValue>(&data) {
                                if let Some(id) = envelope.get("id").and_then(JsonValue::as_u64) {
                                    if let Some(sender) = pending_for_task.lock().await.remove(&id) {
                                        let _ = sender.send(envelope);
                                    }
                                }
                            }
                        }
                    }
                });

                let message_endpoint = tokio::time::timeout(CONNECT_TIMEOUT, endpoint_rx)
                    .await
                    .map_err(|_| ToolError::ProtocolError("SSE endpoint announcement timed out".into()))?
                    .map_err(|_| ToolError::ProtocolError("SSE stream closed before endpoint announcement".into()))?;

                Ok::<SseSession, Box<dyn Error + Send + Sync>>(SseSession {
                    message_endpoint,
                    pending,
                    next_id: AtomicU64::new(1),
                })
            })
            .await
    }

    async fn call(&self, method: &str, params: JsonValue, timeout: Duration) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        let session = self.session().await?;
        let id = session.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        session.pending.lock().await.insert(id, tx);

        let body = jsonrpc_request(id, method, params);
        let post = self.http.post(&session.message_endpoint).json(&body).send();
        let response = tokio::time::timeout(timeout, post)
            .await
            .map_err(|_| ToolError::ProtocolError(format!("'{method}' timed out sending request")))??;
        if !response.status().is_success() {
            session.pending.lock().await.remove(&id);
            return Err(Box::new(ToolError::ProtocolError(format!(
                "message endpoint returned status {}",
                response.status()
            ))));
        }

        let envelope = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| ToolError::ProtocolError(format!("'{method}' timed out awaiting SSE response")))?
            .map_err(|_| ToolError::ProtocolError("SSE session closed before response arrived".into()))?;

        if let Some(error) = envelope.get("error") {
            return Err(Box::new(ToolError::ProtocolError(error.to_string())));
        }
        Ok(envelope.get("result").cloned().unwrap_or(JsonValue::Null))
    }
}

#[async_trait]
impl ToolProtocol for McpSseToolClient {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: JsonValue,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let result = self
            .call("tools/call", serde_json::json!({ "name": tool_name, "arguments": parameters }), CALL_TOOL_TIMEOUT)
            .await?;
        Ok(ToolResult::success(result))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        if let Some(cached) = self.tools_cache.get() {
            return Ok(cached.clone());
        }
        let result = self.call("tools/list", serde_json::json!({}), LIST_TOOLS_TIMEOUT).await?;
        let array = result.get("tools").cloned().unwrap_or(result);
        let tools = parse_tool_metadata_array(&array)?;
        let _ = self.tools_cache.set(tools.clone());
        Ok(tools)
    }

    async fn get_tool_metadata(&self, tool_name: &str) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
        self.list_tools()
            .await?
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| Box::new(ToolError::NotFound(tool_name.to_string())) as Box<dyn Error + Send + Sync>)
    }

    fn protocol_name(&self) -> &str {
        "mcp-sse"
    }
}

/// Process-wide, per-URL singleton registry. `resolve_tool_client` is the
/// only way client code should obtain a [`ToolProtocol`]: it runs detection
/// at most once per URL (first-writer-wins; concurrent callers for the same
/// URL await the same in-flight detection rather than racing it) and hands
/// back a shared client from then on.
static REGISTRY: Lazy<DashMap<String, Arc<OnceCell<Arc<dyn ToolProtocol>>>>> = Lazy::new(DashMap::new);

fn shared_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("failed to build the tool-server HTTP client")
}

/// Resolves (detecting and caching on first use) the [`ToolProtocol`] client
/// for `base_url`. See the module docs for the detection order.
pub async fn resolve_tool_client(base_url: &str) -> Result<Arc<dyn ToolProtocol>, OrchestratorError> {
    let slot = REGISTRY.entry(base_url.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone();

    let client = slot
        .get_or_try_init(|| async {
            let http = shared_http_client();
            let protocol = detect_protocol(&http, base_url).await?;
            let client: Arc<dyn ToolProtocol> = match protocol {
                DetectedProtocol::McpStreamableHttp => Arc::new(McpStreamableHttpToolClient::new(base_url, http)),
                DetectedProtocol::McpSse => Arc::new(McpSseToolClient::new(base_url, http)),
                DetectedProtocol::PlainHttp => Arc::new(PlainHttpToolClient::new(base_url, http)),
            };
            Ok::<Arc<dyn ToolProtocol>, OrchestratorError>(client)
        })
        .await?;

    Ok(client.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tool_metadata_array_reads_name_and_description() {
        let value = serde_json::json!([{ "name": "get_current_time", "description": "returns the time" }]);
        let tools = parse_tool_metadata_array(&value).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_current_time");
    }

    #[test]
    fn parse_tool_metadata_array_rejects_non_array() {
        let value = serde_json::json!({ "not": "an array" });
        assert!(parse_tool_metadata_array(&value).is_err());
    }

    #[tokio::test]
    async fn detect_protocol_fails_closed_against_an_unreachable_host() {
        let http = shared_http_client();
        let result = detect_protocol(&http, "http://127.0.0.1:1").await;
        assert!(matches!(result, Err(OrchestratorError::ProtocolUnknown(_))));
    }
}
