//! Shared plumbing for provider adapters (C3): the [`ProviderAdapter`] trait
//! every family implements, the [`ProviderResponse`]/[`StreamingHandle`]
//! return shapes, the pooled [`reqwest::Client`], and
//! [`multiplex_raw_chunks`] — the generic "inspect the first non-empty
//! chunk" discrimination every streaming-capable family reduces to once it
//! has parsed its own wire deltas into [`RawChunk`]s.
//!
//! Individual families ([`crate::clients::openai`], [`crate::clients::gemini`],
//! [`crate::clients::ollama`]) only need to know how to serialize canonical
//! [`Message`]s into their native request body and how to parse one native
//! delta into a [`RawChunk`]; everything downstream of that is common.

use crate::cloudllm::client_wrapper::{DurationUsage, Message, ToolCall, TokenUsage};
use crate::cloudllm::config::GenerationConfig;
use crate::cloudllm::error::AdapterError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use lazy_static::lazy_static;
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling, reused by every
    /// provider adapter so TLS sessions and DNS lookups stay warm across
    /// requests to the same upstream.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build the shared provider HTTP client");
}

pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// A provider's reply when no tool calls are pending: either it is final
/// (`tool_calls` empty) or it is a dispatch turn the loop (C4) must fan out.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub content: Option<Arc<str>>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub usage: Option<TokenUsage>,
    pub duration: Option<DurationUsage>,
}

/// A terminal streaming turn. `text_stream` is finite and not restartable;
/// `final_usage`/`final_duration` resolve only once it has fully drained —
/// and resolve to nothing at all if the provider never reported the metric,
/// matching the "omitted, never partial" framing contract in C5.
pub struct StreamingHandle {
    pub text_stream: Pin<Box<dyn Stream<Item = Result<Arc<str>, AdapterError>> + Send>>,
    pub final_usage: oneshot::Receiver<TokenUsage>,
    pub final_duration: oneshot::Receiver<DurationUsage>,
}

/// What a call into a provider adapter resolves to: a complete response
/// (dispatch turn or final answer) or a handle onto an in-flight stream.
pub enum ProviderCall {
    Complete(ProviderResponse),
    Streaming(StreamingHandle),
}

/// One decoded unit from a provider's native wire stream, as produced by a
/// family's own delta parser and fed into [`multiplex_raw_chunks`].
pub enum RawChunk {
    Text(Arc<str>),
    ToolCalls(Vec<ToolCall>),
    Usage(TokenUsage),
    Duration(DurationUsage),
}

/// Trait every provider family implements. The loop (C4) calls `send`
/// exactly once per iteration and branches on the returned [`ProviderCall`];
/// it never sees a provider's native request/response shape.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Family identifier for logging, e.g. `"gemini"`, `"ollama"`, `"openai-compatible"`.
    fn family_name(&self) -> &str;

    async fn send(
        &self,
        messages: &[Message],
        tools_json_schema: &[serde_json::Value],
        config: &GenerationConfig,
    ) -> Result<ProviderCall, AdapterError>;
}

/// Implements the "inspect the first non-empty chunk" discrimination rule
/// (§4.3) generically over any family's [`RawChunk`] producer: pulls chunks
/// off `rx` until the first `Text` or `ToolCalls` arrives, then either drains
/// the rest for accounting (tool-call turn) or hands back a live stream that
/// replays the already-consumed first chunk before forwarding the remainder.
pub async fn multiplex_raw_chunks(
    mut rx: mpsc::Receiver<Result<RawChunk, AdapterError>>,
) -> Result<ProviderCall, AdapterError> {
    let mut leading_usage = None;
    let mut leading_duration = None;

    let first = loop {
        match rx.recv().await {
            Some(Ok(RawChunk::Usage(u))) => leading_usage = Some(u),
            Some(Ok(RawChunk::Duration(d))) => leading_duration = Some(d),
            other => break other,
        }
    };

    match first {
        None => Ok(ProviderCall::Complete(ProviderResponse {
            content: None,
            tool_calls: None,
            usage: Some(leading_usage.unwrap_or_else(TokenUsage::zero)),
            duration: leading_duration,
        })),
        Some(Err(e)) => Err(e),
        Some(Ok(RawChunk::ToolCalls(calls))) => {
            let mut usage = leading_usage;
            let mut duration = leading_duration;
            while let Some(item) = rx.recv().await {
                match item {
                    Ok(RawChunk::Usage(u)) => usage = Some(u),
                    Ok(RawChunk::Duration(d)) => duration = Some(d),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(ProviderCall::Complete(ProviderResponse { content: None, tool_calls: Some(calls), usage, duration }))
        }
        Some(Ok(RawChunk::Text(first_text))) => {
            let (usage_tx, usage_rx) = oneshot::channel();
            let (duration_tx, duration_rx) = oneshot::channel();
            let (text_tx, text_rx) = mpsc::channel::<Result<Arc<str>, AdapterError>>(32);

            tokio::spawn(async move {
                if text_tx.send(Ok(first_text)).await.is_err() {
                    return;
                }
                let mut usage = leading_usage;
                let mut duration = leading_duration;
                while let Some(item) = rx.recv().await {
                    match item {
                        Ok(RawChunk::Text(t)) => {
                            if text_tx.send(Ok(t)).await.is_err() {
                                return;
                            }
                        }
                        Ok(RawChunk::Usage(u)) => usage = Some(u),
                        Ok(RawChunk::Duration(d)) => duration = Some(d),
                        Ok(RawChunk::ToolCalls(_)) => {
                            // A tool-call part arriving after text has already started is a
                            // protocol surprise from the upstream, not a recoverable shape;
                            // the discrimination rule only applies to the first chunk.
                        }
                        Err(e) => {
                            let _ = text_tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                if let Some(u) = usage {
                    let _ = usage_tx.send(u);
                }
                if let Some(d) = duration {
                    let _ = duration_tx.send(d);
                }
            });

            Ok(ProviderCall::Streaming(StreamingHandle {
                text_stream: Box::pin(ReceiverStream::new(text_rx)),
                final_usage: usage_rx,
                final_duration: duration_rx,
            }))
        }
        Some(Ok(RawChunk::Usage(_))) | Some(Ok(RawChunk::Duration(_))) => unreachable!("drained above"),
    }
}

/// Reads an SSE-framed (`data: ...\n\n`) body into owned frame strings.
/// Shared by the Gemini and OpenAI-compatible families; Ollama uses
/// newline-delimited JSON instead and parses its own framing.
pub fn sse_data_lines(
    mut byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin + Send + 'static,
) -> impl Stream<Item = Result<String, AdapterError>> + Send {
    async_io_lines(move |tx: mpsc::Sender<Result<String, AdapterError>>| async move {
        let mut buffer = String::new();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(Err(AdapterError::transport(e.to_string()))).await;
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(frame_end) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..frame_end + 2).collect();
                for line in frame.lines() {
                    if let Some(data) = line.strip_prefix("data:") {
                        let data = data.trim();
                        if data == "[DONE]" {
                            return;
                        }
                        if tx.send(Ok(data.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// Reads a newline-delimited-JSON body (Ollama's streaming framing — one
/// complete JSON object per line, no `data:` prefix) into owned line strings.
pub fn ndjson_lines(
    mut byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin + Send + 'static,
) -> impl Stream<Item = Result<String, AdapterError>> + Send {
    async_io_lines(move |tx: mpsc::Sender<Result<String, AdapterError>>| async move {
        let mut buffer = String::new();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(Err(AdapterError::transport(e.to_string()))).await;
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();
                if !line.is_empty() && tx.send(Ok(line.to_string())).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Spawns `producer` against a fresh channel and returns the receiver side as
/// a stream — the shape every line-oriented wire parser in this module needs.
fn async_io_lines<F, Fut>(producer: F) -> impl Stream<Item = Result<String, AdapterError>> + Send
where
    F: FnOnce(mpsc::Sender<Result<String, AdapterError>>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(producer(tx));
    ReceiverStream::new(rx)
}

/// Builds the canonical error a non-2xx HTTP response becomes, reading the
/// body for context when one is available.
pub async fn http_status_error(response: reqwest::Response) -> AdapterError {
    let status = response.status();
    let kind = if status.as_u16() == 401 || status.as_u16() == 403 {
        crate::cloudllm::error::AdapterErrorKind::Auth
    } else {
        crate::cloudllm::error::AdapterErrorKind::Transport
    };
    let body = response.text().await.unwrap_or_default();
    AdapterError::new(kind, format!("HTTP {status}: {body}"))
}

pub fn box_err(e: impl Error + Send + Sync + 'static) -> AdapterError {
    AdapterError::transport(e.to_string())
}
