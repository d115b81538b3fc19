//! The tool-calling loop (C4) and the timeout/cancellation harness (C6) that
//! wraps every call it makes into a provider adapter (C3).
//!
//! [`run_tool_calling_loop`] is the state machine named in the component
//! design: S0 Start → S1 AwaitModel → S2 DispatchTools → S3 Fold → S4
//! StreamOut/S5 Done, or S6 Failed on any unrecoverable error. The states
//! aren't reified as an enum — each arm of the loop body below is named with
//! the state it corresponds to, the way a state machine driven by a `loop`
//! and a `match` is conventionally written rather than as an explicit
//! transition table.
//!
//! # Example
//!
//! ```rust,no_run
//! use llm_orchestrator_core::clients::openai::OpenAiCompatibleAdapter;
//! use llm_orchestrator_core::config::GenerationConfig;
//! use llm_orchestrator_core::client_wrapper::Message;
//! use llm_orchestrator_core::orchestration::{run_tool_calling_loop, LoopOutcome};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = OpenAiCompatibleAdapter::new("https://api.openai.com/v1", "sk-...", "gpt-4.1-mini");
//! let config = GenerationConfig { stream: false, ..GenerationConfig::default() };
//! let outcome = run_tool_calling_loop(&adapter, None, vec![Message::user("hi")], &config).await?;
//! match outcome {
//!     LoopOutcome::Final(answer) => println!("{:?}", answer.content),
//!     LoopOutcome::Streaming(_) => unreachable!("stream was not requested"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::cloudllm::client_wrapper::{
    validate_conversation, DurationUsage, Message, TokenUsage, ToolCall, ToolSchema,
};
use crate::cloudllm::clients::common::{ProviderAdapter, ProviderCall, ProviderResponse, StreamingHandle};
use crate::cloudllm::config::GenerationConfig;
use crate::cloudllm::error::{AdapterError, OrchestratorError};
use crate::cloudllm::tool_protocol::ToolProtocol;
use futures_util::future::join_all;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// S5 Done: a final, non-streaming answer with grand totals already folded in.
#[derive(Debug, Clone)]
pub struct FinalAnswer {
    pub content: Option<Arc<str>>,
    pub usage: TokenUsage,
    pub duration: DurationUsage,
}

/// What the loop resolves to: a final answer (S5) or a handle the caller
/// hands to the streaming multiplexer (C5) to reach S4 → S5.
pub enum LoopOutcome {
    Final(FinalAnswer),
    Streaming(StreamingHandle),
}

fn tool_to_wire_schema(schema: &ToolSchema) -> JsonValue {
    serde_json::json!({
        "name": schema.name,
        "description": schema.description,
        "parameters": schema.parameters_json_schema,
    })
}

/// C6: races a single upstream call against `timeout_ms`. Dropping the
/// inner future on timeout is how the abort token is honored — `reqwest`
/// tears down the in-flight connection when its response future is dropped,
/// so no separate cancellation signal needs to be threaded through.
async fn with_deadline<T, F>(timeout_ms: u64, fut: F) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(OrchestratorError::from(err)),
        Err(_) => Err(OrchestratorError::Timeout(format!("upstream call exceeded {timeout_ms}ms"))),
    }
}

/// Resolves the tool schemas to offer the model for this request.
/// `list_tools` failures are swallowed with a warning per the error table —
/// the loop proceeds as though no tools were configured.
async fn resolve_tool_schemas(tool_client: Option<&Arc<dyn ToolProtocol>>) -> Vec<JsonValue> {
    let Some(client) = tool_client else { return Vec::new() };
    match client.list_tools().await {
        Ok(tools) => tools.iter().map(|t| tool_to_wire_schema(&t.to_tool_schema())).collect(),
        Err(err) => {
            log::warn!("tool discovery failed, proceeding without tools: {err}");
            Vec::new()
        }
    }
}

/// S2 → S3: dispatches every tool call in the batch concurrently, then folds
/// the results back in declaration order regardless of completion order. A
/// failed individual call becomes an `"Error: ..."` tool message rather than
/// aborting the loop.
async fn dispatch_tool_batch(
    tool_client: &Arc<dyn ToolProtocol>,
    calls: &[ToolCall],
    timeout_ms: u64,
) -> Vec<Message> {
    let futures = calls.iter().map(|call| {
        let tool_client = tool_client.clone();
        let call = call.clone();
        async move {
            let arguments: JsonValue =
                serde_json::from_str(&call.arguments_json).unwrap_or_else(|_| serde_json::json!({}));
            let outcome = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                tool_client.execute(&call.function_name, arguments),
            )
            .await;
            let body = match outcome {
                Ok(Ok(result)) if result.success => result.output.to_string(),
                Ok(Ok(result)) => format!("Error: {}", result.error.unwrap_or_else(|| "tool reported failure".into())),
                Ok(Err(err)) => format!("Error: {err}"),
                Err(_) => format!("Error: tool '{}' timed out after {timeout_ms}ms", call.function_name),
            };
            Message::tool_result(call.id.clone(), call.function_name.clone(), body)
        }
    });
    join_all(futures).await
}

/// Folds `usage_acc`/`duration_acc` into the terminal turn's deferred values,
/// resolving them only once the underlying provider promise resolves — and
/// only if the provider actually reported the metric, so an unreported
/// metric stays unreported rather than silently becoming the running total.
fn fold_running_totals_into_handle(
    handle: StreamingHandle,
    usage_acc: TokenUsage,
    duration_acc: DurationUsage,
) -> StreamingHandle {
    let StreamingHandle { text_stream, final_usage, final_duration } = handle;

    let (usage_tx, usage_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok(terminal_usage) = final_usage.await {
            let _ = usage_tx.send(usage_acc + terminal_usage);
        }
    });

    let (duration_tx, duration_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok(terminal_duration) = final_duration.await {
            let _ = duration_tx.send(duration_acc + terminal_duration);
        }
    });

    StreamingHandle { text_stream, final_usage: usage_rx, final_duration: duration_rx }
}

/// Drives the state machine described in the module docs to completion.
/// `tool_client` is `None` when the request carried no `mcp_server_url`.
pub async fn run_tool_calling_loop(
    adapter: &dyn ProviderAdapter,
    tool_client: Option<Arc<dyn ToolProtocol>>,
    initial_messages: Vec<Message>,
    config: &GenerationConfig,
) -> Result<LoopOutcome, OrchestratorError> {
    // S0 Start
    if initial_messages.is_empty() {
        return Err(OrchestratorError::InvalidRequest("message list is empty".into()));
    }
    validate_conversation(&initial_messages).map_err(OrchestratorError::InvalidRequest)?;

    let tool_schemas = resolve_tool_schemas(tool_client.as_ref()).await;
    let mut messages = initial_messages;
    let mut iter: u32 = 0;
    let mut usage_acc = TokenUsage::zero();
    let mut duration_acc = DurationUsage::zero();

    loop {
        // S1 AwaitModel
        let call = with_deadline(config.timeout_ms, adapter.send(&messages, &tool_schemas, config)).await?;

        match call {
            ProviderCall::Complete(ProviderResponse { content, tool_calls: Some(calls), usage, duration })
                if !calls.is_empty() =>
            {
                usage_acc += usage.unwrap_or_else(TokenUsage::zero);
                duration_acc += duration.unwrap_or_else(DurationUsage::zero);

                if iter == config.max_tool_calls {
                    return Err(OrchestratorError::MaxIterationsExceeded { max_tool_calls: config.max_tool_calls });
                }

                // S1 -> S2: record the assistant's tool-call batch.
                let _ = content; // an assistant turn with pending tool calls carries no answer text
                messages.push(Message::assistant_tool_calls(calls.clone()));

                // S2 -> S3: fan out concurrently, fold back in declared order.
                let tool_messages = match &tool_client {
                    Some(client) => dispatch_tool_batch(client, &calls, config.timeout_ms).await,
                    None => calls
                        .iter()
                        .map(|c| {
                            Message::tool_result(
                                c.id.clone(),
                                c.function_name.clone(),
                                "Error: no tool server configured for this request",
                            )
                        })
                        .collect(),
                };
                messages.extend(tool_messages);

                // S3 -> S1
                iter += 1;
            }
            ProviderCall::Complete(ProviderResponse { content, usage, duration, .. }) => {
                // S1 -> S5: final answer, non-streaming (or streaming-mode fallback).
                usage_acc += usage.unwrap_or_else(TokenUsage::zero);
                duration_acc += duration.unwrap_or_else(DurationUsage::zero);
                return Ok(LoopOutcome::Final(FinalAnswer { content, usage: usage_acc, duration: duration_acc }));
            }
            ProviderCall::Streaming(handle) => {
                // S1 -> S4: hand off to the streaming multiplexer (C5).
                return Ok(LoopOutcome::Streaming(fold_running_totals_into_handle(handle, usage_acc, duration_acc)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedAdapter {
        responses: Mutex<Vec<ProviderCall>>,
    }

    fn complete(content: &str, tool_calls: Option<Vec<ToolCall>>) -> ProviderCall {
        ProviderCall::Complete(ProviderResponse {
            content: if content.is_empty() { None } else { Some(Arc::from(content)) },
            tool_calls,
            usage: Some(TokenUsage::new(5, 1)),
            duration: Some(DurationUsage::zero()),
        })
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn family_name(&self) -> &str {
            "scripted"
        }

        async fn send(
            &self,
            _messages: &[Message],
            _tools_json_schema: &[JsonValue],
            _config: &GenerationConfig,
        ) -> Result<ProviderCall, AdapterError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(AdapterError::protocol("script exhausted"));
            }
            Ok(responses.remove(0))
        }
    }

    struct EchoToolClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolProtocol for EchoToolClient {
        async fn execute(
            &self,
            tool_name: &str,
            parameters: JsonValue,
        ) -> Result<crate::cloudllm::tool_protocol::ToolResult, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(crate::cloudllm::tool_protocol::ToolResult::success(
                serde_json::json!({ "tool": tool_name, "echo": parameters }),
            ))
        }

        async fn list_tools(
            &self,
        ) -> Result<Vec<crate::cloudllm::tool_protocol::ToolMetadata>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(vec![])
        }

        async fn get_tool_metadata(
            &self,
            _tool_name: &str,
        ) -> Result<crate::cloudllm::tool_protocol::ToolMetadata, Box<dyn std::error::Error + Send + Sync>> {
            Err("not found".into())
        }

        fn protocol_name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn empty_message_list_is_rejected() {
        let adapter = ScriptedAdapter { responses: Mutex::new(vec![]) };
        let result = run_tool_calling_loop(&adapter, None, vec![], &GenerationConfig::default()).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn final_answer_with_no_tool_calls_reaches_s5() {
        let adapter = ScriptedAdapter { responses: Mutex::new(vec![complete("hi there", None)]) };
        let config = GenerationConfig { stream: false, ..GenerationConfig::default() };
        let outcome = run_tool_calling_loop(&adapter, None, vec![Message::user("hi")], &config).await.unwrap();
        match outcome {
            LoopOutcome::Final(answer) => assert_eq!(answer.content.unwrap().as_ref(), "hi there"),
            LoopOutcome::Streaming(_) => panic!("expected a final answer"),
        }
    }

    #[tokio::test]
    async fn tool_dispatch_then_final_answer_accumulates_usage() {
        let tool_call = ToolCall { id: "t1".into(), function_name: "get_weather".into(), arguments_json: "{}".into() };
        let adapter = ScriptedAdapter {
            responses: Mutex::new(vec![complete("", Some(vec![tool_call])), complete("done", None)]),
        };
        let tool_client: Arc<dyn ToolProtocol> = Arc::new(EchoToolClient { calls: AtomicUsize::new(0) });
        let config = GenerationConfig { stream: false, max_tool_calls: 5, ..GenerationConfig::default() };
        let outcome = run_tool_calling_loop(&adapter, Some(tool_client), vec![Message::user("weather?")], &config)
            .await
            .unwrap();
        match outcome {
            LoopOutcome::Final(answer) => {
                assert_eq!(answer.content.unwrap().as_ref(), "done");
                assert_eq!(answer.usage, TokenUsage::new(10, 2));
            }
            LoopOutcome::Streaming(_) => panic!("expected a final answer"),
        }
    }

    #[tokio::test]
    async fn max_tool_calls_zero_raises_before_dispatch_when_model_asks_for_tools() {
        let tool_call = ToolCall { id: "t1".into(), function_name: "get_weather".into(), arguments_json: "{}".into() };
        let adapter = ScriptedAdapter { responses: Mutex::new(vec![complete("", Some(vec![tool_call]))]) };
        let config = GenerationConfig { stream: false, max_tool_calls: 0, ..GenerationConfig::default() };
        let result = run_tool_calling_loop(&adapter, None, vec![Message::user("weather?")], &config).await;
        assert!(matches!(result, Err(OrchestratorError::MaxIterationsExceeded { max_tool_calls: 0 })));
    }

    #[tokio::test]
    async fn streaming_outcome_folds_running_totals_into_terminal_usage() {
        let first_tool_call = ToolCall { id: "t1".into(), function_name: "noop".into(), arguments_json: "{}".into() };
        let streaming_call = ProviderCall::Streaming(StreamingHandle {
            text_stream: Box::pin(stream::iter(vec![Ok::<Arc<str>, AdapterError>(Arc::from("final chunk"))])),
            final_usage: {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(TokenUsage::new(2, 2));
                rx
            },
            final_duration: {
                let (_tx, rx) = oneshot::channel();
                rx
            },
        });
        let adapter =
            ScriptedAdapter { responses: Mutex::new(vec![complete("", Some(vec![first_tool_call])), streaming_call]) };
        let tool_client: Arc<dyn ToolProtocol> = Arc::new(EchoToolClient { calls: AtomicUsize::new(0) });
        let config = GenerationConfig { stream: true, ..GenerationConfig::default() };
        let outcome =
            run_tool_calling_loop(&adapter, Some(tool_client), vec![Message::user("hi")], &config).await.unwrap();
        match outcome {
            LoopOutcome::Streaming(handle) => {
                let usage = handle.final_usage.await.unwrap();
                assert_eq!(usage, TokenUsage::new(5, 1) + TokenUsage::new(2, 2));
                assert!(handle.final_duration.await.is_err());
            }
            LoopOutcome::Final(_) => panic!("expected a streaming outcome"),
        }
    }
}
