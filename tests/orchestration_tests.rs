use async_trait::async_trait;
use llm_orchestrator_core::client_wrapper::{DurationUsage, Message, TokenUsage, ToolCall};
use llm_orchestrator_core::clients::common::{ProviderAdapter, ProviderCall, ProviderResponse};
use llm_orchestrator_core::config::GenerationConfig;
use llm_orchestrator_core::error::AdapterError;
use llm_orchestrator_core::orchestration::{run_tool_calling_loop, LoopOutcome};
use llm_orchestrator_core::tool_protocol::{ToolMetadata, ToolProtocol, ToolResult};
use serde_json::Value as JsonValue;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct ScriptedAdapter {
    turns: Mutex<Vec<ProviderResponse>>,
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
        let mut turns = self.turns.lock().unwrap();
        if turns.is_empty() {
            return Err(AdapterError::protocol("scripted adapter ran out of turns"));
        }
        Ok(ProviderCall::Complete(turns.remove(0)))
    }
}

struct ClockTool {
    calls: AtomicUsize,
}

#[async_trait]
impl ToolProtocol for ClockTool {
    async fn execute(
        &self,
        tool_name: &str,
        _parameters: JsonValue,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match tool_name {
            "get_current_time" => Ok(ToolResult::success(serde_json::json!("2025-01-01T00:00:00Z"))),
            other => Err(format!("unknown tool {other}").into()),
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![ToolMetadata::new("get_current_time", "returns the current time")])
    }

    async fn get_tool_metadata(&self, tool_name: &str) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
        Err(format!("no metadata for {tool_name}").into())
    }

    fn protocol_name(&self) -> &str {
        "in-memory"
    }
}

// Scenario B: one tool hop, cumulative usage across both turns.
#[tokio::test]
async fn one_tool_hop_accumulates_usage_across_turns() {
    let adapter = ScriptedAdapter {
        turns: Mutex::new(vec![
            ProviderResponse {
                content: None,
                tool_calls: Some(vec![ToolCall {
                    id: "t1".into(),
                    function_name: "get_current_time".into(),
                    arguments_json: "{}".into(),
                }]),
                usage: Some(TokenUsage::new(10, 2)),
                duration: None,
            },
            ProviderResponse {
                content: Some(Arc::from("It is 2025-01-01T00:00:00Z")),
                tool_calls: None,
                usage: Some(TokenUsage::new(15, 8)),
                duration: None,
            },
        ]),
    };
    let tool_client: Arc<dyn ToolProtocol> = Arc::new(ClockTool { calls: AtomicUsize::new(0) });
    let config = GenerationConfig { stream: false, ..GenerationConfig::default() };

    let outcome =
        run_tool_calling_loop(&adapter, Some(tool_client), vec![Message::user("what time is it?")], &config)
            .await
            .unwrap();

    match outcome {
        LoopOutcome::Final(answer) => {
            assert_eq!(answer.content.unwrap().as_ref(), "It is 2025-01-01T00:00:00Z");
            assert_eq!(answer.usage, TokenUsage::new(25, 10));
        }
        LoopOutcome::Streaming(_) => panic!("expected a final answer"),
    }
}

// Scenario C: a failing tool call is folded into an "Error: ..." message and
// the loop recovers rather than aborting.
#[tokio::test]
async fn tool_failure_is_folded_into_error_message_and_loop_recovers() {
    let adapter = ScriptedAdapter {
        turns: Mutex::new(vec![
            ProviderResponse {
                content: None,
                tool_calls: Some(vec![ToolCall {
                    id: "t1".into(),
                    function_name: "unknown_tool".into(),
                    arguments_json: "{}".into(),
                }]),
                usage: Some(TokenUsage::new(5, 1)),
                duration: None,
            },
            ProviderResponse {
                content: Some(Arc::from("Sorry, I can't do that.")),
                tool_calls: None,
                usage: Some(TokenUsage::new(8, 4)),
                duration: None,
            },
        ]),
    };
    let tool_client: Arc<dyn ToolProtocol> = Arc::new(ClockTool { calls: AtomicUsize::new(0) });
    let config = GenerationConfig { stream: false, ..GenerationConfig::default() };

    let outcome = run_tool_calling_loop(&adapter, Some(tool_client), vec![Message::user("do the thing")], &config)
        .await
        .unwrap();

    match outcome {
        LoopOutcome::Final(answer) => assert_eq!(answer.content.unwrap().as_ref(), "Sorry, I can't do that."),
        LoopOutcome::Streaming(_) => panic!("expected a final answer"),
    }
}

// Scenario D: the model keeps requesting tools past the iteration cap.
#[tokio::test]
async fn iteration_cap_raises_max_iterations_exceeded() {
    let tool_call_turn = |id: &str| ProviderResponse {
        content: None,
        tool_calls: Some(vec![ToolCall { id: id.into(), function_name: "get_current_time".into(), arguments_json: "{}".into() }]),
        usage: Some(TokenUsage::new(1, 1)),
        duration: None,
    };
    let adapter = ScriptedAdapter {
        turns: Mutex::new(vec![tool_call_turn("t1"), tool_call_turn("t2"), tool_call_turn("t3")]),
    };
    let tool_client: Arc<dyn ToolProtocol> = Arc::new(ClockTool { calls: AtomicUsize::new(0) });
    let config = GenerationConfig { stream: false, max_tool_calls: 2, ..GenerationConfig::default() };

    let result = run_tool_calling_loop(&adapter, Some(tool_client), vec![Message::user("loop forever?")], &config).await;

    assert!(matches!(
        result,
        Err(llm_orchestrator_core::error::OrchestratorError::MaxIterationsExceeded { max_tool_calls: 2 })
    ));
}

#[tokio::test]
async fn empty_message_list_is_invalid_request() {
    let adapter = ScriptedAdapter { turns: Mutex::new(vec![]) };
    let result = run_tool_calling_loop(&adapter, None, vec![], &GenerationConfig::default()).await;
    assert!(matches!(
        result,
        Err(llm_orchestrator_core::error::OrchestratorError::InvalidRequest(_))
    ));
}

// DurationUsage is additive across turns, including across a parallel tool
// batch — the Open Question this crate resolves as "sum of work done".
#[tokio::test]
async fn duration_accumulates_across_turns() {
    let adapter = ScriptedAdapter {
        turns: Mutex::new(vec![
            ProviderResponse {
                content: None,
                tool_calls: Some(vec![ToolCall { id: "t1".into(), function_name: "get_current_time".into(), arguments_json: "{}".into() }]),
                usage: Some(TokenUsage::zero()),
                duration: Some(DurationUsage { total_duration: 100, ..DurationUsage::zero() }),
            },
            ProviderResponse {
                content: Some(Arc::from("done")),
                tool_calls: None,
                usage: Some(TokenUsage::zero()),
                duration: Some(DurationUsage { total_duration: 50, ..DurationUsage::zero() }),
            },
        ]),
    };
    let tool_client: Arc<dyn ToolProtocol> = Arc::new(ClockTool { calls: AtomicUsize::new(0) });
    let config = GenerationConfig { stream: false, ..GenerationConfig::default() };

    let outcome = run_tool_calling_loop(&adapter, Some(tool_client), vec![Message::user("hi")], &config).await.unwrap();
    match outcome {
        LoopOutcome::Final(answer) => assert_eq!(answer.duration.total_duration, 150),
        LoopOutcome::Streaming(_) => panic!("expected a final answer"),
    }
}
