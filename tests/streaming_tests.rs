use futures_util::StreamExt;
use llm_orchestrator_core::client_wrapper::{DurationUsage, TokenUsage};
use llm_orchestrator_core::clients::common::StreamingHandle;
use llm_orchestrator_core::error::AdapterError;
use llm_orchestrator_core::streaming::{multiplex_stream, FramingMode};
use std::sync::Arc;
use tokio::sync::oneshot;

// Scenario A — plain streaming: "he", "llo", "!" then usage then duration,
// each as its own `data: {...}\n\n` frame, in that exact order.
#[tokio::test]
async fn plain_streaming_emits_text_then_usage_then_duration() {
    let (usage_tx, usage_rx) = oneshot::channel();
    let _ = usage_tx.send(TokenUsage::new(1, 3));
    let (duration_tx, duration_rx) = oneshot::channel();
    let _ = duration_tx.send(DurationUsage { total_duration: 42, ..DurationUsage::zero() });

    let handle = StreamingHandle {
        text_stream: Box::pin(futures_util::stream::iter(vec![
            Ok::<Arc<str>, AdapterError>(Arc::from("he")),
            Ok(Arc::from("llo")),
            Ok(Arc::from("!")),
        ])),
        final_usage: usage_rx,
        final_duration: duration_rx,
    };

    let frames: Vec<String> = multiplex_stream(handle, FramingMode::Event)
        .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
        .collect()
        .await;

    assert_eq!(frames.len(), 5);
    assert_eq!(frames[0], "data: {\"payload\":\"he\",\"type\":\"text\"}\n\n");
    assert_eq!(frames[1], "data: {\"payload\":\"llo\",\"type\":\"text\"}\n\n");
    assert_eq!(frames[2], "data: {\"payload\":\"!\",\"type\":\"text\"}\n\n");
    assert!(frames[3].contains("\"type\":\"usage\""));
    assert!(frames[3].contains("\"total_tokens\":4"));
    assert!(frames[4].contains("\"type\":\"duration\""));
}

#[tokio::test]
async fn raw_framing_passes_text_through_unframed_with_no_trailers() {
    let (_usage_tx, usage_rx) = oneshot::channel();
    let (_duration_tx, duration_rx) = oneshot::channel();

    let handle = StreamingHandle {
        text_stream: Box::pin(futures_util::stream::iter(vec![
            Ok::<Arc<str>, AdapterError>(Arc::from("hello")),
        ])),
        final_usage: usage_rx,
        final_duration: duration_rx,
    };

    let frames: Vec<String> = multiplex_stream(handle, FramingMode::Raw)
        .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
        .collect()
        .await;

    assert_eq!(frames, vec!["hello".to_string()]);
}
