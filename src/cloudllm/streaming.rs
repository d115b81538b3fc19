//! The streaming multiplexer (C5): turns a [`StreamingHandle`] — a live text
//! stream plus two deferred metadata slots — into the single downstream byte
//! sequence the (out-of-scope) HTTP transport layer forwards to the client.
//!
//! The ordering contract is enforced by construction, not by a runtime check:
//! the producer task below only ever reaches the usage/duration branches
//! after `text_stream` has yielded `None`, and only ever reaches the
//! duration branch after the usage slot has already resolved (or been
//! skipped). A consumer that stops polling the returned stream — because a
//! write to the actual client failed — drops it mid-flight, which drops
//! `text_stream` and closes the channel the adapter's producer task is
//! sending into; that task's own `send().await.is_err()` checks (see
//! [`crate::clients::common::multiplex_raw_chunks`]) then unwind it, which is
//! how the "cancel upstream on write failure" requirement is satisfied
//! without a separate cancellation signal.
//!
//! # Example
//!
//! ```rust,no_run
//! use llm_orchestrator_core::streaming::{multiplex_stream, FramingMode};
//! use llm_orchestrator_core::clients::common::StreamingHandle;
//! use futures_util::StreamExt;
//!
//! # async fn run(handle: StreamingHandle) {
//! let mut frames = Box::pin(multiplex_stream(handle, FramingMode::Event));
//! while let Some(frame) = frames.next().await {
//!     let _frame = frame.expect("upstream stream error closes without trailers");
//! }
//! # }
//! ```

use crate::cloudllm::client_wrapper::{DurationUsage, TokenUsage};
use crate::cloudllm::clients::common::StreamingHandle;
use crate::cloudllm::error::AdapterError;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Which of the two frame formats in §4.5 to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// Text chunks only, emitted as-is. No usage/duration trailers are ever
    /// produced in this mode.
    Raw,
    /// `data: <json>\n\n` frames, one of `text`/`usage`/`duration` by `type`.
    Event,
}

fn encode_text(text: &str, mode: FramingMode) -> Bytes {
    match mode {
        FramingMode::Raw => Bytes::copy_from_slice(text.as_bytes()),
        FramingMode::Event => {
            let payload = serde_json::json!({ "type": "text", "payload": text });
            Bytes::from(format!("data: {payload}\n\n"))
        }
    }
}

fn encode_usage(usage: TokenUsage) -> Bytes {
    let payload = serde_json::json!({ "type": "usage", "payload": usage });
    Bytes::from(format!("data: {payload}\n\n"))
}

fn encode_duration(duration: DurationUsage) -> Bytes {
    let payload = serde_json::json!({ "type": "duration", "payload": duration });
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Drains `handle` into a single byte stream framed per `mode`.
///
/// Forwards every text chunk in source order; on the stream's first error,
/// forwards that error and stops without ever touching `final_usage`/
/// `final_duration` (closing without trailers, per the error-handling
/// contract). Once `text_stream` closes normally, emits the usage frame
/// (if the provider reported one) then the duration frame (if reported) —
/// both are simply omitted, never zero-filled, when the provider's deferred
/// slot resolves to nothing.
pub fn multiplex_stream(
    handle: StreamingHandle,
    mode: FramingMode,
) -> impl Stream<Item = Result<Bytes, AdapterError>> + Send {
    let StreamingHandle { mut text_stream, final_usage, final_duration } = handle;
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        loop {
            match text_stream.next().await {
                Some(Ok(text)) => {
                    if tx.send(Ok(encode_text(&text, mode))).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                None => break,
            }
        }

        if mode == FramingMode::Raw {
            return;
        }

        if let Ok(usage) = final_usage.await {
            if tx.send(Ok(encode_usage(usage))).await.is_err() {
                return;
            }
        }
        if let Ok(duration) = final_duration.await {
            let _ = tx.send(Ok(encode_duration(duration))).await;
        }
    });

    ReceiverStream::new(rx)
}
