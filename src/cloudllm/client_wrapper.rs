//! Canonical message model shared by every provider adapter and the tool-calling loop.
//!
//! This is the wire-independent schema every [`crate::clients`] adapter translates
//! into and out of. The loop in [`crate::orchestration`] only ever sees these types —
//! it never touches a provider's native JSON shape.
//!
//! # Example
//!
//! ```rust
//! use llm_orchestrator_core::client_wrapper::{Message, Role};
//! use std::sync::Arc;
//!
//! let msg = Message {
//!     role: Role::User,
//!     content: Some(Arc::from("hi")),
//!     tool_calls: None,
//!     tool_call_id: None,
//!     tool_name: None,
//! };
//! assert!(msg.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The four roles a [`Message`] can take in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single function-call request emitted by an `assistant` message.
///
/// `id` is unique within a conversation; a later `tool` message's
/// [`Message::tool_call_id`] must match it exactly (see [`Message::validate`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    /// JSON-encoded object. Adapters parse/restringify this at their own wire
    /// boundary; the loop never interprets it.
    pub arguments_json: String,
}

/// Provider-neutral description of a callable tool, as returned by
/// [`crate::tool_protocol::ToolProtocol::list_tools`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters_json_schema: serde_json::Value,
}

/// A single turn in a conversation.
///
/// `content` is absent only when an `assistant` message consists solely of
/// tool-call requests. `tool_calls` is only ever populated on `assistant`
/// messages; `tool_call_id`/`tool_name` are only ever populated on `tool`
/// messages. `tool_name` carries the original `ToolCall::function_name` the
/// result answers — adapters that correlate a tool reply by function name
/// rather than by opaque call id (Gemini's `functionResponse.name`) read it
/// from here instead of reusing `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Arc<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<Arc<str>>) -> Self {
        Self { role: Role::System, content: Some(content.into()), tool_calls: None, tool_call_id: None, tool_name: None }
    }

    pub fn user(content: impl Into<Arc<str>>) -> Self {
        Self { role: Role::User, content: Some(content.into()), tool_calls: None, tool_call_id: None, tool_name: None }
    }

    pub fn assistant(content: impl Into<Arc<str>>) -> Self {
        Self { role: Role::Assistant, content: Some(content.into()), tool_calls: None, tool_call_id: None, tool_name: None }
    }

    /// An `assistant` message carrying only tool-call requests, no text.
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: Role::Assistant, content: None, tool_calls: Some(tool_calls), tool_call_id: None, tool_name: None }
    }

    /// A `tool` message folding a call's result (or `"Error: ..."`) back into the
    /// conversation. `tool_name` is the `ToolCall::function_name` this result
    /// answers, carried alongside `tool_call_id` so adapters that correlate by
    /// function name (Gemini) have it without looking up the original call.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
        }
    }

    /// Checks the per-message shape invariants from the data model:
    /// a `tool` message must carry `tool_call_id` and `tool_name`; only
    /// `assistant` messages may carry `tool_calls`; an `assistant` message
    /// with no `tool_calls` must carry `content`.
    pub fn validate(&self) -> Result<(), String> {
        match self.role {
            Role::Tool => {
                if self.tool_call_id.is_none() {
                    return Err("tool message missing tool_call_id".into());
                }
                if self.tool_name.is_none() {
                    return Err("tool message missing tool_name".into());
                }
            }
            _ => {
                if self.tool_call_id.is_some() {
                    return Err("tool_call_id set on a non-tool message".into());
                }
                if self.tool_name.is_some() {
                    return Err("tool_name set on a non-tool message".into());
                }
            }
        }
        if !matches!(self.role, Role::Assistant) && self.tool_calls.is_some() {
            return Err("tool_calls set on a non-assistant message".into());
        }
        if matches!(self.role, Role::Assistant)
            && self.content.is_none()
            && self.tool_calls.as_ref().map_or(true, |v| v.is_empty())
        {
            return Err("assistant message has neither content nor tool_calls".into());
        }
        Ok(())
    }
}

/// Validates conversation-level invariants across a full message list: every
/// `tool` message's `tool_call_id` must match a `ToolCall.id` emitted by the
/// nearest preceding `assistant` batch, and that batch's calls must be covered
/// by tool messages before the next `assistant` turn.
pub fn validate_conversation(messages: &[Message]) -> Result<(), String> {
    let mut pending: Vec<String> = Vec::new();
    for msg in messages {
        msg.validate()?;
        match msg.role {
            Role::Assistant => {
                pending = msg
                    .tool_calls
                    .as_ref()
                    .map(|calls| calls.iter().map(|c| c.id.clone()).collect())
                    .unwrap_or_default();
            }
            Role::Tool => {
                let id = msg.tool_call_id.as_ref().expect("validated above");
                match pending.iter().position(|p| p == id) {
                    Some(pos) => {
                        pending.remove(pos);
                    }
                    None => {
                        return Err(format!(
                            "tool message references unknown or already-fulfilled tool_call_id {id}"
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Token accounting for one or more LLM round-trips. `total_tokens` is an
/// invariant equal to `prompt_tokens + completion_tokens` after normalization
/// — see [`TokenUsage::normalized`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self { prompt_tokens, completion_tokens, total_tokens: prompt_tokens + completion_tokens }
    }

    /// Recomputes `total_tokens` from the two components, restoring the
    /// invariant after a provider reports a mismatched total.
    pub fn normalized(mut self) -> Self {
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
        self
    }
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;
    fn add(self, rhs: Self) -> Self::Output {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Nanosecond timing breakdown of a model round-trip. Components a provider
/// does not report are left at `0`.
///
/// Accumulation across calls — including calls made concurrently within one
/// tool-call batch — is componentwise addition (see `DESIGN.md` for why this
/// was chosen over a wall-clock approximation).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DurationUsage {
    pub total_duration: u64,
    pub load_duration: u64,
    pub prompt_eval_duration: u64,
    pub eval_duration: u64,
}

impl DurationUsage {
    pub fn zero() -> Self {
        Self::default()
    }
}

impl std::ops::Add for DurationUsage {
    type Output = DurationUsage;
    fn add(self, rhs: Self) -> Self::Output {
        DurationUsage {
            total_duration: self.total_duration + rhs.total_duration,
            load_duration: self.load_duration + rhs.load_duration,
            prompt_eval_duration: self.prompt_eval_duration + rhs.prompt_eval_duration,
            eval_duration: self.eval_duration + rhs.eval_duration,
        }
    }
}

impl std::ops::AddAssign for DurationUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
