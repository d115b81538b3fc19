//! Error taxonomy shared by every component, matching the propagation policy
//! each caller depends on: some kinds cross a component boundary and must be
//! matched on by name (`ToolInvocationError` is folded into a message rather
//! than aborting; `ToolDiscoveryError` is logged and swallowed), so this is a
//! closed set of concrete variants rather than an opaque boxed error.
//!
//! Implemented with manual `Display`/`Error` impls rather than a derive
//! macro, mirroring [`crate::tool_protocol::ToolError`]'s own style.

use std::error::Error;
use std::fmt;

/// The kind of failure an [`AdapterError`] (C3) represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    Timeout,
    Transport,
    Protocol,
    Auth,
    InvalidResponse,
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterErrorKind::Timeout => "timeout",
            AdapterErrorKind::Transport => "transport",
            AdapterErrorKind::Protocol => "protocol",
            AdapterErrorKind::Auth => "auth",
            AdapterErrorKind::InvalidResponse => "invalid_response",
        };
        write!(f, "{s}")
    }
}

/// A provider-adapter (C3) failure.
#[derive(Debug)]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Transport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Protocol, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Auth, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::InvalidResponse, message)
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adapter error ({}): {}", self.kind, self.message)
    }
}

impl Error for AdapterError {}

/// Every failure mode the orchestration core can surface, matching the
/// taxonomy and propagation table.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Malformed request: empty message list, unparseable `selectedModel`. Surfaced as 400.
    InvalidRequest(String),
    /// A per-upstream-call deadline (C6) fired. Surfaced as 500.
    Timeout(String),
    /// A provider adapter (C3) failure. Surfaced as 500.
    Adapter(AdapterError),
    /// A `call_tool` (C2) failure. The loop (C4) catches this itself and
    /// folds it into a `tool` message — this variant exists for call sites
    /// that need to represent the failure before it is folded (e.g. logging,
    /// or propagating out of `call_tool` itself).
    ToolInvocation { tool_name: String, cause: String },
    /// A `list_tools` (C2) failure. The loop swallows this with a warning log
    /// and proceeds without tools; it is only surfaced directly to a caller
    /// that explicitly probes a tool server (the `/mcp-test` endpoint).
    ToolDiscovery(String),
    /// Protocol auto-detection (C2) exhausted every variant. Equivalent to
    /// `ToolDiscovery` unless the caller is an explicit probe.
    ProtocolUnknown(String),
    /// The tool-calling loop (C4) hit `max_tool_calls` with tool calls still
    /// pending. Surfaced as 500.
    MaxIterationsExceeded { max_tool_calls: u32 },
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            OrchestratorError::Timeout(msg) => write!(f, "timeout: {msg}"),
            OrchestratorError::Adapter(err) => write!(f, "{err}"),
            OrchestratorError::ToolInvocation { tool_name, cause } => {
                write!(f, "tool '{tool_name}' invocation failed: {cause}")
            }
            OrchestratorError::ToolDiscovery(msg) => write!(f, "tool discovery failed: {msg}"),
            OrchestratorError::ProtocolUnknown(url) => {
                write!(f, "could not detect a tool protocol at {url}")
            }
            OrchestratorError::MaxIterationsExceeded { max_tool_calls } => {
                write!(f, "tool-calling loop exceeded max_tool_calls ({max_tool_calls})")
            }
        }
    }
}

impl Error for OrchestratorError {}

impl From<AdapterError> for OrchestratorError {
    fn from(err: AdapterError) -> Self {
        OrchestratorError::Adapter(err)
    }
}

impl OrchestratorError {
    /// The HTTP status the outer (out-of-scope) transport layer is expected
    /// to surface for this error, per the error-handling design table.
    pub fn status_code(&self) -> u16 {
        match self {
            OrchestratorError::InvalidRequest(_) => 400,
            _ => 500,
        }
    }
}
