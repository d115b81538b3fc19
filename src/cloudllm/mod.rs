// src/cloudllm/mod.rs

pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod error;
pub mod orchestration;
pub mod streaming;
pub mod tool_protocol;
pub mod tool_protocols;

// Let's explicitly export the loop entry point and the multiplexer so callers
// don't have to navigate through the whole hierarchy.
pub use orchestration::{run_tool_calling_loop, FinalAnswer, LoopOutcome};
pub use streaming::{multiplex_stream, FramingMode};
