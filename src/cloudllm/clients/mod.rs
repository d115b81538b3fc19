//! Provider-family adapters (C3). [`common`] holds the shared
//! [`common::ProviderAdapter`] trait, return types, and the discrimination
//! logic every streaming-capable family reduces to; [`openai`], [`gemini`],
//! and [`ollama`] are the three families the tool-calling loop (C4) can
//! resolve a request to.

pub mod common;
pub mod gemini;
pub mod ollama;
pub mod openai;
