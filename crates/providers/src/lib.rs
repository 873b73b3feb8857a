//! LLM provider contract.
//!
//! Concrete HTTP adapters (Anthropic, OpenAI-compat, …) live outside this
//! workspace; the engine only depends on the [`LlmProvider`] trait. The
//! [`scripted`] module ships a deterministic in-process provider used by
//! the engine's tests and by embedding hosts that need a stub.

pub mod scripted;
mod traits;

pub use scripted::{Responder, ScriptedProvider, ScriptedReply};
pub use traits::{ChatRequest, ChatResponse, LlmCapabilities, LlmProvider, Usage};
