//! LLM call boundary.
//!
//! - [`LlmClient`]: the one contract every vendor adapter implements
//! - [`HttpLlmClient`]: OpenAI-compatible chat-completions adapter
//! - [`call_with_retry`]: bounded retry of transient failures

mod client;
mod retry;
mod types;

pub use client::*;
pub use retry::*;
pub use types::*;
