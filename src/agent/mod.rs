//! Agent iteration loop.
//!
//! An agent alternates LLM calls and tool calls until it produces a final
//! answer, runs out of iterations, fails, or is cancelled. The model protocol
//! is pluggable through [`IterationStrategy`]:
//!
//! - [`StrategyKind::React`]: text protocol with `Thought`/`Action` blocks
//! - [`StrategyKind::NativeThinking`]: structured function calls

mod controller;
mod native;
mod react;
mod strategy;
mod summarizer;

pub use controller::{single_shot, AgentController, AgentOutcome, AgentRunConfig};
pub use native::NativeThinkingStrategy;
pub use react::{parse_react, ReactStrategy};
pub use strategy::{Interpretation, IterationStrategy, StrategyKind, ToolObservation, ToolRequest};
pub use summarizer::ToolResultSummarizer;
