//! Services layer for the triage loop engine
//!
//! Provides the LLM integration used as the semantic clustering capability.

pub mod llm;

pub use llm::{build_prompt, LlmConfig, LlmService};
