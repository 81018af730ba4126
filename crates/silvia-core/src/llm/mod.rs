//! LLM integration (OpenRouter API)

mod client;
mod types;

pub use client::{LanguageModel, OpenRouterClient, OpenRouterClientBuilder};
pub use types::{ChatRequest, ChatResponse, Message};
