//! The LLM provider capability. §1 treats providers as an external
//! collaborator; the core only relies on this one trait.

use crate::error::Result;
use crate::message::Message;

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
}

/// A provider-agnostic chat completion response. Tool calls are not parsed
/// by the provider — the Playbook Runner parses them out of `content`
/// (§4.4, §9 "centralize the structured-output and tool-call parser").
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
}

/// The one capability the core depends on: `LLMProvider.Chat`.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// A unique identifier for this provider instance (used only in logs).
    fn provider_id(&self) -> &str;
}
