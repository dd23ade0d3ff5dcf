//! Chat model providers for lectern.
//!
//! Only non-streaming completions are needed: entity extraction and query
//! analysis send one prompt and parse one JSON reply.
//!
//! # Usage
//!
//! ```rust,no_run
//! use lectern_providers::{CompletionRequest, LLMProvider, Message, MessageRole, OpenAiCompatibleProvider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = OpenAiCompatibleProvider::new(
//!         "https://api.siliconflow.cn/v1".to_string(),
//!         Some("your-api-key".to_string()),
//!         "Qwen/Qwen3-14B".to_string(),
//!     )?;
//!
//!     let request = CompletionRequest::new(vec![
//!         Message::new(MessageRole::System, "You extract entities.".to_string()),
//!         Message::new(MessageRole::User, "Python and Django".to_string()),
//!     ])
//!     .with_temperature(0.0);
//!
//!     let response = provider.complete(request).await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

pub mod json;
pub mod openai;

pub use json::{extract_json_value, strip_think_blocks};
pub use openai::OpenAiCompatibleProvider;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: String) -> Self {
        Self { role, content }
    }
}

/// A single completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Usage,
    pub model: String,
}

/// A chat completion backend.
#[async_trait::async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Provider name used in logs.
    fn name(&self) -> &str;

    /// Model identifier recorded in graph metadata.
    fn model(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new(vec![Message::new(
            MessageRole::User,
            "hi".to_string(),
        )])
        .with_temperature(0.0)
        .with_max_tokens(128);

        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, Some(128));
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&MessageRole::System).unwrap();
        assert_eq!(json, "\"system\"");
    }
}
