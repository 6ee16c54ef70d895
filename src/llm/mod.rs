//! LLM provider seam.
//!
//! The orchestration engine only ever sees [`LlmProvider`]: one request, one
//! textual response. Concrete transports live in submodules; the Anthropic
//! one is built on rig-core.

pub mod anthropic;

pub use anthropic::AnthropicProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A provider's answer plus token accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Completion {
    /// Build a completion for a provider that does not report usage.
    pub fn estimated(messages: &[Message], text: String) -> Self {
        let input: usize = messages.iter().map(|m| m.content.len()).sum();
        Self {
            input_tokens: estimate_tokens(input),
            output_tokens: estimate_tokens(text.len()),
            text,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Roughly four bytes of English text per token.
pub fn estimate_tokens(bytes: usize) -> u64 {
    bytes.div_ceil(4) as u64
}

/// A language model behind a network call.
///
/// Failures are returned as [`crate::error::Error::Provider`] (or
/// `Timeout`) so the backoff controller can classify them.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for telemetry, e.g. "anthropic".
    fn name(&self) -> &str;

    async fn generate_completion(
        &self,
        model_id: &str,
        messages: &[Message],
        wants_json: bool,
    ) -> Result<Completion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_tokens_from_text_length() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(8), 2);

        let c = Completion::estimated(
            &[Message::system("abcd"), Message::user("efghijkl")],
            "xyz".to_string(),
        );
        assert_eq!(c.input_tokens, 3);
        assert_eq!(c.output_tokens, 1);
        assert_eq!(c.total_tokens(), 4);
    }
}
