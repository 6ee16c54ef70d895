//! Anthropic provider via rig-core.
//!
//! Builds a single-turn rig agent per call: system messages become the
//! preamble, the remaining messages the prompt. rig does not hand back usage
//! through the prompt API, so token counts are estimated.

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use tracing::debug;

use super::{Completion, LlmProvider, Message, Role};
use crate::config::secrets::{ExposeSecret, SecretString};
use crate::error::{Error, Result};

const JSON_ONLY: &str =
    "Respond with a single JSON document and nothing else. Do not wrap it in prose.";

pub struct AnthropicProvider {
    client: rig::providers::anthropic::Client,
    max_tokens: u64,
}

impl AnthropicProvider {
    /// Create a provider from a secret API key.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(api_key: &SecretString) -> Result<Self> {
        let client = rig::providers::anthropic::Client::new(api_key.expose_secret())
            .map_err(|e| Error::Config(format!("cannot build Anthropic client: {e}")))?;
        Ok(Self {
            client,
            max_tokens: 4_096,
        })
    }

    pub fn max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Split messages into (preamble, prompt).
fn split_messages(messages: &[Message], wants_json: bool) -> (String, String) {
    let mut preamble: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    if wants_json {
        preamble.push(JSON_ONLY);
    }
    let prompt: Vec<&str> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| m.content.as_str())
        .collect();
    (preamble.join("\n\n"), prompt.join("\n\n"))
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate_completion(
        &self,
        model_id: &str,
        messages: &[Message],
        wants_json: bool,
    ) -> Result<Completion> {
        let (preamble, prompt) = split_messages(messages, wants_json);
        let agent = self
            .client
            .agent(model_id)
            .preamble(&preamble)
            .max_tokens(self.max_tokens)
            .build();

        debug!(model = model_id, prompt_bytes = prompt.len(), "sending completion request");
        let text = agent
            .prompt(prompt.as_str())
            .await
            .map_err(|e| Error::provider(e.to_string()))?;

        Ok(Completion::estimated(messages, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_become_the_preamble() {
        let (preamble, prompt) = split_messages(
            &[
                Message::system("You classify events."),
                Message::user("events: []"),
            ],
            true,
        );
        assert!(preamble.starts_with("You classify events."));
        assert!(preamble.ends_with(JSON_ONLY));
        assert_eq!(prompt, "events: []");
    }

    #[test]
    fn plain_text_requests_have_no_json_instruction() {
        let (preamble, _) = split_messages(&[Message::system("sys")], false);
        assert_eq!(preamble, "sys");
    }
}
