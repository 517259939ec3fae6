//! Chat prompt rendering

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single chat turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Format chat messages into a prompt string
///
/// Each turn becomes `Role: content\n`; the prompt ends with an open
/// `Assistant: ` turn for the model to complete.
pub fn format_chat_prompt(messages: &[ChatMessage]) -> Result<String> {
    if messages.is_empty() {
        return Err(Error::Config("chat completion needs at least one message".into()));
    }

    let mut prompt = String::new();

    for msg in messages {
        let label = match msg.role.as_str() {
            "system" => "System",
            "user" => "User",
            "assistant" => "Assistant",
            other => {
                return Err(Error::Config(format!("unknown chat role: '{}'", other)));
            }
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(&msg.content);
        prompt.push('\n');
    }

    prompt.push_str("Assistant: ");
    Ok(prompt)
}
