//! Forwarding of prefixed team-chat messages to a command dispatcher.

use async_trait::async_trait;
use companion_config::CommandConfig;

use crate::messages::ChatMessage;

/// Which team messages count as commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    pub prefix: String,
}

impl CommandOptions {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// An empty prefix matches nothing.
    pub fn matches(&self, message: &str) -> bool {
        !self.prefix.is_empty() && message.starts_with(&self.prefix)
    }
}

impl From<&CommandConfig> for CommandOptions {
    fn from(config: &CommandConfig) -> Self {
        Self::new(config.prefix.clone())
    }
}

/// Receives command messages verbatim. Parsing is up to the implementation.
#[async_trait]
pub trait CommandDispatch: Send + Sync {
    async fn run_command(&self, message: ChatMessage, options: &CommandOptions);
}
