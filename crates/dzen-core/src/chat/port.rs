use async_trait::async_trait;

use crate::{
    chat::types::{ChannelHandle, InboundMessage, RawMessage},
    domain::{ChannelId, ChatTarget},
    errors::AuthError,
    Result,
};

/// Operator input during login (phone, code, passwords).
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    async fn ask(&self, question: &str) -> Result<String>;

    /// Like `ask`, for answers that must not be echoed (passwords).
    async fn ask_secret(&self, question: &str) -> Result<String> {
        self.ask(question).await
    }
}

/// Chat platform client port.
///
/// Implemented by the Telegram adapter; tests use in-memory fakes.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Make sure the session is authorized, prompting the operator when needed.
    async fn connect(&self, prompt: &dyn CredentialPrompt) -> std::result::Result<(), AuthError>;

    async fn resolve_channel(&self, channel: &ChannelId) -> Result<ChannelHandle>;

    /// Most recent `limit` messages of a channel, newest first.
    async fn fetch_recent_messages(
        &self,
        channel: &ChannelHandle,
        limit: usize,
    ) -> Result<Vec<RawMessage>>;

    async fn send_message(&self, target: &ChatTarget, text: &str) -> Result<()>;
}

/// Live subscription: one event per new message seen by the client.
#[async_trait]
pub trait UpdateSource: Send {
    /// Next message event; `None` once the stream has ended.
    async fn next_message(&mut self) -> Result<Option<InboundMessage>>;

    /// Flush any stream state (e.g. update sequence numbers) before exit.
    fn close(&mut self) {}
}
