use crate::domain::{ChannelId, ChatTarget, MessageId};

/// A message as returned by a history fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub id: MessageId,
    pub text: Option<String>,
    pub channel: ChannelId,
}

impl RawMessage {
    /// Text worth processing (present and not blank).
    pub fn usable_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// A resolved watched channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelHandle {
    pub channel: ChannelId,
    /// Bare platform id of the resolved chat.
    pub peer_id: i64,
}

/// One live event from the subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Bare platform id of the chat the message was posted in.
    pub chat_id: i64,
    pub username: Option<String>,
    pub message_id: MessageId,
    pub text: Option<String>,
    pub outgoing: bool,
}

impl InboundMessage {
    pub fn usable_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Publish target for replies to this message (the originating chat).
    pub fn reply_target(&self) -> ChatTarget {
        ChatTarget::Chat(self.chat_id)
    }
}
