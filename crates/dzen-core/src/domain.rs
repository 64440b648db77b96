use std::fmt;

/// Watched channel identifier as configured (username or numeric handle).
///
/// Stored without surrounding whitespace or a leading `@`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let t = raw.as_ref().trim();
        Self(t.strip_prefix('@').unwrap_or(t).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric handle, when the identifier is one (e.g. `-1001234567890`).
    pub fn numeric(&self) -> Option<i64> {
        self.0.parse::<i64>().ok()
    }

    /// Bare platform id for a numeric handle, with any `-100` channel prefix removed.
    pub fn bare_id(&self) -> Option<i64> {
        self.numeric().map(|n| strip_channel_prefix(n).unwrap_or(n))
    }

    /// Does this identifier name the given chat (by username or by numeric id)?
    pub fn matches(&self, username: Option<&str>, chat_id: i64) -> bool {
        if let Some(n) = self.numeric() {
            return n == chat_id || strip_channel_prefix(n) == Some(chat_id);
        }
        username
            .map(|u| u.trim_start_matches('@').eq_ignore_ascii_case(&self.0))
            .unwrap_or(false)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bot API style channel ids carry a `-100` prefix; MTProto uses the bare id.
fn strip_channel_prefix(id: i64) -> Option<i64> {
    const PREFIX: i64 = -1_000_000_000_000;
    if id < PREFIX {
        Some(PREFIX - id)
    } else {
        None
    }
}

/// Platform message id (numeric, increasing with recency within a chat).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub i32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a publish goes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChatTarget {
    /// A watched channel, by its configured identifier.
    Channel(ChannelId),
    /// A chat the client has already seen, by bare numeric id.
    Chat(i64),
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatTarget::Channel(c) => write!(f, "@{c}"),
            ChatTarget::Chat(id) => write!(f, "chat:{id}"),
        }
    }
}
