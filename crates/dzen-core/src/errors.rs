use std::path::PathBuf;

/// Core error type.
///
/// Adapter crates map their transport errors into this type so the pipeline
/// can log and isolate failures consistently (per channel, per message).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("processed-messages store is corrupt: {path}: {reason}")]
    StorageCorrupt { path: PathBuf, reason: String },

    #[error("fetch failed for channel {channel}: {reason}")]
    Fetch { channel: String, reason: String },

    #[error("summarize failed: {0}")]
    Summarize(String),

    #[error("delivery to {target} failed: {reason}")]
    Delivery { target: String, reason: String },

    #[error("external error: {0}")]
    External(String),
}

/// Login failures surfaced by a chat client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The platform asked to start the login over (recoverable by re-prompting).
    #[error("login must be restarted")]
    RestartRequired,

    #[error("a password is required but none was provided")]
    PasswordRequired,

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("login aborted: {0}")]
    Aborted(String),
}

impl AuthError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AuthError::RestartRequired)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
