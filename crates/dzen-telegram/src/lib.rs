//! Telegram adapter (grammers, MTProto user or bot session).
//!
//! Implements the `dzen-core` ChatClient port plus the live update subscription.

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use grammers_client::{
    client::updates::UpdateStream, grammers_tl_types as tl, parsers::parse_markdown_message,
    types::Peer, Client, InputMessage, SignInError, Update, UpdatesConfiguration,
};
use grammers_mtsender::{InvocationError, SenderPool, SenderPoolHandle};
use grammers_session::{storages::SqliteSession, updates::UpdatesLike};
use tokio::{
    sync::{mpsc::UnboundedReceiver, Mutex},
    time::sleep,
};

use dzen_core::{
    auth::aborted,
    chat::{
        port::{ChatClient, CredentialPrompt, UpdateSource},
        types::{ChannelHandle, InboundMessage, RawMessage},
    },
    domain::{ChannelId, ChatTarget, MessageId},
    errors::{AuthError, Error},
    Result,
};

type PeerCache = Arc<Mutex<HashMap<i64, Peer>>>;

pub struct TelegramClient {
    client: Client,
    handle: SenderPoolHandle,
    api_hash: String,
    peers: PeerCache,
    updates: Mutex<Option<UnboundedReceiver<UpdatesLike>>>,
}

fn open_session(path: &Path) -> anyhow::Result<Arc<SqliteSession>> {
    let session = SqliteSession::open(path)
        .with_context(|| format!("opening session file {}", path.display()))?;
    Ok(Arc::new(session))
}

impl TelegramClient {
    /// Open (or create) the session file and start the network runner.
    pub fn new(api_id: i32, api_hash: impl Into<String>, session_file: &Path) -> Result<Self> {
        let session = open_session(session_file).map_err(|e| Error::Config(format!("{e:#}")))?;
        let pool = SenderPool::new(session, api_id);
        let client = Client::new(&pool);

        let SenderPool {
            runner,
            updates,
            handle,
        } = pool;
        tokio::spawn(runner.run());

        Ok(Self {
            client,
            handle,
            api_hash: api_hash.into(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            updates: Mutex::new(Some(updates)),
        })
    }

    /// Start the live subscription. Only one subscription per client.
    pub async fn subscribe(&self) -> Result<TelegramUpdates> {
        let updates = self
            .updates
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::External("update stream already taken".to_string()))?;

        let stream = self.client.stream_updates(
            updates,
            UpdatesConfiguration {
                catch_up: false,
                ..Default::default()
            },
        );
        Ok(TelegramUpdates {
            stream,
            peers: self.peers.clone(),
        })
    }

    /// Stop the network runner.
    pub fn disconnect(&self) {
        self.handle.quit();
    }

    async fn log_identity(&self) {
        match self.client.get_me().await {
            Ok(me) => tracing::info!(
                username = me.username().unwrap_or("N/A"),
                id = me.bare_id(),
                "logged in to Telegram"
            ),
            Err(error) => tracing::warn!(%error, "authorized, but failed to fetch own profile"),
        }
    }

    async fn sign_in_user(&self, phone: &str, prompt: &dyn CredentialPrompt) -> std::result::Result<(), AuthError> {
        let token = self
            .client
            .request_login_code(phone, &self.api_hash)
            .await
            .map_err(map_invocation)?;

        let code = prompt
            .ask("Please enter the code you received: ")
            .await
            .map_err(aborted)?;

        match self.client.sign_in(&token, &code).await {
            Ok(_) => Ok(()),
            Err(SignInError::PasswordRequired(password_token)) => {
                let password = prompt
                    .ask_secret("Please enter your 2FA password: ")
                    .await
                    .map_err(aborted)?;
                if password.is_empty() {
                    return Err(AuthError::PasswordRequired);
                }
                self.client
                    .check_password(password_token, password.trim())
                    .await
                    .map_err(map_sign_in)?;
                tracing::info!("signed in with 2FA");
                Ok(())
            }
            Err(e) => Err(map_sign_in(e)),
        }
    }

    async fn cached_peer(&self, id: i64) -> Option<Peer> {
        self.peers.lock().await.get(&id).cloned()
    }

    /// Numeric handles are looked up in the account's dialog list.
    async fn find_dialog(&self, channel: &ChannelId, id: i64) -> Result<Peer> {
        let mut dialogs = self.client.iter_dialogs();
        while let Some(dialog) = dialogs.next().await.map_err(|e| fetch_error(channel, e))? {
            let peer = dialog.peer();
            if peer.id().bare_id() == id {
                return Ok(peer.clone());
            }
        }
        Err(Error::Fetch {
            channel: channel.to_string(),
            reason: "not found among the account's dialogs".to_string(),
        })
    }

    async fn peer_for(&self, target: &ChatTarget) -> Result<Peer> {
        let id = match target {
            ChatTarget::Chat(id) => *id,
            ChatTarget::Channel(channel) => self.resolve_channel(channel).await?.peer_id,
        };
        self.cached_peer(id).await.ok_or_else(|| Error::Delivery {
            target: target.to_string(),
            reason: "chat not seen by this session".to_string(),
        })
    }

    /// Retry once after a flood wait, like the Bot API `RetryAfter` path.
    async fn send_with_retry(&self, peer: &Peer, text: &str) -> std::result::Result<(), InvocationError> {
        const MAX_RETRIES: usize = 1;
        let (plain, entities) = render_markdown(text);
        let mut attempts = 0usize;
        loop {
            let message = InputMessage::new()
                .text(plain.as_str())
                .fmt_entities(entities.iter().cloned());
            match self.client.send_message(peer, message).await
            {
                Ok(_) => return Ok(()),
                Err(InvocationError::Rpc(rpc)) if rpc.name == "FLOOD_WAIT" && attempts < MAX_RETRIES => {
                    attempts += 1;
                    let wait = Duration::from_secs(rpc.value.unwrap_or(1).into());
                    tracing::warn!(wait_secs = wait.as_secs(), "flood wait on send, retrying");
                    sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn connect(&self, prompt: &dyn CredentialPrompt) -> std::result::Result<(), AuthError> {
        tracing::info!("checking authorization status");
        if self.client.is_authorized().await.map_err(map_invocation)? {
            self.log_identity().await;
            return Ok(());
        }

        tracing::info!("not authorized, starting sign-in flow");
        let login = prompt
            .ask("Please enter your phone (or bot token): ")
            .await
            .map_err(aborted)?;

        if is_bot_token(&login) {
            self.client
                .bot_sign_in(&login, &self.api_hash)
                .await
                .map_err(map_invocation)?;
            tracing::info!("signed in as bot");
        } else {
            self.sign_in_user(&login, prompt).await?;
        }

        self.log_identity().await;
        Ok(())
    }

    async fn resolve_channel(&self, channel: &ChannelId) -> Result<ChannelHandle> {
        let peer = match channel.bare_id() {
            Some(id) => match self.cached_peer(id).await {
                Some(peer) => peer,
                None => self.find_dialog(channel, id).await?,
            },
            None => self
                .client
                .resolve_username(channel.as_str())
                .await
                .map_err(|e| fetch_error(channel, e))?
                .ok_or_else(|| Error::Fetch {
                    channel: channel.to_string(),
                    reason: "username not found".to_string(),
                })?,
        };

        let peer_id = peer.id().bare_id();
        self.peers.lock().await.insert(peer_id, peer);
        Ok(ChannelHandle {
            channel: channel.clone(),
            peer_id,
        })
    }

    async fn fetch_recent_messages(
        &self,
        channel: &ChannelHandle,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        let peer = self
            .cached_peer(channel.peer_id)
            .await
            .ok_or_else(|| Error::Fetch {
                channel: channel.channel.to_string(),
                reason: "channel not resolved".to_string(),
            })?;

        let mut iter = self.client.iter_messages(&peer).limit(limit);
        let mut out = Vec::with_capacity(limit);
        while let Some(msg) = iter
            .next()
            .await
            .map_err(|e| fetch_error(&channel.channel, e))?
        {
            let text = msg.text();
            out.push(RawMessage {
                id: MessageId(msg.id()),
                text: (!text.is_empty()).then(|| text.to_string()),
                channel: channel.channel.clone(),
            });
        }
        Ok(out)
    }

    async fn send_message(&self, target: &ChatTarget, text: &str) -> Result<()> {
        let peer = self.peer_for(target).await?;
        self.send_with_retry(&peer, text)
            .await
            .map_err(|e| Error::Delivery {
                target: target.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Live updates for every chat the session sees.
pub struct TelegramUpdates {
    stream: UpdateStream,
    peers: PeerCache,
}

#[async_trait]
impl UpdateSource for TelegramUpdates {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>> {
        loop {
            let update = self
                .stream
                .next()
                .await
                .map_err(|e| Error::External(format!("telegram update error: {e}")))?;

            let Update::NewMessage(message) = update else {
                continue;
            };

            let chat_id = message.peer_id().bare_id();
            let peer = message.peer().ok().cloned();
            let username = peer
                .as_ref()
                .and_then(|p| p.username())
                .map(str::to_string);
            if let Some(peer) = peer {
                self.peers.lock().await.insert(chat_id, peer);
            }

            let text = message.text();
            return Ok(Some(InboundMessage {
                chat_id,
                username,
                message_id: MessageId(message.id()),
                text: (!text.is_empty()).then(|| text.to_string()),
                outgoing: message.outgoing(),
            }));
        }
    }

    fn close(&mut self) {
        tracing::info!("saving update state");
        self.stream.sync_update_state();
    }
}

/// Bot tokens look like `<digits>:<secret>`; phone numbers never contain `:`.
pub fn is_bot_token(login: &str) -> bool {
    match login.trim().split_once(':') {
        Some((id, secret)) => {
            !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && !secret.is_empty()
        }
        None => false,
    }
}

/// Markdown to Telegram plain text plus formatting entities (`**x**` is bold).
fn render_markdown(text: &str) -> (String, Vec<tl::enums::MessageEntity>) {
    parse_markdown_message(text)
}

fn map_invocation(e: InvocationError) -> AuthError {
    match &e {
        InvocationError::Rpc(rpc) if rpc.name == "AUTH_RESTART" => AuthError::RestartRequired,
        InvocationError::Rpc(rpc) if rpc.name == "SESSION_PASSWORD_NEEDED" => {
            AuthError::PasswordRequired
        }
        InvocationError::Rpc(rpc)
            if rpc.name.starts_with("PHONE_")
                || rpc.name.starts_with("ACCESS_TOKEN_")
                || rpc.name.starts_with("PASSWORD_") =>
        {
            AuthError::InvalidCredentials(rpc.name.clone())
        }
        _ => AuthError::Aborted(e.to_string()),
    }
}

fn map_sign_in(e: SignInError) -> AuthError {
    match e {
        SignInError::PasswordRequired(_) => AuthError::PasswordRequired,
        SignInError::InvalidCode => AuthError::InvalidCredentials("invalid login code".to_string()),
        SignInError::InvalidPassword => {
            AuthError::InvalidCredentials("invalid password".to_string())
        }
        SignInError::Other(inner) => map_invocation(inner),
        other => AuthError::Aborted(other.to_string()),
    }
}

fn fetch_error(channel: &ChannelId, e: InvocationError) -> Error {
    Error::Fetch {
        channel: channel.to_string(),
        reason: e.to_string(),
    }
}
