use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    chat::{
        port::{ChatClient, CredentialPrompt},
        types::{ChannelHandle, RawMessage},
    },
    domain::{ChannelId, ChatTarget},
    errors::AuthError,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two sends (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// ChatClient decorator that spaces out outbound sends.
///
/// Reads (resolve/fetch) pass straight through; only `send_message` waits.
/// Per-chat spacing is keyed by the resolved chat id, so a channel addressed by
/// username and by numeric id shares one limiter.
pub struct ThrottledChat {
    inner: Arc<dyn ChatClient>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
    resolved: Mutex<HashMap<ChannelId, i64>>,
}

impl ThrottledChat {
    pub fn new(inner: Arc<dyn ChatClient>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    async fn chat_id(&self, target: &ChatTarget) -> Result<i64> {
        let channel = match target {
            ChatTarget::Chat(id) => return Ok(*id),
            ChatTarget::Channel(channel) => channel,
        };
        if let Some(id) = self.resolved.lock().await.get(channel) {
            return Ok(*id);
        }
        let id = self.inner.resolve_channel(channel).await?.peer_id;
        self.resolved.lock().await.insert(channel.clone(), id);
        Ok(id)
    }

    async fn limiter_for(&self, chat_id: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle(&self, target: &ChatTarget) -> Result<()> {
        let chat_id = self.chat_id(target).await?;
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ChatClient for ThrottledChat {
    async fn connect(&self, prompt: &dyn CredentialPrompt) -> std::result::Result<(), AuthError> {
        self.inner.connect(prompt).await
    }

    async fn resolve_channel(&self, channel: &ChannelId) -> Result<ChannelHandle> {
        self.inner.resolve_channel(channel).await
    }

    async fn fetch_recent_messages(
        &self,
        channel: &ChannelHandle,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        self.inner.fetch_recent_messages(channel, limit).await
    }

    async fn send_message(&self, target: &ChatTarget, text: &str) -> Result<()> {
        self.throttle(target).await?;
        self.inner.send_message(target, text).await
    }
}
