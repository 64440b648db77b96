//! In-memory fakes for the ports, shared by module tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::{
    chat::{
        port::{ChatClient, CredentialPrompt, UpdateSource},
        types::{ChannelHandle, InboundMessage, RawMessage},
    },
    domain::{ChannelId, ChatTarget, MessageId},
    errors::{AuthError, Error},
    transform::Summarizer,
    Result,
};

#[derive(Default)]
pub(crate) struct FakeChat {
    history: Mutex<HashMap<String, Vec<RawMessage>>>,
    peers: Mutex<HashMap<String, i64>>,
    failing: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(ChatTarget, String)>>,
    reject: AtomicBool,
    send_delay: Option<Duration>,
    fetch_delay: Option<Duration>,
    fetch_gate: Option<Arc<Semaphore>>,
    fetch_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    auth_script: Mutex<VecDeque<std::result::Result<(), AuthError>>>,
    two_factor: AtomicBool,
    connect_calls: AtomicUsize,
}

impl FakeChat {
    /// Seed a channel's history; `None` text models media-only posts.
    pub(crate) fn with_history(self, channel: &str, messages: &[(i32, Option<&str>)]) -> Self {
        let channel_id = ChannelId::new(channel);
        let mut msgs: Vec<RawMessage> = messages
            .iter()
            .map(|(id, text)| RawMessage {
                id: MessageId(*id),
                text: text.map(str::to_string),
                channel: channel_id.clone(),
            })
            .collect();
        // Platform order: newest first.
        msgs.sort_by(|a, b| b.id.cmp(&a.id));
        self.history
            .lock()
            .unwrap()
            .insert(channel_id.as_str().to_string(), msgs);
        self
    }

    /// Resolve a username handle to a fixed chat id.
    pub(crate) fn with_peer(self, channel: &str, peer_id: i64) -> Self {
        self.peers
            .lock()
            .unwrap()
            .insert(ChannelId::new(channel).as_str().to_string(), peer_id);
        self
    }

    pub(crate) fn with_send_delay(mut self, d: Duration) -> Self {
        self.send_delay = Some(d);
        self
    }

    pub(crate) fn with_fetch_delay(mut self, d: Duration) -> Self {
        self.fetch_delay = Some(d);
        self
    }

    /// Every fetch waits for a permit on `gate` before returning.
    pub(crate) fn with_fetch_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.fetch_gate = Some(gate);
        self
    }

    pub(crate) fn fail_channel(&self, channel: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(ChannelId::new(channel).as_str().to_string());
    }

    pub(crate) fn reject_sends(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub(crate) fn script_auth(&self, outcomes: Vec<std::result::Result<(), AuthError>>) {
        *self.auth_script.lock().unwrap() = outcomes.into();
    }

    /// Scripted logins also ask for a cloud password after the code.
    pub(crate) fn require_two_factor(&self) {
        self.two_factor.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<(ChatTarget, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_fetches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    /// Unscripted: already authorized. Scripted: asks for a code, then yields the next outcome.
    async fn connect(&self, prompt: &dyn CredentialPrompt) -> std::result::Result<(), AuthError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.auth_script.lock().unwrap().pop_front();
        let Some(outcome) = next else {
            return Ok(());
        };
        prompt
            .ask("Enter the code you received: ")
            .await
            .map_err(crate::auth::aborted)?;
        if self.two_factor.load(Ordering::SeqCst) {
            prompt
                .ask_secret("Enter your 2FA password: ")
                .await
                .map_err(crate::auth::aborted)?;
        }
        outcome
    }

    async fn resolve_channel(&self, channel: &ChannelId) -> Result<ChannelHandle> {
        let known = self.peers.lock().unwrap().get(channel.as_str()).copied();
        Ok(ChannelHandle {
            channel: channel.clone(),
            peer_id: known.or_else(|| channel.bare_id()).unwrap_or_default(),
        })
    }

    async fn fetch_recent_messages(
        &self,
        channel: &ChannelHandle,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.fetch_gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(d) = self.fetch_delay {
            tokio::time::sleep(d).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let key = channel.channel.as_str().to_string();
        if self.failing.lock().unwrap().contains(&key) {
            return Err(Error::Fetch {
                channel: key,
                reason: "boom".to_string(),
            });
        }

        let history = self.history.lock().unwrap();
        Ok(history
            .get(&key)
            .map(|msgs| msgs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn send_message(&self, target: &ChatTarget, text: &str) -> Result<()> {
        if let Some(d) = self.send_delay {
            tokio::time::sleep(d).await;
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::External("CHAT_WRITE_FORBIDDEN".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((target.clone(), text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeSummarizer {
    fail_on: HashSet<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeSummarizer {
    pub(crate) fn failing_on(texts: &[&str]) -> Self {
        Self {
            fail_on: texts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub(crate) fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.fail_on.contains(text) {
            return Err(Error::Summarize("summarizer returned 503".to_string()));
        }
        Ok(format!("summary: {text}"))
    }
}

/// Scripted live stream: yields the queued items, then ends.
pub(crate) struct FakeUpdates {
    items: VecDeque<Result<InboundMessage>>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl FakeUpdates {
    pub(crate) fn new(items: Vec<Result<InboundMessage>>) -> Self {
        Self {
            items: items.into(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl UpdateSource for FakeUpdates {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>> {
        match self.items.pop_front() {
            Some(Ok(m)) => Ok(Some(m)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn inbound(chat_id: i64, username: Option<&str>, id: i32, text: Option<&str>) -> InboundMessage {
    InboundMessage {
        chat_id,
        username: username.map(str::to_string),
        message_id: MessageId(id),
        text: text.map(str::to_string),
        outgoing: false,
    }
}

#[derive(Default)]
pub(crate) struct FakePrompt {
    answers: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
    asked_secret: Mutex<Vec<String>>,
}

impl FakePrompt {
    pub(crate) fn answering(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
            asked: Mutex::new(Vec::new()),
            asked_secret: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }

    pub(crate) fn asked_secret(&self) -> Vec<String> {
        self.asked_secret.lock().unwrap().clone()
    }

    fn next_answer(&self) -> Result<String> {
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::External("no scripted answer".to_string()))
    }
}

#[async_trait]
impl CredentialPrompt for FakePrompt {
    async fn ask(&self, question: &str) -> Result<String> {
        self.asked.lock().unwrap().push(question.to_string());
        self.next_answer()
    }

    async fn ask_secret(&self, question: &str) -> Result<String> {
        self.asked_secret.lock().unwrap().push(question.to_string());
        self.next_answer()
    }
}
