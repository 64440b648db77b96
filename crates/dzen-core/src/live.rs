//! Live path: summarize and repost every new text message from a watched channel.
//!
//! This path never reads or writes the processed set. Live posts are real-time
//! announcements; the daily batch is a separate digest, so a message may show up
//! in both.

use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    chat::{port::UpdateSource, types::InboundMessage},
    domain::ChannelId,
    publisher::Publisher,
    transform::Transformer,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveOutcome {
    /// Not from a watched channel, or our own message.
    Ignored,
    /// No text to work with.
    NoText,
    SummarizeFailed,
    DeliveryFailed,
    Published,
}

pub struct LiveHandler {
    channels: Vec<ChannelId>,
    transformer: Arc<Transformer>,
    publisher: Arc<Publisher>,
}

impl LiveHandler {
    pub fn new(
        channels: Vec<ChannelId>,
        transformer: Arc<Transformer>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            channels,
            transformer,
            publisher,
        }
    }

    pub fn is_watched(&self, msg: &InboundMessage) -> bool {
        self.channels
            .iter()
            .any(|c| c.matches(msg.username.as_deref(), msg.chat_id))
    }

    /// Handle one inbound message end to end.
    pub async fn handle(&self, msg: InboundMessage) -> LiveOutcome {
        if msg.outgoing || !self.is_watched(&msg) {
            return LiveOutcome::Ignored;
        }

        let Some(text) = msg.usable_text() else {
            tracing::debug!("skipping message without text");
            return LiveOutcome::NoText;
        };

        let Some(formatted) = self.transformer.transform(text).await else {
            return LiveOutcome::SummarizeFailed;
        };

        let target = msg.reply_target();
        match self.publisher.publish(&target, &formatted).await {
            Ok(()) => {
                tracing::info!(%target, "published summary");
                LiveOutcome::Published
            }
            Err(error) => {
                tracing::error!(%target, %error, "failed to publish summary");
                LiveOutcome::DeliveryFailed
            }
        }
    }

    /// Consume the subscription until it ends or `cancel` fires.
    ///
    /// Each message is handled on its own task; at most `max_in_flight` run at once.
    pub async fn run<S: UpdateSource>(
        self: Arc<Self>,
        mut source: S,
        max_in_flight: usize,
        cancel: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let mut workers = JoinSet::new();

        tracing::info!(channels = self.channels.len(), "listening for new messages");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = source.next_message() => next,
            };

            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    tracing::warn!("update stream ended");
                    break;
                }
                Err(error) => {
                    tracing::error!(%error, "error receiving update");
                    continue;
                }
            };

            if msg.outgoing || !self.is_watched(&msg) {
                continue;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let span = tracing::info_span!(
                "live",
                chat_id = msg.chat_id,
                channel = msg.username.as_deref().unwrap_or(""),
                message_id = %msg.message_id
            );
            let handler = self.clone();
            workers.spawn(
                async move {
                    let _permit = permit;
                    handler.handle(msg).await
                }
                .instrument(span),
            );

            while let Some(result) = workers.try_join_next() {
                log_worker_result(result);
            }
        }

        source.close();
        while let Some(result) = workers.join_next().await {
            log_worker_result(result);
        }
        tracing::info!("live handler stopped");
    }
}

fn log_worker_result(result: Result<LiveOutcome, tokio::task::JoinError>) {
    match result {
        Ok(outcome) => tracing::debug!(?outcome, "live message done"),
        Err(error) => tracing::error!(%error, "live message task failed"),
    }
}
