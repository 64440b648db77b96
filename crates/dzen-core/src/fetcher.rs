//! Batch path: pull recent channel history and keep only what is new.

use std::{collections::BTreeMap, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    chat::{port::ChatClient, types::RawMessage},
    dedup::{is_processed, ProcessedSet, ProcessedUpdate},
    domain::{ChannelId, MessageId},
    Result,
};

/// A not-yet-processed message picked up by a scheduled run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchMessage {
    pub id: MessageId,
    pub text: String,
}

/// New messages of one channel for one run, oldest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelBatch {
    pub channel: ChannelId,
    pub messages: Vec<BatchMessage>,
    /// Set when the channel could not be fetched this run.
    pub error: Option<String>,
}

impl ChannelBatch {
    fn failed(channel: ChannelId, error: String) -> Self {
        Self {
            channel,
            messages: Vec::new(),
            error: Some(error),
        }
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.id).collect()
    }
}

/// Keep messages with text that `snapshot` has not seen for `channel`.
pub fn select_new(
    snapshot: &ProcessedSet,
    channel: &ChannelId,
    fetched: Vec<RawMessage>,
) -> ChannelBatch {
    let mut messages: Vec<BatchMessage> = Vec::new();
    for msg in fetched {
        if is_processed(snapshot, channel, msg.id) || messages.iter().any(|m| m.id == msg.id) {
            continue;
        }
        let Some(text) = msg.usable_text() else {
            continue;
        };
        messages.push(BatchMessage {
            id: msg.id,
            text: text.to_string(),
        });
    }
    messages.sort_by_key(|m| m.id);

    ChannelBatch {
        channel: channel.clone(),
        messages,
        error: None,
    }
}

/// Resolve + fetch one channel and select its new messages.
pub async fn fetch_channel(
    chat: &dyn ChatClient,
    snapshot: &ProcessedSet,
    channel: &ChannelId,
    limit: usize,
) -> Result<ChannelBatch> {
    let handle = chat.resolve_channel(channel).await?;
    let fetched = chat.fetch_recent_messages(&handle, limit).await?;
    Ok(select_new(snapshot, channel, fetched))
}

/// Fetch every channel with at most `concurrency` fetches in flight.
///
/// A channel that fails yields an empty batch carrying the error. The result is
/// ordered by channel regardless of completion order.
pub async fn fetch_all(
    chat: Arc<dyn ChatClient>,
    snapshot: Arc<ProcessedSet>,
    channels: &[ChannelId],
    limit: usize,
    concurrency: usize,
) -> Vec<ChannelBatch> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut workers = JoinSet::new();

    for channel in channels.iter().cloned() {
        let chat = chat.clone();
        let snapshot = snapshot.clone();
        let semaphore = semaphore.clone();
        workers.spawn(async move {
            let res = match semaphore.acquire_owned().await {
                Ok(_permit) => fetch_channel(chat.as_ref(), &snapshot, &channel, limit).await,
                Err(e) => Err(crate::Error::External(format!("fetch pool closed: {e}"))),
            };
            (channel, res)
        });
    }

    let mut by_channel: BTreeMap<ChannelId, ChannelBatch> = BTreeMap::new();
    while let Some(joined) = workers.join_next().await {
        let (channel, res) = match joined {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "channel fetch task failed");
                continue;
            }
        };

        let batch = match res {
            Ok(batch) => {
                tracing::info!(
                    channel = %channel,
                    new_messages = batch.messages.len(),
                    "fetched channel"
                );
                batch
            }
            Err(error) => {
                tracing::warn!(channel = %channel, %error, "channel fetch failed, skipping this run");
                ChannelBatch::failed(channel.clone(), error.to_string())
            }
        };
        by_channel.insert(channel, batch);
    }

    // A panicked task leaves its channel out; report it as failed too.
    for channel in channels {
        by_channel
            .entry(channel.clone())
            .or_insert_with(|| ChannelBatch::failed(channel.clone(), "fetch task aborted".to_string()));
    }

    by_channel.into_values().collect()
}

/// Ids to commit for a set of batches; failed and empty channels are omitted.
pub fn update_for(batches: &[ChannelBatch]) -> ProcessedUpdate {
    batches
        .iter()
        .filter(|b| b.error.is_none() && !b.messages.is_empty())
        .map(|b| (b.channel.clone(), b.ids()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::merge;
    use crate::testing::FakeChat;
    use std::time::Duration;

    fn ids(v: &[i32]) -> Vec<MessageId> {
        v.iter().copied().map(MessageId).collect()
    }

    #[tokio::test]
    async fn skips_processed_and_textless_messages() {
        let chat = Arc::new(FakeChat::default().with_history(
            "chan1",
            &[
                (99, Some("ninety-nine")),
                (100, Some("hundred")),
                (101, Some("hundred one")),
                (102, Some("hundred two")),
                (103, None),
                (104, Some("   ")),
            ],
        ));
        let snapshot = Arc::new(ProcessedSet::from([("chan1", vec![100, 101])]));

        let batches = fetch_all(chat, snapshot.clone(), &[ChannelId::new("chan1")], 10, 2).await;
        assert_eq!(batches.len(), 1);
        let texts: Vec<&str> = batches[0].messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["ninety-nine", "hundred two"]);

        let update = update_for(&batches);
        assert_eq!(update.get(&ChannelId::new("chan1")), Some(&ids(&[99, 102])));

        let merged = merge(&snapshot, &update);
        let mut got = merged.ids(&ChannelId::new("chan1")).to_vec();
        got.sort();
        assert_eq!(got, ids(&[99, 100, 101, 102]));
    }

    #[tokio::test]
    async fn respects_the_fetch_limit() {
        let history: Vec<(i32, Option<&str>)> = (1..=30).map(|i| (i, Some("post"))).collect();
        let chat = Arc::new(FakeChat::default().with_history("chan1", &history));

        let batches = fetch_all(
            chat,
            Arc::new(ProcessedSet::new()),
            &[ChannelId::new("chan1")],
            10,
            1,
        )
        .await;
        assert_eq!(batches[0].ids(), ids(&(21..=30).collect::<Vec<_>>()));
    }

    #[tokio::test]
    async fn failing_channel_is_isolated() {
        let chat = Arc::new(
            FakeChat::default()
                .with_history("good", &[(1, Some("a")), (2, Some("b"))])
                .with_history("bad", &[(5, Some("x"))]),
        );
        chat.fail_channel("bad");

        let channels = [ChannelId::new("bad"), ChannelId::new("good")];
        let batches = fetch_all(chat, Arc::new(ProcessedSet::new()), &channels, 10, 4).await;

        assert_eq!(batches.len(), 2);
        let bad = batches.iter().find(|b| b.channel.as_str() == "bad").unwrap();
        assert!(bad.messages.is_empty());
        assert!(bad.error.is_some());

        let update = update_for(&batches);
        assert!(!update.contains_key(&ChannelId::new("bad")));
        assert_eq!(update.get(&ChannelId::new("good")), Some(&ids(&[1, 2])));
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_is_bounded_and_ordered() {
        let mut chat = FakeChat::default().with_fetch_delay(Duration::from_millis(50));
        let mut channels = Vec::new();
        for i in (0..8).rev() {
            let name = format!("chan{i}");
            chat = chat.with_history(&name, &[(i + 1, Some("post"))]);
            channels.push(ChannelId::new(&name));
        }
        let chat = Arc::new(chat);

        let batches = fetch_all(chat.clone(), Arc::new(ProcessedSet::new()), &channels, 10, 3).await;

        assert_eq!(chat.fetch_calls(), 8);
        assert!(chat.max_concurrent_fetches() <= 3);
        let order: Vec<&str> = batches.iter().map(|b| b.channel.as_str()).collect();
        assert_eq!(
            order,
            vec!["chan0", "chan1", "chan2", "chan3", "chan4", "chan5", "chan6", "chan7"]
        );
    }

    #[test]
    fn select_new_drops_duplicate_ids_in_one_fetch() {
        let c = ChannelId::new("chan1");
        let raw = |id: i32| RawMessage {
            id: MessageId(id),
            text: Some(format!("m{id}")),
            channel: c.clone(),
        };
        let batch = select_new(&ProcessedSet::new(), &c, vec![raw(3), raw(2), raw(3)]);
        assert_eq!(batch.ids(), ids(&[2, 3]));
    }
}
