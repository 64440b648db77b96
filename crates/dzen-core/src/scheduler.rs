//! Daily digest scheduler.
//!
//! - Fires on a standard 5-field cron expression (min hour dom mon dow), local time
//! - One cycle at a time: a trigger that arrives while a cycle runs is dropped
//! - Each cycle works on an immutable snapshot of the processed set; the merged
//!   set replaces it only after the cycle finishes

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Datelike, Local, Timelike};
use tokio::{sync::Mutex, task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    chat::port::ChatClient,
    dedup::{merge, DedupStore, ProcessedSet},
    domain::{ChannelId, ChatTarget},
    fetcher::{fetch_all, update_for, BatchMessage},
    publisher::Publisher,
    transform::Transformer,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Running,
}

/// What one completed cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub channels: usize,
    pub failed_channels: Vec<ChannelId>,
    pub new_messages: usize,
    pub published: usize,
    pub summarize_failures: usize,
    pub delivery_failures: usize,
    /// Whether the processed set was written this cycle (false also when there
    /// was nothing new and nothing left over from a failed write).
    pub persisted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed(CycleReport),
    /// A cycle was already running.
    Dropped,
}

/// Static parameters of a digest cycle.
#[derive(Clone, Debug)]
pub struct DigestSettings {
    pub channels: Vec<ChannelId>,
    pub fetch_limit: usize,
    pub fetch_concurrency: usize,
}

#[derive(Clone)]
pub struct DigestScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    chat: Arc<dyn ChatClient>,
    transformer: Arc<Transformer>,
    publisher: Arc<Publisher>,
    store: DedupStore,
    settings: DigestSettings,
    running: AtomicBool,
    processed: Mutex<Arc<ProcessedSet>>,
    /// The in-memory set is ahead of the file after a failed write.
    unpersisted: AtomicBool,
}

/// Holds the `Running` flag; clears it on drop, including on panic or cancel.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DigestScheduler {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        transformer: Arc<Transformer>,
        publisher: Arc<Publisher>,
        store: DedupStore,
        initial: ProcessedSet,
        settings: DigestSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                chat,
                transformer,
                publisher,
                store,
                settings,
                running: AtomicBool::new(false),
                processed: Mutex::new(Arc::new(initial)),
                unpersisted: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> CycleState {
        if self.inner.running.load(Ordering::Acquire) {
            CycleState::Running
        } else {
            CycleState::Idle
        }
    }

    /// Current processed set (as of the last finished cycle).
    pub async fn processed(&self) -> Arc<ProcessedSet> {
        self.inner.processed.lock().await.clone()
    }

    /// Run one cycle now unless one is already running.
    pub async fn trigger(&self) -> TriggerOutcome {
        let Some(_running) = RunningGuard::acquire(&self.inner.running) else {
            tracing::warn!("digest cycle already running, dropping trigger");
            return TriggerOutcome::Dropped;
        };
        TriggerOutcome::Completed(self.run_cycle().await)
    }

    async fn run_cycle(&self) -> CycleReport {
        let inner = &self.inner;
        let settings = &inner.settings;
        let snapshot = self.processed().await;

        tracing::info!(channels = settings.channels.len(), "digest cycle started");
        let batches = fetch_all(
            inner.chat.clone(),
            snapshot.clone(),
            &settings.channels,
            settings.fetch_limit,
            settings.fetch_concurrency,
        )
        .await;

        let mut report = CycleReport {
            channels: batches.len(),
            ..CycleReport::default()
        };

        for batch in &batches {
            if batch.error.is_some() {
                report.failed_channels.push(batch.channel.clone());
                continue;
            }

            let target = ChatTarget::Channel(batch.channel.clone());
            let mut published = 0;
            for msg in &batch.messages {
                report.new_messages += 1;
                let span = tracing::info_span!(
                    "digest",
                    channel = %batch.channel,
                    message_id = %msg.id
                );
                match self.publish_one(&target, msg).instrument(span).await {
                    Ok(true) => published += 1,
                    Ok(false) => report.summarize_failures += 1,
                    Err(_) => report.delivery_failures += 1,
                }
            }

            tracing::info!(
                channel = %batch.channel,
                new_messages = batch.messages.len(),
                published,
                "channel digest done"
            );
            report.published += published;
        }

        // Messages whose summary or delivery failed still count as processed.
        let update = update_for(&batches);
        let retry_write = inner.unpersisted.load(Ordering::Acquire);
        if update.is_empty() && !retry_write {
            tracing::info!("no new messages this cycle");
            return report;
        }
        if retry_write {
            tracing::info!("retrying write of processed messages from an earlier cycle");
        }

        let merged = merge(&snapshot, &update);
        match self.persist(merged.clone()).await {
            Ok(()) => {
                report.persisted = true;
                inner.unpersisted.store(false, Ordering::Release);
            }
            Err(error) => {
                inner.unpersisted.store(true, Ordering::Release);
                tracing::error!(
                    %error,
                    path = %inner.store.path().display(),
                    "failed to persist processed messages, will retry next cycle"
                );
            }
        }
        *inner.processed.lock().await = Arc::new(merged);

        tracing::info!(
            new_messages = report.new_messages,
            published = report.published,
            failed_channels = report.failed_channels.len(),
            "digest cycle finished"
        );
        report
    }

    /// `Ok(false)` when summarization failed; delivery failures are `Err`.
    async fn publish_one(&self, target: &ChatTarget, msg: &BatchMessage) -> Result<bool> {
        let Some(formatted) = self.inner.transformer.transform(&msg.text).await else {
            return Ok(false);
        };
        match self.inner.publisher.publish(target, &formatted).await {
            Ok(()) => Ok(true),
            Err(error) => {
                tracing::error!(%target, %error, "failed to publish digest entry");
                Err(error)
            }
        }
    }

    async fn persist(&self, set: ProcessedSet) -> Result<()> {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || store.persist(&set))
            .await
            .map_err(|e| Error::External(format!("persist task failed: {e}")))?
    }

    /// Fire a cycle at every match of `expr` until `cancel` fires.
    ///
    /// Cycles run on their own tasks so a long cycle never delays the timer; on
    /// shutdown the loop waits for a running cycle to finish.
    pub async fn run(&self, expr: CronExpr, cancel: CancellationToken) {
        let mut cycles = JoinSet::new();

        loop {
            let now = Local::now();
            let Some(next) = expr.next_after(now) else {
                tracing::warn!("digest schedule has no next run, stopping");
                break;
            };
            tracing::info!(next_run = %next.format("%Y-%m-%d %H:%M %Z"), "next digest scheduled");

            let dur = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(dur) => {
                    let scheduler = self.clone();
                    cycles.spawn(async move { scheduler.trigger().await });
                }
            }

            while let Some(done) = cycles.try_join_next() {
                log_cycle(done);
            }
        }

        while let Some(done) = cycles.join_next().await {
            log_cycle(done);
        }
        tracing::info!("digest scheduler stopped");
    }
}

fn log_cycle(done: std::result::Result<TriggerOutcome, tokio::task::JoinError>) {
    match done {
        Ok(TriggerOutcome::Completed(report)) => tracing::debug!(?report, "digest cycle joined"),
        Ok(TriggerOutcome::Dropped) => {}
        Err(error) => tracing::error!(%error, "digest cycle task failed"),
    }
}

// === Cron expression engine ===

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronExpr {
    min: Field,
    hour: Field,
    dom: Field,
    mon: Field,
    dow: Field,
}

/// Allowed values of one cron field as a bitmask (bit n = value n).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Field {
    bits: u64,
    any: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let [min, hour, dom, mon, dow] = parts[..] else {
            return Err(Error::Config(format!(
                "cron expression {expr:?}: expected 5 fields, got {}",
                parts.len()
            )));
        };

        Ok(Self {
            min: Field::parse(min, 0, 59, false)?,
            hour: Field::parse(hour, 0, 23, false)?,
            dom: Field::parse(dom, 1, 31, false)?,
            mon: Field::parse(mon, 1, 12, false)?,
            dow: Field::parse(dow, 0, 6, true)?,
        })
    }

    pub fn matches(&self, dt: DateTime<Local>) -> bool {
        if !self.min.contains(dt.minute())
            || !self.hour.contains(dt.hour())
            || !self.mon.contains(dt.month())
        {
            return false;
        }

        // If both day fields are restricted, either one matching is enough.
        let dom_match = self.dom.contains(dt.day());
        let dow_match = self.dow.contains(dt.weekday().num_days_from_sunday());
        match (self.dom.any, self.dow.any) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        }
    }

    /// First matching minute strictly after `now`, searched up to a year ahead.
    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut t = (now + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        for _ in 0..366 * 24 * 60 {
            if self.matches(t) {
                return Some(t);
            }
            t += chrono::Duration::minutes(1);
        }
        None
    }
}

impl Field {
    /// `sunday_as_7` admits 7 as an alias of 0 (day-of-week), also as a range bound.
    fn parse(raw: &str, min: u32, max: u32, sunday_as_7: bool) -> Result<Self> {
        let full = range_bits(min, max, 1);
        let upper = if sunday_as_7 { max + 1 } else { max };
        let mut bits = 0u64;

        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => {
                    let step: u32 = step
                        .trim()
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid cron step: {step}")))?;
                    if step == 0 {
                        return Err(Error::Config("cron step must be > 0".to_string()));
                    }
                    (base.trim(), Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                (parse_value(a.trim())?, parse_value(b.trim())?)
            } else {
                let v = parse_value(base)?;
                (v, if step.is_some() { max } else { v })
            };

            if start < min || end > upper || start > end {
                return Err(Error::Config(format!(
                    "cron value out of range {min}-{upper}: {base}"
                )));
            }
            bits |= range_bits(start, end, step.unwrap_or(1));
        }

        if sunday_as_7 && bits & (1 << 7) != 0 {
            bits = (bits & !(1 << 7)) | 1;
        }

        if bits == 0 {
            return Err(Error::Config(format!("empty cron field: {raw:?}")));
        }
        Ok(Self {
            bits,
            any: bits == full,
        })
    }

    fn contains(&self, v: u32) -> bool {
        v < 64 && self.bits & (1 << v) != 0
    }
}

fn range_bits(start: u32, end: u32, step: u32) -> u64 {
    (start..=end)
        .step_by(step as usize)
        .fold(0u64, |acc, v| acc | (1 << v))
}

fn parse_value(s: &str) -> Result<u32> {
    s.parse()
        .map_err(|_| Error::Config(format!("invalid cron value: {s}")))
}

// === Tests ===
