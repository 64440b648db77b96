use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use dzen_core::{
    auth::{establish_session, ConsolePrompt},
    chat::{
        port::ChatClient,
        throttled::{ThrottleConfig, ThrottledChat},
    },
    config::Config,
    dedup::DedupStore,
    live::LiveHandler,
    publisher::Publisher,
    scheduler::{CronExpr, DigestScheduler, DigestSettings},
    transform::Transformer,
};
use dzen_groq::GroqSummarizer;
use dzen_telegram::TelegramClient;

#[tokio::main]
async fn main() -> Result<(), dzen_core::Error> {
    dzen_core::logging::init("dzen")?;

    let cfg = Config::load()?;

    // A corrupt store must stop us before anything is re-published.
    let store = DedupStore::new(&cfg.processed_file);
    let processed = store.load()?;
    tracing::info!(
        path = %store.path().display(),
        channels = processed.channels().count(),
        messages = processed.len(),
        "loaded processed messages"
    );

    let telegram = Arc::new(TelegramClient::new(
        cfg.api_id,
        cfg.api_hash.clone(),
        &cfg.session_file,
    )?);
    establish_session(telegram.as_ref(), &ConsolePrompt).await?;

    run(cfg, telegram.clone(), store, processed)
        .await
        .map_err(|e| dzen_core::Error::External(format!("relay failed: {e:#}")))?;

    telegram.disconnect();
    Ok(())
}

async fn run(
    cfg: Config,
    telegram: Arc<TelegramClient>,
    store: DedupStore,
    processed: dzen_core::dedup::ProcessedSet,
) -> anyhow::Result<()> {
    let chat: Arc<dyn ChatClient> = telegram.clone();
    let outbound: Arc<dyn ChatClient> =
        Arc::new(ThrottledChat::new(chat.clone(), ThrottleConfig::default()));

    let summarizer = Arc::new(
        GroqSummarizer::new(
            cfg.groq_api_key.clone(),
            cfg.summarize_url.clone(),
            cfg.summarize_timeout,
        )
        .context("building summarizer")?,
    );
    let transformer = Arc::new(Transformer::new(
        summarizer,
        cfg.summarize_timeout,
        cfg.watermark.clone(),
    ));
    let publisher = Arc::new(Publisher::new(outbound.clone(), cfg.publish_timeout));

    let expr = CronExpr::parse(&cfg.digest_cron)
        .with_context(|| format!("invalid digest schedule {:?}", cfg.digest_cron))?;
    let scheduler = DigestScheduler::new(
        outbound,
        transformer.clone(),
        publisher.clone(),
        store,
        processed,
        DigestSettings {
            channels: cfg.channels.clone(),
            fetch_limit: cfg.fetch_limit,
            fetch_concurrency: cfg.fetch_concurrency,
        },
    );

    let live = Arc::new(LiveHandler::new(
        cfg.channels.clone(),
        transformer,
        publisher,
    ));
    let updates = telegram
        .subscribe()
        .await
        .context("subscribing to updates")?;

    tracing::info!(
        channels = cfg.channels.len(),
        digest = %cfg.digest_cron,
        "relay started"
    );

    let cancel = CancellationToken::new();
    let digest_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run(expr, cancel).await }
    });
    let live_task = tokio::spawn(live.run(updates, cfg.live_max_in_flight, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::warn!("shutdown requested");
    cancel.cancel();

    let (digest, live) = tokio::join!(digest_task, live_task);
    digest.context("digest scheduler task")?;
    live.context("live handler task")?;
    Ok(())
}
