//! Summarize + annotate stage shared by the live and batch paths.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{config::DEFAULT_WATERMARK, errors::Error, Result};

/// External summarization service.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Emphasize `text` and append the trailing watermark.
pub fn annotate(text: &str, watermark: &str) -> String {
    format!("**{text}**{watermark}")
}

pub struct Transformer {
    summarizer: Arc<dyn Summarizer>,
    timeout: Duration,
    watermark: String,
}

impl Transformer {
    pub fn new(summarizer: Arc<dyn Summarizer>, timeout: Duration, watermark: String) -> Self {
        Self {
            summarizer,
            timeout,
            watermark,
        }
    }

    pub fn with_default_watermark(summarizer: Arc<dyn Summarizer>, timeout: Duration) -> Self {
        Self::new(summarizer, timeout, DEFAULT_WATERMARK.to_string())
    }

    /// Summary of `text`, or `None` when the service failed (already logged).
    pub async fn summarize(&self, text: &str) -> Option<String> {
        let res = match tokio::time::timeout(self.timeout, self.summarizer.summarize(text)).await {
            Ok(r) => r,
            Err(_) => Err(Error::Summarize(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            ))),
        };

        match res {
            Ok(summary) if !summary.trim().is_empty() => Some(summary),
            Ok(_) => {
                tracing::error!("summarizer returned an empty summary");
                None
            }
            Err(error) => {
                tracing::error!(%error, "error summarizing text");
                None
            }
        }
    }

    pub fn annotate(&self, text: &str) -> String {
        annotate(text, &self.watermark)
    }

    /// Summarize then annotate; `None` if summarization failed.
    pub async fn transform(&self, text: &str) -> Option<String> {
        let summary = self.summarize(text).await?;
        tracing::info!(original = %text, summarized = %summary, "summarized message");
        Some(self.annotate(&summary))
    }
}
