//! Groq summarization adapter.
//!
//! `POST {url}` with a bearer key and `{"text": ...}`; expects `{"summary": ...}` back.

use std::time::Duration;

use async_trait::async_trait;
use dzen_core::{errors::Error, transform::Summarizer, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct SummarizeResponse {
    summary: String,
}

#[derive(Clone, Debug)]
pub struct GroqSummarizer {
    api_key: String,
    url: String,
    http: reqwest::Client,
}

impl GroqSummarizer {
    pub fn new(api_key: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl Summarizer for GroqSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&SummarizeRequest { text })
            .send()
            .await
            .map_err(|e| Error::Summarize(format!("request error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Summarize(format!(
                "{status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: SummarizeResponse = resp
            .json()
            .await
            .map_err(|e| Error::Summarize(format!("malformed response: {e}")))?;

        tracing::debug!(chars = parsed.summary.chars().count(), "summary received");
        Ok(parsed.summary)
    }
}
