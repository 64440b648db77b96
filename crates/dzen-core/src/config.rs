use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::ChannelId, errors::Error, Result};

pub const DEFAULT_WATERMARK: &str = "\n\nТелеграмм | Дзен";
pub const DEFAULT_SUMMARIZE_URL: &str = "https://api.groq.com/summarize";

/// Typed configuration.
///
/// Values come from the process environment, after a `.env` file in the
/// working directory has been merged in (existing variables win).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub api_id: i32,
    pub api_hash: String,
    pub session_file: PathBuf,
    pub channels: Vec<ChannelId>,

    // Summarization
    pub groq_api_key: String,
    pub summarize_url: String,
    pub summarize_timeout: Duration,
    pub watermark: String,

    // Digest schedule (5-field cron expression, local time)
    pub digest_cron: String,

    // Dedup / batch
    pub processed_file: PathBuf,
    pub fetch_limit: usize,
    pub fetch_concurrency: usize,

    // Live path
    pub live_max_in_flight: usize,
    pub publish_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment, in production).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_id = get("TELEGRAM_API_ID")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("TELEGRAM_API_ID environment variable is required".to_string())
            })?
            .trim()
            .parse::<i32>()
            .map_err(|e| Error::Config(format!("TELEGRAM_API_ID must be an integer: {e}")))?;

        let api_hash = get("TELEGRAM_API_HASH").and_then(non_empty).ok_or_else(|| {
            Error::Config("TELEGRAM_API_HASH environment variable is required".to_string())
        })?;

        let channels = parse_channels(get("WATCHED_CHANNELS"));
        if channels.is_empty() {
            return Err(Error::Config(
                "WATCHED_CHANNELS environment variable is required".to_string(),
            ));
        }

        let groq_api_key = get("GROQ_API_KEY").and_then(non_empty).ok_or_else(|| {
            Error::Config("GROQ_API_KEY environment variable is required".to_string())
        })?;

        let session_file = PathBuf::from(
            get("TELEGRAM_SESSION_FILE")
                .and_then(non_empty)
                .unwrap_or_else(|| "dzen.session".to_string()),
        );
        let summarize_url = get("SUMMARIZE_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_SUMMARIZE_URL.to_string());
        let watermark = get("WATERMARK").unwrap_or_else(|| DEFAULT_WATERMARK.to_string());

        let digest_cron = match get("DIGEST_CRON").and_then(non_empty) {
            Some(cron) => cron,
            None => daily_cron(&get("DIGEST_TIME").unwrap_or_else(|| "09:00".to_string()))?,
        };

        let processed_file = PathBuf::from(
            get("PROCESSED_FILE")
                .and_then(non_empty)
                .unwrap_or_else(|| "processed_messages.json".to_string()),
        );

        let number = |key: &str, default: u64| -> Result<u64> {
            match get(key).and_then(non_empty) {
                None => Ok(default),
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| Error::Config(format!("{key} must be a number: {e}"))),
            }
        };

        let fetch_limit = number("FETCH_LIMIT", 10)?.max(1) as usize;
        let fetch_concurrency = number("FETCH_CONCURRENCY", 4)?.max(1) as usize;
        let live_max_in_flight = number("LIVE_MAX_IN_FLIGHT", 16)?.max(1) as usize;
        let summarize_timeout = Duration::from_millis(number("SUMMARIZE_TIMEOUT_MS", 30_000)?);
        let publish_timeout = Duration::from_millis(number("PUBLISH_TIMEOUT_MS", 15_000)?);

        Ok(Self {
            api_id,
            api_hash,
            session_file,
            channels,
            groq_api_key,
            summarize_url,
            summarize_timeout,
            watermark,
            digest_cron,
            processed_file,
            fetch_limit,
            fetch_concurrency,
            live_max_in_flight,
            publish_timeout,
        })
    }
}

/// Turn `HH:MM` into a once-a-day cron expression.
pub fn daily_cron(time_of_day: &str) -> Result<String> {
    let t = time_of_day.trim();
    let invalid = || Error::Config(format!("DIGEST_TIME must be HH:MM, got {t:?}"));

    let (h, m) = t.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = h.trim().parse().map_err(|_| invalid())?;
    let minute: u32 = m.trim().parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }

    Ok(format!("{minute} {hour} * * *"))
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn parse_channels(v: Option<String>) -> Vec<ChannelId> {
    let mut out: Vec<ChannelId> = Vec::new();
    for c in v
        .unwrap_or_default()
        .split(',')
        .map(ChannelId::new)
        .filter(|c| !c.as_str().is_empty())
    {
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
