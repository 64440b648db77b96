//! Durable record of which channel messages the batch path already handled.
//!
//! On disk this is a single JSON object: `{"<channel>": [id, id, ...], ...}`.
//! Entries whose value is not an array are ignored on load, so newer writers
//! can add top-level metadata without breaking older readers.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    domain::{ChannelId, MessageId},
    errors::Error,
    Result,
};

/// Ids discovered in one cycle, per channel, waiting to be merged.
pub type ProcessedUpdate = BTreeMap<ChannelId, Vec<MessageId>>;

/// Channel → processed message ids, in insertion order, no duplicates per channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessedSet {
    channels: BTreeMap<ChannelId, Vec<MessageId>>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self, channel: &ChannelId) -> &[MessageId] {
        self.channels
            .get(channel)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelId> {
        self.channels.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Total number of ids across all channels.
    pub fn len(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    fn to_json(&self) -> serde_json::Value {
        let map = self
            .channels
            .iter()
            .map(|(c, ids)| {
                let arr = ids.iter().map(|id| serde_json::Value::from(id.0)).collect();
                (c.as_str().to_string(), serde_json::Value::Array(arr))
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    fn from_json(path: &Path, value: serde_json::Value) -> Result<Self> {
        let corrupt = |reason: String| Error::StorageCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let serde_json::Value::Object(map) = value else {
            return Err(corrupt("top-level value is not an object".to_string()));
        };

        let mut set = ProcessedSet::new();
        for (key, value) in map {
            let serde_json::Value::Array(items) = value else {
                tracing::debug!(key = %key, "ignoring non-channel entry in processed store");
                continue;
            };

            let channel = ChannelId::new(&key);
            let mut ids = Vec::with_capacity(items.len());
            for item in items {
                let id = item
                    .as_i64()
                    .and_then(|n| i32::try_from(n).ok())
                    .ok_or_else(|| corrupt(format!("channel {key}: invalid message id {item}")))?;
                ids.push(MessageId(id));
            }

            let entry = set.channels.entry(channel).or_default();
            for id in ids {
                if !entry.contains(&id) {
                    entry.push(id);
                }
            }
        }

        Ok(set)
    }
}

impl<const N: usize> From<[(&str, Vec<i32>); N]> for ProcessedSet {
    fn from(entries: [(&str, Vec<i32>); N]) -> Self {
        let update = entries
            .into_iter()
            .map(|(c, ids)| (ChannelId::new(c), ids.into_iter().map(MessageId).collect()))
            .collect::<ProcessedUpdate>();
        merge(&ProcessedSet::new(), &update)
    }
}

/// Has the batch path already handled `id` in `channel`?
pub fn is_processed(set: &ProcessedSet, channel: &ChannelId, id: MessageId) -> bool {
    set.ids(channel).contains(&id)
}

/// Append every id in `updates` that `base` does not already hold for its channel.
///
/// Channels missing from `updates` are carried over untouched; nothing is removed.
pub fn merge(base: &ProcessedSet, updates: &ProcessedUpdate) -> ProcessedSet {
    let mut out = base.clone();
    for (channel, ids) in updates {
        if ids.is_empty() {
            continue;
        }
        let entry = out.channels.entry(channel.clone()).or_default();
        for id in ids {
            if !entry.contains(id) {
                entry.push(*id);
            }
        }
    }
    out
}

/// File-backed owner of the processed set.
#[derive(Clone, Debug)]
pub struct DedupStore {
    path: PathBuf,
}

impl DedupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted set; a missing or empty file is a first run.
    pub fn load(&self) -> Result<ProcessedSet> {
        let txt = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ProcessedSet::new()),
            Err(e) => {
                return Err(Error::StorageCorrupt {
                    path: self.path.clone(),
                    reason: format!("unreadable: {e}"),
                })
            }
        };

        if txt.trim().is_empty() {
            return Ok(ProcessedSet::new());
        }

        let value: serde_json::Value =
            serde_json::from_str(&txt).map_err(|e| Error::StorageCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        ProcessedSet::from_json(&self.path, value)
    }

    /// Replace the persisted set.
    ///
    /// Writes a sibling temp file, syncs it and renames it over the target, so a
    /// crash leaves either the previous or the new document, never a torn one.
    pub fn persist(&self, set: &ProcessedSet) -> Result<()> {
        let body = serde_json::to_vec_pretty(&set.to_json())?;
        write_atomic(&self.path, &body)
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .ok_or_else(|| Error::Config(format!("invalid store path: {}", path.display())))?;
    let tmp_path = parent.join(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    {
        let mut tmp = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        tmp.write_all(content)?;
        tmp.sync_all()?;
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(Error::Io(err));
    }

    if let Ok(dir) = fs::File::open(&parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
