//! Reference implementations of the storage ports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use melony_protocol::{Event, EventStorePort, KeyValuePort, MelonyError, MelonyResult, RunId};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument};

fn storage_error(error: anyhow::Error) -> MelonyError {
    MelonyError::Storage(format!("{error:#}"))
}

/// File-name-safe form of an id; anything outside `[A-Za-z0-9._-]` becomes `_`.
fn file_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {parent:?}"))?;
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    runs: Mutex<HashMap<RunId, Vec<Event>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStorePort for InMemoryEventStore {
    async fn save_event(&self, run_id: &RunId, event: &Event) -> MelonyResult<()> {
        self.runs
            .lock()
            .entry(run_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn get_history(&self, run_id: &RunId) -> MelonyResult<Vec<Event>> {
        Ok(self.runs.lock().get(run_id).cloned().unwrap_or_default())
    }
}

/// One JSONL file per run under `<root>/events/`.
#[derive(Debug)]
pub struct FileEventStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileEventStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join("events")
            .join(format!("{}.jsonl", file_stem(run_id.as_str())))
    }

    fn lock_for(&self, run_id: &RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn append_line(&self, run_id: &RunId, event: &Event) -> Result<()> {
        let path = self.file_path(run_id);
        ensure_parent(&path).await?;

        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening event log {path:?}"))?;

        let line = serde_json::to_string(event).context("failed serializing event")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines(&self, run_id: &RunId) -> Result<Vec<Event>> {
        let path = self.file_path(run_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing event line in {path:?}"))?;
            out.push(event);
        }
        Ok(out)
    }
}

#[async_trait]
impl EventStorePort for FileEventStore {
    #[instrument(skip(self, event), fields(run_id = %run_id, event_type = %event.event_type))]
    async fn save_event(&self, run_id: &RunId, event: &Event) -> MelonyResult<()> {
        self.append_line(run_id, event)
            .await
            .map_err(storage_error)?;
        debug!("event appended to store");
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_history(&self, run_id: &RunId) -> MelonyResult<Vec<Event>> {
        let events = self.read_lines(run_id).await.map_err(storage_error)?;
        debug!(count = events.len(), "events loaded from store");
        Ok(events)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValuePort for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> MelonyResult<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> MelonyResult<()> {
        self.entries.write().insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> MelonyResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// One pretty-printed JSON file per key under `<root>/kv/`.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join("kv").join(format!("{}.json", file_stem(key)))
    }

    async fn read_value(&self, key: &str) -> Result<Option<Value>> {
        let path = self.key_path(key);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed reading {path:?}"))?;
        let value =
            serde_json::from_str(&raw).with_context(|| format!("failed parsing {path:?}"))?;
        Ok(Some(value))
    }

    async fn write_value(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.key_path(key);
        ensure_parent(&path).await?;
        let payload = serde_json::to_string_pretty(value)?;
        fs::write(&path, payload)
            .await
            .with_context(|| format!("failed writing {path:?}"))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValuePort for FileKeyValueStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> MelonyResult<Option<Value>> {
        self.read_value(key).await.map_err(storage_error)
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: Value) -> MelonyResult<()> {
        self.write_value(key, &value).await.map_err(storage_error)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> MelonyResult<()> {
        let path = self.key_path(key);
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path)
                .await
                .map_err(|error| MelonyError::Storage(error.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use melony_protocol::{Event, EventStorePort, KeyValuePort, RunId};
    use serde_json::json;
    use tokio::fs;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn file_event_store_appends_and_reads_in_order() -> Result<()> {
        let root = unique_test_root("melony-events");
        let store = FileEventStore::new(&root);
        let run_id = RunId::from_string("r1");

        store.save_event(&run_id, &Event::text_delta("Hel")).await?;
        store.save_event(&run_id, &Event::text_delta("lo")).await?;

        let history = store.get_history(&run_id).await?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].data_str("delta"), Some("lo"));

        let other = store.get_history(&RunId::from_string("r2")).await?;
        assert!(other.is_empty());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_event_store_sanitizes_run_ids() -> Result<()> {
        let root = unique_test_root("melony-events-sanitize");
        let store = FileEventStore::new(&root);
        let run_id = RunId::from_string("../escape/run");

        store.save_event(&run_id, &Event::text("inside")).await?;
        assert!(root.join("events").join(".._escape_run.jsonl").exists());
        assert_eq!(store.get_history(&run_id).await?.len(), 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn memory_event_store_keeps_runs_apart() -> Result<()> {
        let store = InMemoryEventStore::new();
        let a = RunId::from_string("a");
        let b = RunId::from_string("b");
        store.save_event(&a, &Event::text("one")).await?;
        store.save_event(&b, &Event::text("two")).await?;
        store.save_event(&a, &Event::text("three")).await?;

        let history = store.get_history(&a).await?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].data_str("content"), Some("three"));
        Ok(())
    }

    #[tokio::test]
    async fn file_key_value_store_roundtrip_and_delete() -> Result<()> {
        let root = unique_test_root("melony-kv");
        let store = FileKeyValueStore::new(&root);

        assert_eq!(store.get("run/r1").await?, None);
        store.set("run/r1", json!({ "status": "suspended" })).await?;
        assert_eq!(
            store.get("run/r1").await?,
            Some(json!({ "status": "suspended" }))
        );
        store.delete("run/r1").await?;
        assert_eq!(store.get("run/r1").await?, None);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn memory_key_value_store_overwrites() -> Result<()> {
        let store = InMemoryKeyValueStore::new();
        store.set("k", json!(1)).await?;
        store.set("k", json!(2)).await?;
        assert_eq!(store.get("k").await?, Some(json!(2)));
        Ok(())
    }
}
