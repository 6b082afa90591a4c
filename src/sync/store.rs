//! Durable storage for the background sync queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::sync::Mutex;

use crate::cache::SqliteStorage;

/// Well-known key holding the serialized queue.
pub const SYNC_QUEUE_KEY: &str = "background-sync-queue";

/// A mutating request waiting to be replayed.
///
/// `id`, `attempts` and `lastAttemptAt` default when absent so queues
/// persisted before they existed still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
  #[serde(default)]
  pub id: String,
  pub url: String,
  pub method: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_attempt_at: Option<DateTime<Utc>>,
}

static ID_SEQ: AtomicU64 = AtomicU64::new(0);

impl SyncQueueItem {
  pub fn new(url: &str, method: &str, body: Option<String>, enqueued_at: DateTime<Utc>) -> Self {
    let mut item = Self {
      id: String::new(),
      url: url.to_string(),
      method: method.to_uppercase(),
      body,
      enqueued_at,
      attempts: 0,
      last_attempt_at: None,
    };
    item.id = item.generate_id();
    item
  }

  /// Identical requests still get distinct ids.
  pub(crate) fn generate_id(&self) -> String {
    let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(self.url.as_bytes());
    hasher.update(self.body.as_deref().unwrap_or("").as_bytes());
    hasher.update(self.enqueued_at.to_rfc3339().as_bytes());
    hasher.update(seq.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
  }
}

/// Read-all / write-all persistence for the queue.
pub trait QueueStore: Send + Sync + 'static {
  fn load_all(&self) -> Result<Vec<SyncQueueItem>>;

  fn save_all(&self, items: &[SyncQueueItem]) -> Result<()>;
}

impl QueueStore for SqliteStorage {
  fn load_all(&self) -> Result<Vec<SyncQueueItem>> {
    match self.get_value(SYNC_QUEUE_KEY)? {
      Some(json) => serde_json::from_str(&json)
        .map_err(|e| eyre!("Failed to parse sync queue: {}", e)),
      None => Ok(Vec::new()),
    }
  }

  fn save_all(&self, items: &[SyncQueueItem]) -> Result<()> {
    let json =
      serde_json::to_string(items).map_err(|e| eyre!("Failed to serialize sync queue: {}", e))?;
    self.set_value(SYNC_QUEUE_KEY, &json)
  }
}

/// Queue store that lives only as long as the process.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
  items: Mutex<Vec<SyncQueueItem>>,
  writes: AtomicU64,
}

#[cfg(test)]
impl MemoryQueueStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of `save_all` calls so far.
  pub fn writes(&self) -> u64 {
    self.writes.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
impl QueueStore for MemoryQueueStore {
  fn load_all(&self) -> Result<Vec<SyncQueueItem>> {
    let items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(items.clone())
  }

  fn save_all(&self, items: &[SyncQueueItem]) -> Result<()> {
    let mut stored = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *stored = items.to_vec();
    self.writes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_identical_items_get_distinct_ids() {
    let now = Utc::now();
    let a = SyncQueueItem::new("/api/votes", "post", None, now);
    let b = SyncQueueItem::new("/api/votes", "post", None, now);
    assert_ne!(a.id, b.id);
    assert_eq!(a.method, "POST");
    assert_eq!(a.id.len(), 16);
  }

  #[test]
  fn test_sqlite_store_roundtrip() {
    let storage = SqliteStorage::in_memory().unwrap();
    assert!(storage.load_all().unwrap().is_empty());

    let item = SyncQueueItem::new("/api/orders", "POST", Some("{\"qty\":2}".into()), Utc::now());
    storage.save_all(std::slice::from_ref(&item)).unwrap();
    assert_eq!(storage.load_all().unwrap(), vec![item]);
  }

  #[test]
  fn test_loads_queue_without_new_fields() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage
      .set_value(
        SYNC_QUEUE_KEY,
        r#"[{"url":"/api/votes","method":"POST","body":"{\"poll\":1}","enqueuedAt":"2026-07-04T10:00:00Z"}]"#,
      )
      .unwrap();

    let items = storage.load_all().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].url, "/api/votes");
    assert_eq!(items[0].attempts, 0);
    assert!(items[0].id.is_empty());
    assert!(items[0].last_attempt_at.is_none());
  }

  #[test]
  fn test_serialized_shape() {
    let item = SyncQueueItem::new("/api/votes", "POST", None, Utc::now());
    let json = serde_json::to_value(&item).unwrap();
    assert!(json.get("enqueuedAt").is_some());
    assert!(json.get("body").is_none());
    assert!(json.get("lastAttemptAt").is_none());
  }

  #[test]
  fn test_memory_store_counts_writes() {
    let store = MemoryQueueStore::new();
    assert_eq!(store.writes(), 0);
    store.save_all(&[]).unwrap();
    assert_eq!(store.writes(), 1);
  }
}
