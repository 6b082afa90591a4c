use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::{QueueStore, SyncQueueItem};
use crate::cache::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::net::{FetchRequest, Fetcher};

/// Exponential delay between replays of the same item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub base: Duration,
  pub max: Duration,
}

impl Backoff {
  /// Retry on every pass.
  pub const NONE: Backoff = Backoff {
    base: Duration::ZERO,
    max: Duration::ZERO,
  };

  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      base: Duration::from_secs(config.backoff_base_secs),
      max: Duration::from_secs(config.backoff_max_secs),
    }
  }

  /// Delay after the given number of failed attempts.
  pub fn delay(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(attempts.saturating_sub(1).min(16));
    self.base.saturating_mul(factor).min(self.max)
  }

  pub fn is_due(&self, item: &SyncQueueItem, now: DateTime<Utc>) -> bool {
    match item.last_attempt_at {
      Some(last) if item.attempts > 0 => {
        let wait = chrono::Duration::from_std(self.delay(item.attempts))
          .unwrap_or_else(|_| chrono::Duration::zero());
        now >= last + wait
      }
      _ => true,
    }
  }
}

/// Outcome of one `process_queue` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Items replayed successfully and removed
  pub replayed: usize,
  /// Items whose replay failed; they stay queued
  pub failed: usize,
  /// Items skipped because their backoff has not elapsed
  pub deferred: usize,
  /// Items left in the queue afterwards
  pub remaining: usize,
  /// Another pass was already running; nothing was done
  pub already_running: bool,
}

/// Durable queue of mutating requests that could not be sent.
pub struct SyncQueue<Q: QueueStore, F: Fetcher> {
  store: Arc<Q>,
  fetcher: Arc<F>,
  clock: Arc<dyn Clock>,
  backoff: Backoff,
  network_timeout: Duration,
  /// Serializes every read-modify-write of the persisted queue
  state: Mutex<()>,
  /// Held for the duration of a replay pass
  replay: Mutex<()>,
}

impl<Q: QueueStore, F: Fetcher> SyncQueue<Q, F> {
  pub fn new(store: Arc<Q>, fetcher: Arc<F>) -> Self {
    Self {
      store,
      fetcher,
      clock: Arc::new(SystemClock),
      backoff: Backoff::NONE,
      network_timeout: Duration::from_secs(10),
      state: Mutex::new(()),
      replay: Mutex::new(()),
    }
  }

  #[cfg(test)]
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_backoff(mut self, backoff: Backoff) -> Self {
    self.backoff = backoff;
    self
  }

  pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
    self.network_timeout = timeout;
    self
  }

  /// Append a request and persist the queue. Identical requests are not
  /// collapsed.
  pub async fn enqueue(&self, url: &str, method: &str, body: Option<String>) -> Result<SyncQueueItem> {
    let _guard = self.state.lock().await;

    let item = SyncQueueItem::new(url, method, body, self.clock.now());
    let mut items = self.load_locked()?;
    items.push(item.clone());
    self.store.save_all(&items)?;

    info!(url, method = %item.method, queued = items.len(), "queued request for background sync");
    Ok(item)
  }

  /// Currently queued items, oldest first.
  pub async fn pending(&self) -> Result<Vec<SyncQueueItem>> {
    let _guard = self.state.lock().await;
    self.load_locked()
  }

  /// Replay queued items in insertion order.
  ///
  /// Each item is settled in the persisted queue as soon as its replay
  /// finishes: successes are removed, failures stay where they were with
  /// their attempt count bumped. An interrupted pass therefore never leaves
  /// a delivered request behind. Items enqueued while the pass runs are
  /// kept. A second concurrent call returns immediately.
  pub async fn process_queue(&self) -> Result<SyncReport> {
    let Ok(_flight) = self.replay.try_lock() else {
      debug!("sync pass already running");
      return Ok(SyncReport {
        already_running: true,
        ..SyncReport::default()
      });
    };

    let snapshot = {
      let _guard = self.state.lock().await;
      self.load_locked()?
    };

    if snapshot.is_empty() {
      return Ok(SyncReport::default());
    }

    let now = self.clock.now();
    let mut report = SyncReport::default();

    for item in &snapshot {
      if !self.backoff.is_due(item, now) {
        report.deferred += 1;
        continue;
      }

      if self.replay_item(item).await {
        self.settle(&item.id, None).await?;
        report.replayed += 1;
      } else {
        self.settle(&item.id, Some(now)).await?;
        report.failed += 1;
      }
    }

    report.remaining = {
      let _guard = self.state.lock().await;
      self.load_locked()?.len()
    };

    info!(
      replayed = report.replayed,
      failed = report.failed,
      deferred = report.deferred,
      remaining = report.remaining,
      "background sync pass finished"
    );
    Ok(report)
  }

  /// Persist the outcome of one replay. `None` removes the item, `Some`
  /// records a failed attempt at that time.
  async fn settle(&self, id: &str, failed_at: Option<DateTime<Utc>>) -> Result<()> {
    let _guard = self.state.lock().await;
    let mut items = self.load_locked()?;

    match failed_at {
      None => items.retain(|item| item.id != id),
      Some(at) => {
        if let Some(item) = items.iter_mut().find(|item| item.id == id) {
          item.attempts += 1;
          item.last_attempt_at = Some(at);
        }
      }
    }

    self.store.save_all(&items)
  }

  async fn replay_item(&self, item: &SyncQueueItem) -> bool {
    let request = FetchRequest::new(item.method.clone(), item.url.clone(), item.body.clone());

    match tokio::time::timeout(self.network_timeout, self.fetcher.fetch(request)).await {
      Ok(Ok(response)) if response.is_success() => {
        debug!(url = %item.url, status = response.status, "replayed queued request");
        true
      }
      Ok(Ok(response)) => {
        warn!(url = %item.url, status = response.status, "replay rejected, keeping item");
        false
      }
      Ok(Err(e)) => {
        warn!(url = %item.url, error = %e, "replay failed, keeping item");
        false
      }
      Err(_) => {
        warn!(url = %item.url, "replay timed out, keeping item");
        false
      }
    }
  }

  /// Load the queue, giving ids to items persisted without one.
  /// Caller must hold `state`.
  fn load_locked(&self) -> Result<Vec<SyncQueueItem>> {
    let mut items = self.store.load_all()?;

    if items.iter().any(|item| item.id.is_empty()) {
      for item in items.iter_mut().filter(|item| item.id.is_empty()) {
        item.id = item.generate_id();
      }
      self.store.save_all(&items)?;
    }

    Ok(items)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::sync::{MemoryQueueStore, SYNC_QUEUE_KEY};
  use crate::testing::{FakeFetcher, ManualClock};

  fn queue(fetcher: &Arc<FakeFetcher>) -> SyncQueue<MemoryQueueStore, FakeFetcher> {
    SyncQueue::new(Arc::new(MemoryQueueStore::new()), Arc::clone(fetcher))
  }

  fn urls(items: &[SyncQueueItem]) -> Vec<&str> {
    items.iter().map(|i| i.url.as_str()).collect()
  }

  #[tokio::test]
  async fn test_enqueue_persists_in_order() {
    let fetcher = Arc::new(FakeFetcher::new());
    let queue = queue(&fetcher);

    queue.enqueue("/api/votes", "POST", Some("{}".into())).await.unwrap();
    queue.enqueue("/api/orders", "PUT", None).await.unwrap();

    let pending = queue.pending().await.unwrap();
    assert_eq!(urls(&pending), vec!["/api/votes", "/api/orders"]);
    assert_eq!(pending[1].method, "PUT");
  }

  #[tokio::test]
  async fn test_enqueue_does_not_deduplicate() {
    let fetcher = Arc::new(FakeFetcher::new());
    let queue = queue(&fetcher);

    for _ in 0..3 {
      queue.enqueue("/api/votes", "POST", Some("{\"poll\":1}".into())).await.unwrap();
    }

    assert_eq!(queue.pending().await.unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_process_empty_queue_is_noop() {
    let fetcher = Arc::new(FakeFetcher::new());
    let store = Arc::new(MemoryQueueStore::new());
    let queue = SyncQueue::new(Arc::clone(&store), Arc::clone(&fetcher));

    let report = queue.process_queue().await.unwrap();
    assert_eq!(report, SyncReport::default());
    let report = queue.process_queue().await.unwrap();
    assert_eq!(report, SyncReport::default());

    assert_eq!(store.writes(), 0);
    assert!(fetcher.requests().is_empty());
  }

  #[tokio::test]
  async fn test_failed_item_keeps_position() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond("/api/a", 201, "");
    fetcher.fail("/api/b");
    fetcher.respond("/api/c", 200, "");
    let queue = queue(&fetcher);

    for url in ["/api/a", "/api/b", "/api/c"] {
      queue.enqueue(url, "POST", None).await.unwrap();
    }

    let report = queue.process_queue().await.unwrap();
    assert_eq!(report.replayed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);

    let pending = queue.pending().await.unwrap();
    assert_eq!(urls(&pending), vec!["/api/b"]);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_attempt_at.is_some());
  }

  #[tokio::test]
  async fn test_failed_items_keep_relative_order() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond("/api/a", 200, "");
    fetcher.respond("/api/b", 500, "");
    fetcher.respond("/api/c", 200, "");
    fetcher.fail("/api/d");
    let queue = queue(&fetcher);

    for url in ["/api/a", "/api/b", "/api/c", "/api/d"] {
      queue.enqueue(url, "POST", None).await.unwrap();
    }
    queue.process_queue().await.unwrap();

    assert_eq!(urls(&queue.pending().await.unwrap()), vec!["/api/b", "/api/d"]);
  }

  #[tokio::test]
  async fn test_interrupted_pass_does_not_resend_delivered_items() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond("/api/a", 201, "");
    fetcher.hang("/api/b");
    let queue = queue(&fetcher);

    queue.enqueue("/api/a", "POST", None).await.unwrap();
    queue.enqueue("/api/b", "POST", None).await.unwrap();

    let interrupted =
      tokio::time::timeout(Duration::from_millis(100), queue.process_queue()).await;
    assert!(interrupted.is_err());
    assert_eq!(fetcher.calls("/api/a"), 1);
    assert_eq!(urls(&queue.pending().await.unwrap()), vec!["/api/b"]);

    fetcher.respond("/api/b", 200, "");
    let report = queue.process_queue().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(fetcher.calls("/api/a"), 1);
    assert!(queue.pending().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_replay_sends_method_and_body() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond("/api/orders", 200, "");
    let queue = queue(&fetcher);

    queue
      .enqueue("/api/orders", "post", Some("{\"item\":\"bratwurst\"}".into()))
      .await
      .unwrap();
    queue.process_queue().await.unwrap();

    let sent = fetcher.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "POST");
    assert_eq!(sent[0].body.as_deref(), Some("{\"item\":\"bratwurst\"}"));
  }

  #[tokio::test]
  async fn test_concurrent_process_is_single_flight() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.hang("/api/slow");
    let queue = Arc::new(queue(&fetcher).with_network_timeout(Duration::from_millis(100)));
    queue.enqueue("/api/slow", "POST", None).await.unwrap();

    let running = {
      let queue = Arc::clone(&queue);
      tokio::spawn(async move { queue.process_queue().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = queue.process_queue().await.unwrap();
    assert!(second.already_running);

    // Enqueue while the first pass is replaying
    queue.enqueue("/api/new", "POST", None).await.unwrap();

    let first = running.await.unwrap().unwrap();
    assert!(!first.already_running);
    assert_eq!(first.failed, 1);
    assert_eq!(fetcher.calls("/api/slow"), 1);

    let pending = queue.pending().await.unwrap();
    assert_eq!(urls(&pending), vec!["/api/slow", "/api/new"]);
  }

  #[tokio::test]
  async fn test_backoff_defers_recent_failures() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.fail("/api/votes");
    let clock = Arc::new(ManualClock::new());
    let queue = queue(&fetcher)
      .with_clock(clock.clone())
      .with_backoff(Backoff {
        base: Duration::from_secs(10),
        max: Duration::from_secs(60),
      });
    queue.enqueue("/api/votes", "POST", None).await.unwrap();

    assert_eq!(queue.process_queue().await.unwrap().failed, 1);

    let report = queue.process_queue().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.remaining, 1);
    assert_eq!(fetcher.calls("/api/votes"), 1);

    clock.advance(chrono::Duration::seconds(11));
    fetcher.respond("/api/votes", 200, "");
    let report = queue.process_queue().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(queue.pending().await.unwrap().is_empty());
  }

  #[test]
  fn test_backoff_delay_grows_and_caps() {
    let backoff = Backoff {
      base: Duration::from_secs(5),
      max: Duration::from_secs(60),
    };
    assert_eq!(backoff.delay(0), Duration::ZERO);
    assert_eq!(backoff.delay(1), Duration::from_secs(5));
    assert_eq!(backoff.delay(2), Duration::from_secs(10));
    assert_eq!(backoff.delay(3), Duration::from_secs(20));
    assert_eq!(backoff.delay(10), Duration::from_secs(60));
    assert_eq!(Backoff::NONE.delay(4), Duration::ZERO);
  }

  #[tokio::test]
  async fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let fetcher = Arc::new(FakeFetcher::new());

    {
      let storage = Arc::new(SqliteStorage::open(Some(&path)).unwrap());
      let queue = SyncQueue::new(storage, Arc::clone(&fetcher));
      queue.enqueue("/api/votes", "POST", Some("{}".into())).await.unwrap();
    }

    let storage = Arc::new(SqliteStorage::open(Some(&path)).unwrap());
    let queue = SyncQueue::new(storage, Arc::clone(&fetcher));
    let pending = queue.pending().await.unwrap();
    assert_eq!(urls(&pending), vec!["/api/votes"]);
  }

  #[tokio::test]
  async fn test_legacy_items_get_ids() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    storage
      .set_value(
        SYNC_QUEUE_KEY,
        r#"[{"url":"/api/a","method":"POST","enqueuedAt":"2026-07-04T10:00:00Z"},
            {"url":"/api/a","method":"POST","enqueuedAt":"2026-07-04T10:00:00Z"}]"#,
      )
      .unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    let queue = SyncQueue::new(Arc::clone(&storage), fetcher);

    let first = queue.pending().await.unwrap();
    let second = queue.pending().await.unwrap();
    assert_eq!(first, second);
    assert_ne!(first[0].id, first[1].id);
  }
}
