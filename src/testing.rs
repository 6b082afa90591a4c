//! Test doubles shared by the unit tests.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::cache::{CacheStorage, Clock, StoredEntry};
use crate::net::{FetchError, FetchRequest, Fetcher, Response};

#[derive(Clone)]
enum Outcome {
  Respond(Response),
  Fail,
  Hang,
}

/// Scripted fetcher. URLs without a script fail like an unreachable host.
#[derive(Default)]
pub struct FakeFetcher {
  outcomes: Mutex<HashMap<String, Outcome>>,
  requests: Mutex<Vec<FetchRequest>>,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
    self.script(url, Outcome::Respond(Response::new(status, body)));
  }

  pub fn fail(&self, url: &str) {
    self.script(url, Outcome::Fail);
  }

  pub fn hang(&self, url: &str) {
    self.script(url, Outcome::Hang);
  }

  fn script(&self, url: &str, outcome: Outcome) {
    self.outcomes.lock().unwrap().insert(url.to_string(), outcome);
  }

  /// Number of requests issued for a URL.
  pub fn calls(&self, url: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url == url)
      .count()
  }

  pub fn requests(&self) -> Vec<FetchRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl Fetcher for FakeFetcher {
  fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<Response>> {
    let outcome = self
      .outcomes
      .lock()
      .unwrap()
      .get(&request.url)
      .cloned()
      .unwrap_or(Outcome::Fail);
    self.requests.lock().unwrap().push(request.clone());

    async move {
      match outcome {
        Outcome::Respond(response) => Ok(response),
        Outcome::Fail => Err(FetchError::failed(&request.url, "connection refused").into()),
        Outcome::Hang => futures::future::pending().await,
      }
    }
    .boxed()
  }
}

/// Clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new() -> Self {
    Self {
      now: Mutex::new(Utc::now()),
    }
  }

  pub fn advance(&self, by: chrono::Duration) {
    let mut now = self.now.lock().unwrap();
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

/// Storage whose writes always fail, e.g. a full disk.
pub struct ReadOnlyStorage;

impl CacheStorage for ReadOnlyStorage {
  fn put(&self, partition: &str, _entry: &StoredEntry) -> Result<()> {
    Err(eyre!("Storage quota exceeded writing to {}", partition))
  }

  fn get(&self, _partition: &str, _url: &str) -> Result<Option<StoredEntry>> {
    Ok(None)
  }

  fn delete(&self, _partition: &str, _url: &str) -> Result<bool> {
    Ok(false)
  }

  fn keys(&self, _partition: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn entry_count(&self, _partition: &str) -> Result<usize> {
    Ok(0)
  }

  fn open_partition(&self, _partition: &str) -> Result<()> {
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_partition(&self, _partition: &str) -> Result<bool> {
    Ok(false)
  }

  fn usage_bytes(&self) -> Result<u64> {
    Ok(0)
  }
}
