//! Offline-first API client combining the cache manager and the sync queue.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use url::Url;

use crate::cache::{CacheManager, CacheResult, CacheStorage};
use crate::net::{FetchError, FetchRequest, Fetcher, Response};
use crate::routes;
use crate::sync::{QueueStore, SyncQueue, SyncQueueItem};

/// Outcome of a mutating request.
#[derive(Debug)]
pub enum Submission {
  /// The server answered (any status below 500)
  Sent(Response),
  /// The network failed; the request waits in the background sync queue
  Queued(SyncQueueItem),
}

/// API client with transparent caching and background sync.
///
/// Reads go through the cache manager using the strategy of the URL's
/// resource class. Writes go straight to the network and fall back to the
/// sync queue when the class has background sync enabled.
pub struct OfflineClient<S: CacheStorage, Q: QueueStore, F: Fetcher> {
  base_url: Url,
  cache: CacheManager<S, F>,
  queue: Arc<SyncQueue<Q, F>>,
}

impl<S: CacheStorage, Q: QueueStore, F: Fetcher> OfflineClient<S, Q, F> {
  pub fn new(base_url: &str, cache: CacheManager<S, F>, queue: Arc<SyncQueue<Q, F>>) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    Ok(Self {
      base_url,
      cache,
      queue,
    })
  }

  pub fn cache(&self) -> &CacheManager<S, F> {
    &self.cache
  }

  pub fn queue(&self) -> &Arc<SyncQueue<Q, F>> {
    &self.queue
  }

  /// Resolve a path (or absolute URL) against the API base URL.
  pub fn resolve(&self, path: &str) -> Result<String> {
    self
      .base_url
      .join(path)
      .map(String::from)
      .map_err(|e| eyre!("Invalid request path {}: {}", path, e))
  }

  /// Fetch a resource with the strategy of its resource class.
  /// Unclassified URLs are not cached.
  pub async fn get(&self, path: &str) -> Result<CacheResult<Response>> {
    let url = self.resolve(path)?;
    match routes::classify(&url) {
      Some(class) => self.cache.fetch(&url, class).await,
      None => self.cache.fetch_uncached(&url).await,
    }
  }

  /// Fetch a resource with an explicitly named strategy.
  pub async fn get_with(&self, path: &str, strategy_name: &str) -> Result<CacheResult<Response>> {
    let url = self.resolve(path)?;
    self.cache.fetch(&url, strategy_name).await
  }

  /// Send a mutating request, queueing it for background sync on failure.
  ///
  /// Network errors, timeouts and 5xx responses count as failures. A 4xx is
  /// returned as sent: replaying it would not change the answer.
  pub async fn submit(&self, method: &str, path: &str, body: Option<String>) -> Result<Submission> {
    let url = self.resolve(path)?;
    let request = FetchRequest::new(method, url.clone(), body.clone());

    let failure = match tokio::time::timeout(
      self.cache.network_timeout(),
      self.cache.fetcher().fetch(request),
    )
    .await
    {
      Ok(Ok(response)) if response.status < 500 => return Ok(Submission::Sent(response)),
      Ok(Ok(response)) => format!("HTTP {}", response.status),
      Ok(Err(e)) => e.to_string(),
      Err(_) => "timed out".to_string(),
    };

    if !self.background_sync_enabled(&url) {
      return Err(FetchError::failed(&url, failure).into());
    }

    let item = self.queue.enqueue(&url, method, body).await?;
    Ok(Submission::Queued(item))
  }

  fn background_sync_enabled(&self, url: &str) -> bool {
    routes::classify(url)
      .and_then(|class| self.cache.registry().lookup(class))
      .map(|strategy| strategy.background_sync)
      .unwrap_or(false)
  }
}
