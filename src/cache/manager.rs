//! Cache manager that applies a strategy to each resource request.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::storage::{CacheStorage, StoredEntry};
use super::strategy::{CacheStrategy, StrategyKind, StrategyRegistry};
use super::traits::{CacheResult, Clock, Revalidation, SystemClock};
use crate::net::{FetchError, FetchRequest, Fetcher, Response};

/// Cache manager that resolves requests against the strategy registry.
///
/// Storage, network and clock are injected so the manager can be built
/// against in-memory fakes.
pub struct CacheManager<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  registry: Arc<StrategyRegistry>,
  clock: Arc<dyn Clock>,
  /// Upper bound for a single network round trip
  network_timeout: Duration,
}

impl<S: CacheStorage, F: Fetcher> CacheManager<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, registry: Arc<StrategyRegistry>) -> Self {
    Self {
      storage,
      fetcher,
      registry,
      clock: Arc::new(SystemClock),
      network_timeout: Duration::from_secs(10),
    }
  }

  #[cfg(test)]
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
    self.network_timeout = timeout;
    self
  }

  pub fn registry(&self) -> &StrategyRegistry {
    &self.registry
  }

  #[cfg(test)]
  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn fetcher(&self) -> &Arc<F> {
    &self.fetcher
  }

  pub fn network_timeout(&self) -> Duration {
    self.network_timeout
  }

  /// Fetch a resource using the named strategy.
  ///
  /// Unknown strategy names are never cached: the request goes straight to
  /// the network and nothing is written.
  pub async fn fetch(&self, url: &str, strategy_name: &str) -> Result<CacheResult<Response>> {
    match self.registry.lookup(strategy_name) {
      Some(strategy) => self.fetch_with(url, strategy).await,
      None => {
        warn!(url, strategy = strategy_name, "unknown cache strategy, bypassing cache");
        self.fetch_uncached(url).await
      }
    }
  }

  /// Fetch from the network without reading or writing any partition.
  pub async fn fetch_uncached(&self, url: &str) -> Result<CacheResult<Response>> {
    let response = self.network(url).await?;
    Ok(CacheResult::from_network(response))
  }

  /// Fetch a resource with an explicit strategy.
  pub async fn fetch_with(
    &self,
    url: &str,
    strategy: &CacheStrategy,
  ) -> Result<CacheResult<Response>> {
    match strategy.kind {
      StrategyKind::CacheFirst => self.cache_first(url, strategy).await,
      StrategyKind::NetworkFirst => self.network_first(url, strategy).await,
      StrategyKind::StaleWhileRevalidate => self.stale_while_revalidate(url, strategy).await,
    }
  }

  /// 1. Fresh cached entry: return it, no network
  /// 2. Otherwise fetch and store
  /// 3. On network failure, serve an expired entry if there is one
  async fn cache_first(&self, url: &str, strategy: &CacheStrategy) -> Result<CacheResult<Response>> {
    let partition = strategy.partition();

    if let Some(cached) = self.cached(&partition, url) {
      if !self.is_expired(&cached, strategy) {
        debug!(url, partition = %partition, "cache hit");
        return Ok(CacheResult::from_cache(cached.response, cached.cached_at, false));
      }

      return match self.network(url).await {
        Ok(response) => {
          self.store(strategy, url, &response);
          Ok(CacheResult::from_network(response))
        }
        Err(e) => {
          debug!(url, error = %e, "network failed, serving expired entry");
          Ok(CacheResult::offline(cached.response, cached.cached_at))
        }
      };
    }

    let response = self.network(url).await?;
    self.store(strategy, url, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Network, falling back to any cached entry on error, non-2xx or timeout.
  async fn network_first(
    &self,
    url: &str,
    strategy: &CacheStrategy,
  ) -> Result<CacheResult<Response>> {
    let partition = strategy.partition();

    match self.network(url).await {
      Ok(response) => {
        self.store(strategy, url, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.cached(&partition, url) {
        Some(cached) => {
          debug!(url, error = %e, "network failed, serving cached entry");
          Ok(CacheResult::offline(cached.response, cached.cached_at))
        }
        None => Err(e),
      },
    }
  }

  /// Serve the cached entry immediately and refresh it in a background task.
  /// A miss behaves like cache-first.
  async fn stale_while_revalidate(
    &self,
    url: &str,
    strategy: &CacheStrategy,
  ) -> Result<CacheResult<Response>> {
    let partition = strategy.partition();

    let Some(cached) = self.cached(&partition, url) else {
      let response = self.network(url).await?;
      self.store(strategy, url, &response);
      return Ok(CacheResult::from_network(response));
    };

    let is_stale = self.is_expired(&cached, strategy);
    let revalidation = self.spawn_revalidation(url, strategy);

    Ok(
      CacheResult::from_cache(cached.response, cached.cached_at, is_stale)
        .with_revalidation(revalidation),
    )
  }

  fn spawn_revalidation(&self, url: &str, strategy: &CacheStrategy) -> Revalidation {
    let refresher = Refresher {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      clock: Arc::clone(&self.clock),
      network_timeout: self.network_timeout,
      strategy: strategy.clone(),
      url: url.to_string(),
    };

    Revalidation::new(tokio::spawn(refresher.run()))
  }

  fn cached(&self, partition: &str, url: &str) -> Option<StoredEntry> {
    match self.storage.get(partition, url) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url, partition, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  fn is_expired(&self, entry: &StoredEntry, strategy: &CacheStrategy) -> bool {
    let age = (self.clock.now() - entry.cached_at)
      .to_std()
      .unwrap_or(Duration::ZERO);
    strategy.is_expired(age)
  }

  async fn network(&self, url: &str) -> Result<Response> {
    fetch_ok(self.fetcher.as_ref(), url, self.network_timeout).await
  }

  fn store(&self, strategy: &CacheStrategy, url: &str, response: &Response) {
    write_entry(
      self.storage.as_ref(),
      strategy,
      url,
      response,
      self.clock.as_ref(),
    );
  }
}

/// Owned state for one background refresh.
struct Refresher<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  clock: Arc<dyn Clock>,
  network_timeout: Duration,
  strategy: CacheStrategy,
  url: String,
}

impl<S: CacheStorage, F: Fetcher> Refresher<S, F> {
  async fn run(self) -> bool {
    match fetch_ok(self.fetcher.as_ref(), &self.url, self.network_timeout).await {
      Ok(response) => write_entry(
        self.storage.as_ref(),
        &self.strategy,
        &self.url,
        &response,
        self.clock.as_ref(),
      ),
      Err(e) => {
        warn!(url = %self.url, error = %e, "background revalidation failed");
        false
      }
    }
  }
}

/// GET with a timeout; non-2xx counts as a failure.
async fn fetch_ok<F: Fetcher>(fetcher: &F, url: &str, timeout: Duration) -> Result<Response> {
  let response = match tokio::time::timeout(timeout, fetcher.fetch(FetchRequest::get(url))).await {
    Ok(result) => result?,
    Err(_) => {
      return Err(
        FetchError::Timeout {
          url: url.to_string(),
          timeout_ms: timeout.as_millis(),
        }
        .into(),
      )
    }
  };

  if !response.is_success() {
    return Err(FetchError::failed(url, format!("HTTP {}", response.status)).into());
  }

  Ok(response)
}

/// Best-effort write followed by FIFO quota enforcement.
/// Returns whether the entry was written.
fn write_entry<S: CacheStorage>(
  storage: &S,
  strategy: &CacheStrategy,
  url: &str,
  response: &Response,
  clock: &dyn Clock,
) -> bool {
  let partition = strategy.partition();
  let entry = StoredEntry {
    url: url.to_string(),
    response: response.clone(),
    cached_at: clock.now(),
  };

  if let Err(e) = storage.put(&partition, &entry) {
    warn!(url, partition = %partition, error = %e, "cache write failed");
    return false;
  }

  if let Err(e) = enforce_max_entries(storage, &partition, strategy.max_entries) {
    warn!(partition = %partition, error = %e, "quota enforcement failed");
  }

  true
}

/// Delete oldest-inserted entries until the partition fits `max_entries`.
/// Returns the evicted URLs.
pub fn enforce_max_entries<S: CacheStorage + ?Sized>(
  storage: &S,
  partition: &str,
  max_entries: usize,
) -> Result<Vec<String>> {
  let count = storage.entry_count(partition)?;
  if count <= max_entries {
    return Ok(Vec::new());
  }

  let excess = count - max_entries;
  let evicted: Vec<String> = storage.keys(partition)?.into_iter().take(excess).collect();
  for url in &evicted {
    storage.delete(partition, url)?;
  }

  debug!(partition, evicted = evicted.len(), "evicted oldest entries");
  Ok(evicted)
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheManager<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      registry: Arc::clone(&self.registry),
      clock: Arc::clone(&self.clock),
      network_timeout: self.network_timeout,
    }
  }
}
