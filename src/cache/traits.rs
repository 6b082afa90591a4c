//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use tokio::task::JoinHandle;

/// Source of "now" for expiry and backoff decisions.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Handle to a background revalidation.
///
/// Dropping it detaches the refresh; awaiting [`Revalidation::wait`]
/// reports whether the cache was updated.
#[derive(Debug)]
pub struct Revalidation {
  handle: JoinHandle<bool>,
}

impl Revalidation {
  pub(crate) fn new(handle: JoinHandle<bool>) -> Self {
    Self { handle }
  }

  /// Wait for the refresh to finish. Returns `true` if the cache was updated.
  pub async fn wait(self) -> Result<bool> {
    self
      .handle
      .await
      .map_err(|e| eyre!("Revalidation task failed: {}", e))
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Background refresh started by stale-while-revalidate
  pub revalidation: Option<Revalidation>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      revalidation: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
      revalidation: None,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      revalidation: None,
    }
  }

  pub fn with_revalidation(mut self, revalidation: Revalidation) -> Self {
    self.revalidation = Some(revalidation);
    self
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its max age, refresh in progress
  CacheStale,
  /// Network unavailable, serving cached data
  Offline,
}

impl CacheSource {
  pub fn is_cached(&self) -> bool {
    !matches!(self, CacheSource::Network)
  }
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheSource::Network => write!(f, "network"),
      CacheSource::CacheFresh => write!(f, "cache"),
      CacheSource::CacheStale => write!(f, "cache (stale)"),
      CacheSource::Offline => write!(f, "cache (offline)"),
    }
  }
}
