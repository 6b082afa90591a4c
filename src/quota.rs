//! Storage quota monitoring and emergency eviction.
//!
//! Emergency cleanup is a heuristic: it drops legacy partitions and the
//! oldest share of the images partition, which is usually the largest and
//! least time-sensitive. It does not guarantee usage falls below the
//! threshold.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheStorage, StrategyRegistry, CACHE_VERSION};
use crate::config::QuotaConfig;

/// Raw usage figures from a [`UsageEstimator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
  pub usage_bytes: u64,
  pub quota_bytes: u64,
}

/// Source of storage usage and quota figures.
pub trait UsageEstimator: Send + Sync {
  fn estimate(&self) -> Result<StorageEstimate>;
}

/// Measures what the cache storage holds against a fixed budget.
pub struct BudgetEstimator<S: CacheStorage> {
  storage: Arc<S>,
  budget_bytes: u64,
}

impl<S: CacheStorage> BudgetEstimator<S> {
  pub fn new(storage: Arc<S>, budget_bytes: u64) -> Self {
    Self {
      storage,
      budget_bytes,
    }
  }
}

impl<S: CacheStorage> UsageEstimator for BudgetEstimator<S> {
  fn estimate(&self) -> Result<StorageEstimate> {
    Ok(StorageEstimate {
      usage_bytes: self.storage.usage_bytes()?,
      quota_bytes: self.budget_bytes,
    })
  }
}

/// Point-in-time storage usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageQuotaSnapshot {
  pub used_bytes: u64,
  pub available_bytes: u64,
  pub percentage_used: f64,
}

impl From<StorageEstimate> for StorageQuotaSnapshot {
  fn from(estimate: StorageEstimate) -> Self {
    let percentage_used = if estimate.quota_bytes == 0 {
      100.0
    } else {
      estimate.usage_bytes as f64 / estimate.quota_bytes as f64 * 100.0
    };

    Self {
      used_bytes: estimate.usage_bytes,
      available_bytes: estimate.quota_bytes.saturating_sub(estimate.usage_bytes),
      percentage_used,
    }
  }
}

/// What emergency cleanup removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
  pub deleted_partitions: Vec<String>,
  pub evicted_images: usize,
}

/// Result of a quota check.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaStatus {
  pub snapshot: StorageQuotaSnapshot,
  /// Present when the threshold was exceeded
  pub cleanup: Option<CleanupReport>,
}

pub struct QuotaMonitor<S: CacheStorage, E: UsageEstimator> {
  storage: Arc<S>,
  estimator: E,
  registry: Arc<StrategyRegistry>,
  config: QuotaConfig,
}

impl<S: CacheStorage, E: UsageEstimator> QuotaMonitor<S, E> {
  pub fn new(
    storage: Arc<S>,
    estimator: E,
    registry: Arc<StrategyRegistry>,
    config: QuotaConfig,
  ) -> Self {
    Self {
      storage,
      estimator,
      registry,
      config,
    }
  }

  /// Current usage without side effects.
  pub fn snapshot(&self) -> Result<StorageQuotaSnapshot> {
    Ok(self.estimator.estimate()?.into())
  }

  /// Measure usage and run emergency cleanup above the threshold.
  pub fn check_quota(&self) -> Result<QuotaStatus> {
    let snapshot = self.snapshot()?;

    let cleanup = if snapshot.percentage_used > self.config.threshold_percent {
      warn!(
        used = snapshot.used_bytes,
        percentage = snapshot.percentage_used,
        threshold = self.config.threshold_percent,
        "storage quota threshold exceeded"
      );
      Some(self.emergency_cleanup()?)
    } else {
      None
    };

    Ok(QuotaStatus { snapshot, cleanup })
  }

  /// Drop legacy partitions, then the oldest share of the images partition.
  pub fn emergency_cleanup(&self) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    for partition in self.storage.partitions()? {
      if self.is_legacy(&partition) && self.storage.delete_partition(&partition)? {
        report.deleted_partitions.push(partition);
      }
    }

    if let Some(images) = self.registry.lookup("images") {
      let partition = images.partition();
      let keys = self.storage.keys(&partition)?;
      let to_evict = (keys.len() as f64 * self.config.image_eviction_ratio).floor() as usize;

      for url in keys.iter().take(to_evict) {
        if self.storage.delete(&partition, url)? {
          report.evicted_images += 1;
        }
      }
    }

    info!(
      partitions = report.deleted_partitions.len(),
      images = report.evicted_images,
      "emergency cleanup finished"
    );
    Ok(report)
  }

  /// Legacy: carries a configured marker, or a cache version other than the
  /// current one.
  fn is_legacy(&self, partition: &str) -> bool {
    if self
      .config
      .legacy_markers
      .iter()
      .any(|marker| !marker.is_empty() && partition.contains(marker.as_str()))
    {
      return true;
    }

    match partition.rsplit_once("-cache-") {
      Some((_, version)) => version != CACHE_VERSION,
      None => false,
    }
  }
}
