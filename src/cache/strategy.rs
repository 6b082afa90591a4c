//! Static registry of cache strategies per resource class.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Version suffix of every partition name. Bumping it leaves the previous
/// partitions behind for emergency cleanup to remove.
pub const CACHE_VERSION: &str = "v2";

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

/// How a strategy resolves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
  /// Serve from cache if present, network only on a miss
  CacheFirst,
  /// Prefer the network, fall back to the cache on failure
  NetworkFirst,
  /// Serve the cached value immediately and refresh it in the background
  StaleWhileRevalidate,
}

impl fmt::Display for StrategyKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StrategyKind::CacheFirst => write!(f, "cache-first"),
      StrategyKind::NetworkFirst => write!(f, "network-first"),
      StrategyKind::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
    }
  }
}

/// Caching policy for one resource class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStrategy {
  pub name: &'static str,
  /// Zero means "always revalidate"
  pub max_age: Duration,
  pub max_entries: usize,
  pub kind: StrategyKind,
  pub background_sync: bool,
}

impl CacheStrategy {
  /// Versioned partition name, e.g. `api-cache-v2`.
  pub fn partition(&self) -> String {
    format!("{}-cache-{}", self.name, CACHE_VERSION)
  }

  /// Whether an entry of the given age must be revalidated.
  pub fn is_expired(&self, age: Duration) -> bool {
    self.max_age.is_zero() || age > self.max_age
  }
}

/// Built-in strategies, fixed at startup.
pub const DEFAULT_STRATEGIES: &[CacheStrategy] = &[
  CacheStrategy {
    name: "api",
    max_age: Duration::from_secs(5 * MINUTE),
    max_entries: 100,
    kind: StrategyKind::NetworkFirst,
    background_sync: true,
  },
  CacheStrategy {
    name: "tracker",
    max_age: Duration::ZERO,
    max_entries: 50,
    kind: StrategyKind::NetworkFirst,
    background_sync: false,
  },
  CacheStrategy {
    name: "images",
    max_age: Duration::from_secs(30 * DAY),
    max_entries: 200,
    kind: StrategyKind::CacheFirst,
    background_sync: false,
  },
  CacheStrategy {
    name: "static",
    max_age: Duration::from_secs(7 * DAY),
    max_entries: 60,
    kind: StrategyKind::StaleWhileRevalidate,
    background_sync: false,
  },
];

/// Lookup table from strategy name to policy.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
  strategies: BTreeMap<&'static str, CacheStrategy>,
}

impl StrategyRegistry {
  /// Build a registry, rejecting zero quotas and duplicate names.
  pub fn new(strategies: impl IntoIterator<Item = CacheStrategy>) -> Result<Self> {
    let mut map = BTreeMap::new();
    for strategy in strategies {
      if strategy.max_entries == 0 {
        return Err(eyre!(
          "Strategy {} must allow at least one entry",
          strategy.name
        ));
      }
      if map.insert(strategy.name, strategy.clone()).is_some() {
        return Err(eyre!("Duplicate cache strategy: {}", strategy.name));
      }
    }
    Ok(Self { strategies: map })
  }

  /// Look up a strategy. Unknown names return `None`; callers must treat
  /// that as "do not cache".
  pub fn lookup(&self, name: &str) -> Option<&CacheStrategy> {
    self.strategies.get(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = &CacheStrategy> {
    self.strategies.values()
  }
}

impl Default for StrategyRegistry {
  fn default() -> Self {
    Self {
      strategies: DEFAULT_STRATEGIES.iter().map(|s| (s.name, s.clone())).collect(),
    }
  }
}
