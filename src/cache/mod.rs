//! Offline cache: strategy registry, partitioned storage and the manager
//! that applies cache-first, network-first and stale-while-revalidate.
//!
//! - Each resource class has a `CacheStrategy` with its own versioned partition
//! - Partitions are bounded by entry count with FIFO eviction
//! - Unknown strategy names are served from the network and never cached
//! - Storage failures are logged and never fail a request

mod manager;
mod storage;
mod strategy;
mod traits;

pub use manager::{enforce_max_entries, CacheManager};
pub use storage::{CacheStorage, SqliteStorage, StoredEntry};
pub use strategy::{
  CacheStrategy, StrategyKind, StrategyRegistry, CACHE_VERSION, DEFAULT_STRATEGIES,
};
pub use traits::{CacheResult, CacheSource, Clock, Revalidation, SystemClock};
