//! App shell warm-up: preconnect origins, preload critical routes through
//! the strategy of their resource class and record how long each took.

use color_eyre::{eyre::eyre, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheManager, CacheSource, CacheStorage};
use crate::config::ShellConfig;
use crate::net::{FetchRequest, Fetcher};
use crate::routes;

/// Timing of one preloaded route.
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationTiming {
  pub url: String,
  pub elapsed: Duration,
  /// `None` when the preload failed
  pub source: Option<CacheSource>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShellReport {
  pub preconnected: Vec<String>,
  pub failed_preconnects: Vec<String>,
  pub timings: Vec<NavigationTiming>,
}

impl ShellReport {
  pub fn preloaded(&self) -> usize {
    self.timings.iter().filter(|t| t.source.is_some()).count()
  }

  pub fn slowest(&self) -> Option<&NavigationTiming> {
    self.timings.iter().max_by_key(|t| t.elapsed)
  }
}

pub struct ShellBootstrapper<'a, S: CacheStorage, F: Fetcher> {
  cache: &'a CacheManager<S, F>,
  base_url: Url,
  config: ShellConfig,
}

impl<'a, S: CacheStorage, F: Fetcher> ShellBootstrapper<'a, S, F> {
  pub fn new(cache: &'a CacheManager<S, F>, base_url: &str, config: ShellConfig) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    Ok(Self {
      cache,
      base_url,
      config,
    })
  }

  /// Preconnect, then preload every critical route. Individual failures are
  /// recorded in the report, never returned as errors.
  pub async fn warm_up(&self) -> ShellReport {
    let mut report = ShellReport::default();

    for origin in self.origins() {
      if self.preconnect(&origin).await {
        report.preconnected.push(origin);
      } else {
        report.failed_preconnects.push(origin);
      }
    }

    for route in &self.config.critical_routes {
      report.timings.push(self.preload(route).await);
    }

    info!(
      preloaded = report.preloaded(),
      routes = report.timings.len(),
      preconnected = report.preconnected.len(),
      "app shell warm-up finished"
    );
    report
  }

  /// Configured origins plus the API origin, deduplicated.
  fn origins(&self) -> Vec<String> {
    let mut origins: Vec<String> = Vec::new();
    let candidates = std::iter::once(self.base_url.as_str()).chain(
      self
        .config
        .preconnect_origins
        .iter()
        .map(String::as_str),
    );

    for candidate in candidates {
      match Url::parse(candidate) {
        Ok(url) => {
          let origin = url.origin().ascii_serialization();
          if !origins.contains(&origin) {
            origins.push(origin);
          }
        }
        Err(e) => warn!(origin = candidate, error = %e, "skipping invalid preconnect origin"),
      }
    }

    origins
  }

  async fn preconnect(&self, origin: &str) -> bool {
    let request = self.cache.fetcher().fetch(FetchRequest::head(origin));
    match tokio::time::timeout(self.cache.network_timeout(), request).await {
      Ok(Ok(_)) => {
        debug!(origin, "preconnected");
        true
      }
      Ok(Err(e)) => {
        warn!(origin, error = %e, "preconnect failed");
        false
      }
      Err(_) => {
        warn!(origin, "preconnect timed out");
        false
      }
    }
  }

  async fn preload(&self, route: &str) -> NavigationTiming {
    let url = match self.base_url.join(route) {
      Ok(url) => String::from(url),
      Err(e) => {
        warn!(route, error = %e, "skipping invalid route");
        return NavigationTiming {
          url: route.to_string(),
          elapsed: Duration::ZERO,
          source: None,
        };
      }
    };

    // Navigations have no in-app class: warm the connection, store nothing
    let started = Instant::now();
    let fetched = match routes::classify(&url) {
      Some(class) => self.cache.fetch(&url, class).await,
      None => self.cache.fetch_uncached(&url).await,
    };
    let source = match fetched {
      Ok(result) => Some(result.source),
      Err(e) => {
        warn!(url = %url, error = %e, "preload failed");
        None
      }
    };
    let elapsed = started.elapsed();

    debug!(url = %url, elapsed_ms = elapsed.as_millis() as u64, "preloaded route");
    NavigationTiming {
      url,
      elapsed,
      source,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{SqliteStorage, StrategyRegistry};
  use crate::testing::FakeFetcher;
  use std::sync::Arc;

  fn manager(fetcher: &Arc<FakeFetcher>) -> CacheManager<SqliteStorage, FakeFetcher> {
    CacheManager::new(
      Arc::new(SqliteStorage::in_memory().unwrap()),
      Arc::clone(fetcher),
      Arc::new(StrategyRegistry::default()),
    )
  }

  #[tokio::test]
  async fn test_warm_up_preloads_routes() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond("https://fest.example", 200, "");
    fetcher.respond("https://fest.example/", 200, "<html>");
    fetcher.respond("https://fest.example/assets/app.js", 200, "js");
    let cache = manager(&fetcher);

    let config = ShellConfig {
      critical_routes: vec!["/".into(), "/assets/app.js".into()],
      preconnect_origins: vec![],
    };
    let report = ShellBootstrapper::new(&cache, "https://fest.example", config)
      .unwrap()
      .warm_up()
      .await;

    assert_eq!(report.preloaded(), 2);
    assert_eq!(report.preconnected, vec!["https://fest.example"]);
    assert!(report.slowest().is_some());
    assert_eq!(report.timings[0].source, Some(CacheSource::Network));
    assert_eq!(
      cache.storage().keys("static-cache-v2").unwrap(),
      vec!["https://fest.example/assets/app.js"]
    );
  }

  #[tokio::test]
  async fn test_navigations_are_warmed_but_not_stored() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond("https://fest.example/", 200, "<html>");
    fetcher.respond("https://fest.example/gallery/map.png", 200, "png");
    let cache = manager(&fetcher);

    let config = ShellConfig {
      critical_routes: vec!["/".into(), "/gallery/map.png".into()],
      preconnect_origins: vec![],
    };
    let report = ShellBootstrapper::new(&cache, "https://fest.example", config)
      .unwrap()
      .warm_up()
      .await;

    assert_eq!(report.preloaded(), 2);
    assert_eq!(fetcher.calls("https://fest.example/"), 1);
    for partition in cache.storage().partitions().unwrap() {
      let keys = cache.storage().keys(&partition).unwrap();
      assert!(!keys.contains(&"https://fest.example/".to_string()), "{}", partition);
    }
    assert_eq!(cache.storage().entry_count("images-cache-v2").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_failures_are_reported_not_returned() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond("https://fest.example/assets/app.css", 200, "css");
    let cache = manager(&fetcher);

    let config = ShellConfig {
      critical_routes: vec!["/assets/app.css".into(), "/assets/missing.js".into()],
      preconnect_origins: vec!["https://tiles.example/x/y".into(), "::bad::".into()],
    };
    let report = ShellBootstrapper::new(&cache, "https://fest.example", config)
      .unwrap()
      .warm_up()
      .await;

    assert_eq!(report.preloaded(), 1);
    assert!(report.timings[1].source.is_none());
    assert_eq!(
      report.failed_preconnects,
      vec!["https://fest.example", "https://tiles.example"]
    );
  }

  #[tokio::test]
  async fn test_origins_are_deduplicated() {
    let fetcher = Arc::new(FakeFetcher::new());
    let cache = manager(&fetcher);
    let config = ShellConfig {
      critical_routes: vec![],
      preconnect_origins: vec!["https://fest.example/api".into()],
    };

    let shell = ShellBootstrapper::new(&cache, "https://fest.example", config).unwrap();
    assert_eq!(shell.origins(), vec!["https://fest.example"]);
  }
}
