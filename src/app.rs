use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cache::CacheStorage;
use crate::client::OfflineClient;
use crate::config::MonitorConfig;
use crate::event::{Connectivity, Event, EventHandler};
use crate::net::Fetcher;
use crate::quota::{QuotaMonitor, UsageEstimator};
use crate::sync::QueueStore;

/// Long-running housekeeping loop: replays the sync queue when the API
/// becomes reachable and checks the storage quota periodically.
pub struct App<S, F, E>
where
  S: CacheStorage + QueueStore,
  F: Fetcher,
  E: UsageEstimator,
{
  client: OfflineClient<S, S, F>,
  quota: QuotaMonitor<S, E>,
  config: MonitorConfig,
  /// Ticks seen so far
  ticks: u64,
  connectivity: Option<Connectivity>,
}

impl<S, F, E> App<S, F, E>
where
  S: CacheStorage + QueueStore,
  F: Fetcher,
  E: UsageEstimator,
{
  pub fn new(client: OfflineClient<S, S, F>, quota: QuotaMonitor<S, E>, config: MonitorConfig) -> Self {
    Self {
      client,
      quota,
      config,
      ticks: 0,
      connectivity: None,
    }
  }

  /// Run until Ctrl-C.
  pub async fn run(&mut self) -> Result<()> {
    let health_url = self.client.resolve(&self.config.health_path)?;
    let mut events = EventHandler::new(
      Duration::from_secs(self.config.tick_secs),
      Arc::clone(self.client.cache().fetcher()),
      health_url,
      self.client.cache().network_timeout(),
    );

    info!(
      tick_secs = self.config.tick_secs,
      "watching connectivity and storage quota"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!("shutting down");
          break;
        }
        event = events.next() => match event {
          Some(event) => self.handle_event(event).await,
          None => break,
        },
      }
    }

    Ok(())
  }

  /// React to one event. Failures are logged; the loop keeps running.
  pub async fn handle_event(&mut self, event: Event) {
    match event {
      Event::Tick => {
        self.ticks += 1;
        if self.config.quota_check_every_ticks > 0
          && self.ticks % self.config.quota_check_every_ticks == 0
        {
          if let Err(e) = self.quota.check_quota() {
            error!(error = %e, "quota check failed");
          }
        }
      }
      Event::Connectivity(Connectivity::Online) => {
        if self.connectivity == Some(Connectivity::Offline) {
          info!("connectivity restored");
        }
        self.connectivity = Some(Connectivity::Online);
        if let Err(e) = self.client.queue().process_queue().await {
          error!(error = %e, "background sync failed");
        }
      }
      Event::Connectivity(Connectivity::Offline) => {
        warn!("API unreachable, serving from cache");
        self.connectivity = Some(Connectivity::Offline);
      }
    }
  }
}
