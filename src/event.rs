use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::net::{FetchRequest, Fetcher};

/// Reachability of the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Daemon events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Periodic tick for housekeeping
  Tick,
  /// Connectivity changed (the first probe always reports)
  Connectivity(Connectivity),
}

/// Event handler that probes the API health endpoint on a tick timer
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new<F: Fetcher>(
    tick_rate: Duration,
    fetcher: Arc<F>,
    health_url: String,
    probe_timeout: Duration,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      let mut last: Option<Connectivity> = None;

      loop {
        interval.tick().await;

        let state = probe(fetcher.as_ref(), &health_url, probe_timeout).await;
        if last != Some(state) {
          debug!(?state, "connectivity changed");
          last = Some(state);
          if tx.send(Event::Connectivity(state)).is_err() {
            break;
          }
        }

        if tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

/// Any answer from the server counts as online.
async fn probe<F: Fetcher>(fetcher: &F, url: &str, timeout: Duration) -> Connectivity {
  match tokio::time::timeout(timeout, fetcher.fetch(FetchRequest::get(url))).await {
    Ok(Ok(_)) => Connectivity::Online,
    _ => Connectivity::Offline,
  }
}
