//! Network seam used by the cache manager, the sync queue and the app shell.

mod http;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpFetcher;

/// A request issued through a [`Fetcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
  pub method: String,
  pub url: String,
  pub body: Option<String>,
}

impl FetchRequest {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
      body: None,
    }
  }

  pub fn head(url: impl Into<String>) -> Self {
    Self {
      method: "HEAD".to_string(),
      url: url.into(),
      body: None,
    }
  }

  pub fn new(method: impl Into<String>, url: impl Into<String>, body: Option<String>) -> Self {
    Self {
      method: method.into().to_uppercase(),
      url: url.into(),
      body,
    }
  }
}

/// A response as returned by the network and as stored in a cache partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Response {
  #[cfg(test)]
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      content_type: None,
      body: body.into(),
    }
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Failures surfaced to callers when no cached fallback exists.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("fetch failed for {url}: {reason}")]
  FetchFailed { url: String, reason: String },

  #[error("fetch timed out after {timeout_ms}ms for {url}")]
  Timeout { url: String, timeout_ms: u128 },
}

impl FetchError {
  pub fn failed(url: &str, reason: impl Into<String>) -> Self {
    FetchError::FetchFailed {
      url: url.to_string(),
      reason: reason.into(),
    }
  }
}

/// Anything that can perform a network round trip.
///
/// The returned future is `'static` so implementations can be moved into
/// spawned background tasks (stale-while-revalidate refreshes).
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, color_eyre::Result<Response>>;
}
