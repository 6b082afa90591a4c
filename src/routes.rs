//! Route rules shared with the service worker, and URL classification.

use crate::cache::StrategyKind;

#[derive(Debug, Clone)]
pub struct RouteRule {
  /// Resource class / strategy name
  pub class: &'static str,
  /// What the service worker does for this class
  pub service_worker_kind: StrategyKind,
  pub description: &'static str,
}

/// Service-worker routing table. The in-app strategies must agree with it.
pub const SERVICE_WORKER_RULES: &[RouteRule] = &[
  RouteRule {
    class: "api",
    service_worker_kind: StrategyKind::NetworkFirst,
    description: "REST API responses",
  },
  RouteRule {
    class: "tracker",
    service_worker_kind: StrategyKind::NetworkFirst,
    description: "Live procession positions",
  },
  RouteRule {
    class: "images",
    service_worker_kind: StrategyKind::CacheFirst,
    description: "Images and fonts",
  },
  RouteRule {
    class: "static",
    service_worker_kind: StrategyKind::StaleWhileRevalidate,
    description: "Scripts, styles and manifests",
  },
];

pub fn rule_for(class: &str) -> Option<&'static RouteRule> {
  SERVICE_WORKER_RULES.iter().find(|r| r.class == class)
}

const IMAGE_EXTENSIONS: &[&str] = &[
  "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "woff", "woff2", "ttf", "otf",
];

const STATIC_EXTENSIONS: &[&str] = &["js", "mjs", "css", "json", "webmanifest"];

/// Resource class for a URL, or `None` for requests that are not cached
/// in-app (HTML navigations and anything unrecognized).
///
/// Accepts absolute URLs or bare paths.
pub fn classify(url: &str) -> Option<&'static str> {
  let path = path_of(url).to_lowercase();

  if path.starts_with("/api/tracker") {
    return Some("tracker");
  }
  if path.starts_with("/api/") {
    return Some("api");
  }

  let extension = path.rsplit('/').next()?.rsplit_once('.')?.1;
  if IMAGE_EXTENSIONS.contains(&extension) {
    return Some("images");
  }
  if STATIC_EXTENSIONS.contains(&extension) {
    return Some("static");
  }

  None
}

/// Path component without query or fragment.
fn path_of(url: &str) -> String {
  match url::Url::parse(url) {
    Ok(parsed) => parsed.path().to_string(),
    Err(_) => url
      .split(['?', '#'])
      .next()
      .unwrap_or_default()
      .to_string(),
  }
}
