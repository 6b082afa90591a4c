mod app;
mod cache;
mod client;
mod config;
mod event;
mod net;
mod quota;
mod routes;
mod shell;
mod sync;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cache::{CacheManager, SqliteStorage, StrategyRegistry, DEFAULT_STRATEGIES};
use client::{OfflineClient, Submission};
use net::HttpFetcher;
use quota::{BudgetEstimator, QuotaMonitor};
use shell::ShellBootstrapper;
use sync::{Backoff, SyncQueue};

#[derive(Parser, Debug)]
#[command(name = "festcache")]
#[command(about = "Offline cache and background sync for the festival app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/festcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a resource through the cache
  Get {
    /// Path relative to the API base URL, or an absolute URL
    path: String,
    /// Strategy name (default: derived from the URL)
    #[arg(short, long)]
    strategy: Option<String>,
  },
  /// Send a mutating request, queueing it if the network is down
  Send {
    path: String,
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Replay the background sync queue
  Sync,
  /// List queued requests
  Queue,
  /// Show storage usage and run emergency cleanup above the threshold
  Quota {
    /// Run emergency cleanup regardless of usage
    #[arg(long)]
    cleanup: bool,
  },
  /// List cache strategies
  Strategies,
  /// Preconnect and preload the app shell
  Warmup,
  /// Watch connectivity, replay the queue and check the quota until Ctrl-C
  Watch,
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("festcache=info"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "festcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_dir.as_deref());

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let storage = Arc::new(SqliteStorage::open(config.database_path.as_deref())?);
  let fetcher = Arc::new(HttpFetcher::new(&config)?);
  let registry = Arc::new(StrategyRegistry::new(DEFAULT_STRATEGIES.iter().cloned())?);

  let cache = CacheManager::new(
    Arc::clone(&storage),
    Arc::clone(&fetcher),
    Arc::clone(&registry),
  )
  .with_network_timeout(config.network_timeout());
  let queue = Arc::new(
    SyncQueue::new(Arc::clone(&storage), Arc::clone(&fetcher))
      .with_backoff(Backoff::from_config(&config.sync))
      .with_network_timeout(config.network_timeout()),
  );
  let client = OfflineClient::new(&config.api_base_url, cache, queue)?;
  let quota = QuotaMonitor::new(
    Arc::clone(&storage),
    BudgetEstimator::new(Arc::clone(&storage), config.quota.budget_bytes),
    Arc::clone(&registry),
    config.quota.clone(),
  );

  match args.command {
    Command::Get { path, strategy } => {
      let result = match strategy {
        Some(name) => client.get_with(&path, &name).await?,
        None => client.get(&path).await?,
      };
      println!(
        "{} {} bytes from {}",
        result.data.status,
        result.data.body.len(),
        result.source
      );
      if result.source.is_cached() {
        if let Some(cached_at) = result.cached_at {
          println!("cached at {}", cached_at.format("%Y-%m-%d %H:%M:%S"));
        }
      }
      if let Some(revalidation) = result.revalidation {
        // Let the refresh land before the runtime shuts down
        revalidation.wait().await?;
      }
    }
    Command::Send { path, method, body } => match client.submit(&method, &path, body).await? {
      Submission::Sent(response) => println!("sent: HTTP {}", response.status),
      Submission::Queued(item) => println!("offline: queued as {}", item.id),
    },
    Command::Sync => {
      let report = client.queue().process_queue().await?;
      println!(
        "replayed {}, failed {}, deferred {}, remaining {}",
        report.replayed, report.failed, report.deferred, report.remaining
      );
    }
    Command::Queue => {
      let items = client.queue().pending().await?;
      if items.is_empty() {
        println!("queue is empty");
      }
      for item in items {
        println!(
          "{}  {:6} {}  queued {}  attempts {}",
          item.id,
          item.method,
          item.url,
          item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          item.attempts
        );
      }
    }
    Command::Quota { cleanup } => {
      let status = quota.check_quota()?;
      let snapshot = status.snapshot;
      println!(
        "used {} bytes, available {} bytes ({:.1}%)",
        snapshot.used_bytes, snapshot.available_bytes, snapshot.percentage_used
      );
      let report = match status.cleanup {
        Some(report) => Some(report),
        None if cleanup => Some(quota.emergency_cleanup()?),
        None => None,
      };
      if let Some(report) = report {
        println!(
          "cleanup: removed partitions {:?}, evicted {} images",
          report.deleted_partitions, report.evicted_images
        );
      }
    }
    Command::Strategies => {
      for strategy in registry.iter() {
        println!(
          "{:8} {:24} partition={:18} max_age={}s max_entries={} background_sync={}",
          strategy.name,
          strategy.kind.to_string(),
          strategy.partition(),
          strategy.max_age.as_secs(),
          strategy.max_entries,
          strategy.background_sync
        );
        match routes::rule_for(strategy.name) {
          Some(rule) if rule.service_worker_kind != strategy.kind => tracing::warn!(
            "Service worker uses {} for {} but the app uses {}",
            rule.service_worker_kind,
            strategy.name,
            strategy.kind
          ),
          Some(rule) => println!("         {}", rule.description),
          None => tracing::warn!("No service worker rule for {}", strategy.name),
        }
      }
    }
    Command::Warmup => {
      let shell =
        ShellBootstrapper::new(client.cache(), &config.api_base_url, config.shell.clone())?;
      let report = shell.warm_up().await;
      for timing in &report.timings {
        let outcome = match timing.source {
          Some(source) => source.to_string(),
          None => "failed".to_string(),
        };
        println!("{:>6}ms  {}  {}", timing.elapsed.as_millis(), timing.url, outcome);
      }
      println!(
        "preconnected {} origins, preloaded {}/{} routes",
        report.preconnected.len(),
        report.preloaded(),
        report.timings.len()
      );
      if let Some(slowest) = report.slowest() {
        println!("slowest: {} ({}ms)", slowest.url, slowest.elapsed.as_millis());
      }
    }
    Command::Watch => {
      let mut app = app::App::new(client, quota, config.monitor.clone());
      app.run().await?;
    }
  }

  Ok(())
}
