use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use offline_gateway::backend::{ApiRequest, HttpBackend};
use offline_gateway::cache::{CacheStorage, NoopStorage, ResponseCache, SqliteStorage};
use offline_gateway::db::Database;
use offline_gateway::gateway::{GatewayOptions, GatewayResponse, RequestGateway, ResponseOrigin};
use offline_gateway::metrics::UsageMeter;
use offline_gateway::network::{BackendProbe, NetworkMonitor};
use offline_gateway::queue::{DrainHalt, DrainReport, PendingWriteQueue, QueuedRequest};
use offline_gateway::replay::ReplayWorker;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "ogw")]
#[command(about = "Offline-resilient request gateway with durable write replay")]
#[command(version)]
pub struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ogw/config.yaml)
  #[arg(short, long, global = true)]
  pub config: Option<PathBuf>,

  /// Backend base URL; relative request URLs are joined to it
  #[arg(long, global = true)]
  pub base_url: Option<String>,

  /// Treat the backend as unreachable without probing
  #[arg(long, global = true)]
  pub offline: bool,

  /// Debug logging
  #[arg(short, long, global = true)]
  pub verbose: bool,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Send a request through the gateway
  Request {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE, ...)
    method: String,
    /// Absolute URL, or a path relative to the base URL
    url: String,
    /// Request header, e.g. -H 'Content-Type: application/json'
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body; @path reads it from a file
    #[arg(short = 'd', long = "data")]
    data: Option<String>,
  },
  /// Show connectivity and queue state
  Status,
  /// Replay queued writes once
  Drain,
  /// Monitor connectivity and replay queued writes until interrupted
  Watch,
  /// Inspect and manage the pending write queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Manage the response cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
pub enum QueueAction {
  /// List pending writes in replay order
  List,
  /// List dead-lettered writes
  Dead,
  /// Move a dead letter back to the end of the queue
  Requeue { id: i64 },
  /// Delete a dead letter
  Discard { id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
  /// Delete expired entries
  Purge,
  /// Delete every entry
  Clear,
}

/// Wired-up gateway for one CLI invocation.
pub struct App {
  gateway: RequestGateway<HttpBackend>,
  retry_interval: Duration,
}

impl App {
  pub fn build(config: &Config, db_path: &Path, offline: bool) -> Result<Self> {
    let db = Arc::new(Database::open(db_path)?);
    let backend = HttpBackend::new(config.request_timeout())?;

    let monitor = if offline {
      NetworkMonitor::forced_offline()
    } else {
      let probe_url = config
        .probe_url()
        .ok_or_else(|| eyre!("No backend configured. Set backend.base_url or pass --base-url."))?;
      NetworkMonitor::new(
        Arc::new(BackendProbe::new(backend.clone(), probe_url)),
        config.probe_interval(),
        config.probe_timeout(),
      )
    };

    let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
      Arc::new(SqliteStorage::new(db.clone()))
    } else {
      tracing::info!("response cache disabled");
      Arc::new(NoopStorage)
    };
    let cache = ResponseCache::new(storage).with_default_ttl(config.cache_ttl());
    let queue = Arc::new(PendingWriteQueue::new(db).with_policy(config.retry_policy()));

    let gateway = RequestGateway::new(backend, monitor, cache, queue, Arc::new(UsageMeter::new()))
      .with_options(GatewayOptions {
        base_url: config.base_url()?,
        invalidate_on_write: config.cache.invalidate_on_write,
      });

    Ok(Self {
      gateway,
      retry_interval: config.retry_interval(),
    })
  }

  pub async fn run(self, command: Command) -> Result<()> {
    match command {
      Command::Request {
        method,
        url,
        headers,
        data,
      } => self.request(&method, &url, &headers, data.as_deref()).await,
      Command::Status => self.status().await,
      Command::Drain => self.drain().await,
      Command::Watch => self.watch().await,
      Command::Queue { action } => self.queue(action),
      Command::Cache { action } => self.cache(action),
    }
  }

  async fn request(&self, method: &str, url: &str, headers: &[String], data: Option<&str>) -> Result<()> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
      .map_err(|_| eyre!("Invalid HTTP method: {}", method))?;

    let mut request = ApiRequest::new(method, url);
    for header in headers {
      let (name, value) = header
        .split_once(':')
        .ok_or_else(|| eyre!("Invalid header {:?}, expected 'Name: value'", header))?;
      request = request.with_header(name.trim(), value.trim());
    }
    if let Some(data) = data {
      request = request.with_body(read_body(data)?);
    }

    self.gateway.monitor().check_now().await;
    let response = self.gateway.send(request).await?;
    print_response(&response);
    Ok(())
  }

  async fn status(&self) -> Result<()> {
    let state = self.gateway.monitor().check_now().await;
    let queue = self.gateway.queue();

    println!("connectivity: {}", state);
    println!("pending:      {}", queue.len()?);
    println!("dead letters: {}", queue.dead_letter_count()?);
    println!("cached reads: {}", self.gateway.cache().len()?);
    Ok(())
  }

  async fn drain(&self) -> Result<()> {
    let state = self.gateway.monitor().check_now().await;
    if !state.is_online() {
      return Err(eyre!("Backend unreachable; {} writes still pending", self.gateway.queue().len()?));
    }

    match self.gateway.drain_now().await? {
      Some(report) => print_report(&report),
      None => println!("A drain is already running"),
    }
    Ok(())
  }

  async fn watch(&self) -> Result<()> {
    let monitor = self.gateway.monitor();
    monitor.initialize().await;

    let worker = ReplayWorker::new(self.gateway.clone(), self.retry_interval);
    worker.start();
    tracing::info!(state = %monitor.state(), "watching; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    worker.stop().await;
    monitor.shutdown();

    let usage = self.gateway.meter().snapshot();
    println!("{}", serde_json::to_string_pretty(&usage)?);
    Ok(())
  }

  fn queue(&self, action: QueueAction) -> Result<()> {
    let queue = self.gateway.queue();
    match action {
      QueueAction::List => queue.pending()?.iter().for_each(print_entry),
      QueueAction::Dead => queue.dead_letters()?.iter().for_each(print_entry),
      QueueAction::Requeue { id } => {
        let entry = queue.requeue(id)?;
        println!("Requeued #{} as #{}", id, entry.id);
      }
      QueueAction::Discard { id } => {
        queue.discard(id)?;
        println!("Discarded #{}", id);
      }
    }
    Ok(())
  }

  fn cache(&self, action: CacheAction) -> Result<()> {
    let cache = self.gateway.cache();
    match action {
      CacheAction::Purge => println!("Purged {} expired entries", cache.purge_expired()?),
      CacheAction::Clear => println!("Removed {} entries", cache.clear()?),
    }
    Ok(())
  }
}

fn read_body(data: &str) -> Result<Vec<u8>> {
  match data.strip_prefix('@') {
    Some(path) => std::fs::read(path).map_err(|e| eyre!("Failed to read body from {}: {}", path, e)),
    None => Ok(data.as_bytes().to_vec()),
  }
}

fn print_response(response: &GatewayResponse) {
  let origin = match response.origin {
    ResponseOrigin::Queued { id } => format!("queued as #{}", id),
    origin => origin.as_str().to_string(),
  };
  println!("{} ({})", response.status, origin);
  if let Some(media_type) = &response.media_type {
    println!("Content-Type: {}", media_type);
  }
  println!();
  println!("{}", response.text());
}

fn print_report(report: &DrainReport) {
  println!(
    "delivered {}, dead-lettered {}, {} remaining",
    report.delivered, report.dead_lettered, report.remaining
  );
  match &report.halted {
    Some(DrainHalt::TransientFailure { id, error }) => println!("halted at #{}: {}", id, error),
    Some(DrainHalt::BackingOff { id, until }) => {
      println!("halted at #{}: retry not before {}", id, until.to_rfc3339())
    }
    None => {}
  }
}

fn print_entry(entry: &QueuedRequest) {
  let mut line = format!(
    "#{:<5} {:<7} {} attempts={} enqueued={}",
    entry.id,
    entry.method,
    entry.url,
    entry.attempts,
    entry.enqueued_at.to_rfc3339()
  );
  if let Some(error) = &entry.last_error {
    line.push_str(&format!(" last_error={:?}", error));
  }
  println!("{}", line);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_request_command() {
    let args = Args::parse_from([
      "ogw",
      "--offline",
      "request",
      "post",
      "/items",
      "-H",
      "Content-Type: application/json",
      "-d",
      r#"{"name":"x"}"#,
    ]);

    assert!(args.offline);
    match args.command {
      Command::Request {
        method,
        url,
        headers,
        data,
      } => {
        assert_eq!(method, "post");
        assert_eq!(url, "/items");
        assert_eq!(headers, vec!["Content-Type: application/json".to_string()]);
        assert_eq!(data.as_deref(), Some(r#"{"name":"x"}"#));
      }
      other => panic!("unexpected command {:?}", other),
    }
  }

  #[test]
  fn test_parse_queue_requeue() {
    let args = Args::parse_from(["ogw", "queue", "requeue", "42", "-v"]);
    assert!(args.verbose);
    assert!(matches!(
      args.command,
      Command::Queue {
        action: QueueAction::Requeue { id: 42 }
      }
    ));
  }

  #[test]
  fn test_disabled_cache_stores_nothing() {
    use offline_gateway::cache::{CachedResponse, RequestFingerprint};

    let dir = tempfile::tempdir().unwrap();
    let config = Config::parse("cache:\n  enabled: false\n").unwrap();
    let app = App::build(&config, &dir.path().join("gateway.db"), true).unwrap();

    let cache = app.gateway.cache();
    let key = RequestFingerprint::new(&Method::GET, "https://api.test/items/1");
    let value = CachedResponse {
      body: b"{}".to_vec(),
      media_type: None,
    };
    cache.insert(&key, &value, None).unwrap();
    assert!(cache.get::<_, CachedResponse>(&key).unwrap().is_none());
    assert_eq!(cache.len().unwrap(), 0);
  }

  #[test]
  fn test_read_body_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("body.json");
    std::fs::write(&path, b"{\"a\":1}").unwrap();

    let body = read_body(&format!("@{}", path.display())).unwrap();
    assert_eq!(body, b"{\"a\":1}");
    assert_eq!(read_body("plain").unwrap(), b"plain");
  }
}
