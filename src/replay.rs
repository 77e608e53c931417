//! Background replay of queued writes.
//!
//! The worker drains the pending write queue on every Offline to Online
//! transition, and re-attempts a drain on a fixed interval while online and
//! writes are still pending (entries held back by retry backoff). The same
//! tick purges expired cache entries.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::Backend;
use crate::gateway::RequestGateway;
use crate::network::ConnectivityState;

struct Running {
  shutdown: watch::Sender<bool>,
  handle: JoinHandle<()>,
}

const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(1);

pub struct ReplayWorker<B> {
  gateway: RequestGateway<B>,
  retry_interval: Duration,
  running: Mutex<Option<Running>>,
}

impl<B: Backend + 'static> ReplayWorker<B> {
  /// `retry_interval` is raised to at least one millisecond.
  pub fn new(gateway: RequestGateway<B>, retry_interval: Duration) -> Self {
    Self {
      gateway,
      retry_interval: retry_interval.max(MIN_RETRY_INTERVAL),
      running: Mutex::new(None),
    }
  }

  pub fn is_running(&self) -> bool {
    self
      .running
      .lock()
      .map(|running| running.is_some())
      .unwrap_or(false)
  }

  /// Spawn the worker task. Returns false if it was already running.
  pub fn start(&self) -> bool {
    let Ok(mut running) = self.running.lock() else {
      return false;
    };
    if running.is_some() {
      return false;
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let transitions = self.gateway.monitor().subscribe();
    let handle = tokio::spawn(run(
      self.gateway.clone(),
      transitions,
      self.retry_interval,
      shutdown_rx,
    ));
    *running = Some(Running { shutdown, handle });

    tracing::debug!(retry_interval = ?self.retry_interval, "replay worker started");
    true
  }

  /// Stop the worker, letting an in-progress drain pass finish first.
  /// Returns false if it was not running.
  pub async fn stop(&self) -> bool {
    let running = match self.running.lock() {
      Ok(mut running) => running.take(),
      Err(_) => None,
    };
    let Some(Running { shutdown, handle }) = running else {
      return false;
    };

    let _ = shutdown.send(true);
    if let Err(e) = handle.await {
      tracing::error!(error = %e, "replay worker ended abnormally");
    }
    tracing::debug!("replay worker stopped");
    true
  }
}

async fn run<B: Backend + 'static>(
  gateway: RequestGateway<B>,
  mut transitions: broadcast::Receiver<ConnectivityState>,
  retry_interval: Duration,
  mut shutdown: watch::Receiver<bool>,
) {
  let mut retry = tokio::time::interval(retry_interval);
  retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

  // Writes left over from an earlier run
  if gateway.monitor().is_online() {
    drain_once(&gateway).await;
  }

  loop {
    tokio::select! {
      _ = shutdown.changed() => break,
      event = transitions.recv() => match event {
        Ok(ConnectivityState::Online) => {
          tracing::info!("back online, draining queued writes");
          drain_once(&gateway).await;
        }
        Ok(ConnectivityState::Offline) => {}
        Err(RecvError::Lagged(skipped)) => {
          tracing::debug!(skipped, "missed connectivity events");
          if gateway.monitor().is_online() {
            drain_once(&gateway).await;
          }
        }
        Err(RecvError::Closed) => break,
      },
      _ = retry.tick() => {
        purge_expired(&gateway);
        if gateway.monitor().is_online() && has_pending(&gateway) {
          drain_once(&gateway).await;
        }
      }
    }
  }
}

fn has_pending<B: Backend>(gateway: &RequestGateway<B>) -> bool {
  match gateway.queue().is_empty() {
    Ok(empty) => !empty,
    Err(e) => {
      tracing::error!(error = %e, "failed to read pending write queue");
      false
    }
  }
}

fn purge_expired<B: Backend>(gateway: &RequestGateway<B>) {
  match gateway.cache().purge_expired() {
    Ok(0) => {}
    Ok(purged) => tracing::debug!(purged, "purged expired cache entries"),
    Err(e) => tracing::warn!(error = %e, "failed to purge expired cache entries"),
  }
}

async fn drain_once<B: Backend>(gateway: &RequestGateway<B>) {
  match gateway.drain_now().await {
    Ok(Some(_)) => {}
    Ok(None) => tracing::debug!("drain skipped, another is running"),
    Err(e) => tracing::error!(error = %e, "drain failed"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::mock::MockBackend;
  use crate::backend::{ApiRequest, ApiResponse, TransportResult};
  use crate::cache::{CachedResponse, NoopStorage, RequestFingerprint, ResponseCache, SqliteStorage};
  use crate::clock::ManualClock;
  use crate::db::Database;
  use crate::metrics::UsageMeter;
  use crate::network::{BackendProbe, NetworkMonitor};
  use crate::queue::{PendingWriteQueue, RetryPolicy};
  use futures::future::BoxFuture;
  use reqwest::Method;
  use std::sync::Arc;
  use tokio::sync::oneshot;

  fn gateway_with_cache<B: Backend + 'static>(
    backend: Arc<B>,
    policy: RetryPolicy,
    db: Arc<Database>,
    cache: ResponseCache,
  ) -> RequestGateway<Arc<B>> {
    let monitor = NetworkMonitor::new(
      Arc::new(BackendProbe::new(backend.clone(), "https://api.test/")),
      Duration::from_secs(3600),
      Duration::from_secs(1),
    );
    let queue = Arc::new(PendingWriteQueue::new(db).with_policy(policy));
    RequestGateway::new(backend, monitor, cache, queue, Arc::new(UsageMeter::new()))
  }

  fn gateway<B: Backend + 'static>(backend: Arc<B>, policy: RetryPolicy) -> RequestGateway<Arc<B>> {
    gateway_with_cache(
      backend,
      policy,
      Arc::new(Database::open_in_memory().unwrap()),
      ResponseCache::new(Arc::new(NoopStorage)),
    )
  }

  /// Accepts every write, but holds the first one until released.
  struct GatedBackend {
    entered: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    release: std::sync::Mutex<Option<oneshot::Receiver<()>>>,
  }

  impl Backend for GatedBackend {
    fn send(&self, _request: ApiRequest) -> BoxFuture<'_, TransportResult<ApiResponse>> {
      Box::pin(async move {
        let entered = self.entered.lock().unwrap().take();
        if let Some(entered) = entered {
          let _ = entered.send(());
        }
        let release = self.release.lock().unwrap().take();
        if let Some(release) = release {
          let _ = release.await;
        }
        Ok(ApiResponse::json(201, "{}"))
      })
    }
  }

  async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
      if done() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
  }

  async fn queue_posts<B: Backend>(gateway: &RequestGateway<B>, n: usize) {
    for i in 0..n {
      let request = ApiRequest::post("https://api.test/items").with_body(format!("{{\"n\":{}}}", i));
      assert!(gateway.send(request).await.unwrap().is_queued());
    }
  }

  #[tokio::test]
  async fn test_drains_on_reconnect() {
    let backend = Arc::new(MockBackend::new());
    backend.always(Method::POST, "https://api.test/items", Ok(ApiResponse::json(201, "{}")));
    let gateway = gateway(backend.clone(), RetryPolicy::default());
    queue_posts(&gateway, 2).await;

    let worker = ReplayWorker::new(gateway.clone(), Duration::from_secs(3600));
    worker.start();
    gateway.monitor().report(ConnectivityState::Online);

    wait_until(|| gateway.queue().is_empty().unwrap()).await;
    assert_eq!(backend.call_count(), 2);
    worker.stop().await;
  }

  #[tokio::test]
  async fn test_rapid_flaps_replay_each_write_once() {
    let backend = Arc::new(MockBackend::new());
    backend.always(Method::POST, "https://api.test/items", Ok(ApiResponse::json(201, "{}")));
    let gateway = gateway(backend.clone(), RetryPolicy::default());
    queue_posts(&gateway, 3).await;

    let worker = ReplayWorker::new(gateway.clone(), Duration::from_secs(3600));
    worker.start();
    let monitor = gateway.monitor();
    monitor.report(ConnectivityState::Online);
    monitor.report(ConnectivityState::Offline);
    monitor.report(ConnectivityState::Online);

    wait_until(|| gateway.queue().is_empty().unwrap()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bodies: Vec<_> = backend.calls().into_iter().filter_map(|c| c.body).collect();
    assert_eq!(
      bodies,
      vec![b"{\"n\":0}".to_vec(), b"{\"n\":1}".to_vec(), b"{\"n\":2}".to_vec()]
    );
    worker.stop().await;
  }

  #[tokio::test]
  async fn test_retries_after_backoff_while_online() {
    let backend = Arc::new(MockBackend::new());
    backend.script(Method::POST, "https://api.test/items", Ok(ApiResponse::json(503, "")));
    backend.always(Method::POST, "https://api.test/items", Ok(ApiResponse::json(201, "{}")));
    let policy = RetryPolicy {
      max_attempts: 5,
      initial_backoff: chrono::Duration::milliseconds(10),
      max_backoff: chrono::Duration::milliseconds(10),
    };
    let gateway = gateway(backend.clone(), policy);
    queue_posts(&gateway, 1).await;

    let worker = ReplayWorker::new(gateway.clone(), Duration::from_millis(20));
    worker.start();
    gateway.monitor().report(ConnectivityState::Online);

    wait_until(|| gateway.queue().is_empty().unwrap()).await;
    assert_eq!(backend.call_count(), 2);
    assert_eq!(gateway.meter().snapshot().replay_failed, 1);
    assert_eq!(gateway.meter().snapshot().replayed, 1);
    worker.stop().await;
  }

  #[tokio::test]
  async fn test_start_and_stop_are_idempotent() {
    let backend = Arc::new(MockBackend::new());
    let worker = ReplayWorker::new(gateway(backend, RetryPolicy::default()), Duration::from_secs(1));

    assert!(worker.start());
    assert!(!worker.start());
    assert!(worker.is_running());

    assert!(worker.stop().await);
    assert!(!worker.stop().await);
    assert!(!worker.is_running());
  }

  #[tokio::test]
  async fn test_stop_waits_for_running_replay() {
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let backend = Arc::new(GatedBackend {
      entered: std::sync::Mutex::new(Some(entered_tx)),
      release: std::sync::Mutex::new(Some(release_rx)),
    });
    let gateway = gateway(backend, RetryPolicy::default());
    queue_posts(&gateway, 1).await;

    let worker = Arc::new(ReplayWorker::new(gateway.clone(), Duration::from_secs(3600)));
    worker.start();
    gateway.monitor().report(ConnectivityState::Online);
    entered_rx.await.unwrap();

    let stopping = {
      let worker = worker.clone();
      tokio::spawn(async move { worker.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());
    assert_eq!(gateway.queue().len().unwrap(), 1);

    release_tx.send(()).unwrap();
    assert!(stopping.await.unwrap());
    assert!(gateway.queue().is_empty().unwrap());
    assert_eq!(gateway.meter().snapshot().replayed, 1);
  }

  #[tokio::test]
  async fn test_zero_retry_interval_is_clamped() {
    let backend = Arc::new(MockBackend::new());
    let worker = ReplayWorker::new(gateway(backend, RetryPolicy::default()), Duration::ZERO);
    assert_eq!(worker.retry_interval, MIN_RETRY_INTERVAL);

    assert!(worker.start());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(worker.is_running());
    assert!(worker.stop().await);
  }

  #[tokio::test]
  async fn test_retry_tick_purges_expired_cache_entries() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::default());
    let cache = ResponseCache::new(Arc::new(SqliteStorage::new(db.clone()))).with_clock(clock.clone());
    let fresh = RequestFingerprint::new(&Method::GET, "https://api.test/items/1");
    let stale = RequestFingerprint::new(&Method::GET, "https://api.test/items/2");
    let value = CachedResponse {
      body: b"{}".to_vec(),
      media_type: None,
    };
    cache.insert(&stale, &value, Some(chrono::Duration::seconds(1))).unwrap();
    cache.insert(&fresh, &value, Some(chrono::Duration::hours(1))).unwrap();
    clock.advance(chrono::Duration::seconds(2));

    let backend = Arc::new(MockBackend::new());
    let gateway = gateway_with_cache(backend, RetryPolicy::default(), db, cache.clone());
    let worker = ReplayWorker::new(gateway, Duration::from_millis(20));
    worker.start();

    wait_until(|| cache.len().unwrap() == 1).await;
    assert!(cache.get::<_, CachedResponse>(&fresh).unwrap().is_some());
    worker.stop().await;
  }
}
