//! Request gateway: the single entry point for outgoing calls.
//!
//! Callers hand every request to [`RequestGateway::send`] and get a response
//! back whether or not the backend is reachable:
//! - online reads go to the network and refresh the cache
//! - offline reads are served from the cache, or fail with
//!   [`GatewayError::NoCacheAvailable`]
//! - offline writes are appended to the pending write queue and acknowledged
//!   with a synthetic `202 Accepted`
//!
//! Queued writes are replayed in order by [`RequestGateway::drain_now`],
//! which the replay worker calls when connectivity returns.

use reqwest::header::{HeaderName, HeaderValue};
use std::sync::Arc;
use url::Url;

use crate::backend::{ApiRequest, ApiResponse, Backend, DEFAULT_MEDIA_TYPE};
use crate::cache::{CachedResponse, RequestFingerprint, ResponseCache};
use crate::error::GatewayError;
use crate::metrics::{Counter, UsageMeter};
use crate::network::NetworkMonitor;
use crate::queue::{DrainReport, PendingWriteQueue, QueueError, QueuedRequest, ReplayOutcome};

/// Body of the synthetic response returned for a queued write.
pub const QUEUED_BODY: &str = r#"{"queued":true}"#;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOrigin {
  /// Live backend response
  Network,
  /// Served from the response cache
  Cache,
  /// Write accepted into the pending queue, not yet delivered
  Queued { id: i64 },
}

impl ResponseOrigin {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseOrigin::Network => "network",
      ResponseOrigin::Cache => "cache",
      ResponseOrigin::Queued { .. } => "queued",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
  pub status: u16,
  pub media_type: Option<String>,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub origin: ResponseOrigin,
}

impl GatewayResponse {
  fn from_network(response: ApiResponse) -> Self {
    Self {
      status: response.status,
      media_type: response.media_type,
      headers: response.headers,
      body: response.body,
      origin: ResponseOrigin::Network,
    }
  }

  fn from_cache(cached: CachedResponse) -> Self {
    Self {
      status: 200,
      media_type: cached.media_type,
      headers: Vec::new(),
      body: cached.body,
      origin: ResponseOrigin::Cache,
    }
  }

  fn queued(id: i64) -> Self {
    Self {
      status: 202,
      media_type: Some(DEFAULT_MEDIA_TYPE.to_string()),
      headers: Vec::new(),
      body: QUEUED_BODY.as_bytes().to_vec(),
      origin: ResponseOrigin::Queued { id },
    }
  }

  /// True if this is an accepted-but-undelivered write.
  pub fn is_queued(&self) -> bool {
    matches!(self.origin, ResponseOrigin::Queued { .. })
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Gateway behavior switches.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
  /// Relative request URLs are joined to this
  pub base_url: Option<Url>,
  /// Drop cached reads of a resource (and its collection) after a confirmed write
  pub invalidate_on_write: bool,
}

impl Default for GatewayOptions {
  fn default() -> Self {
    Self {
      base_url: None,
      invalidate_on_write: true,
    }
  }
}

/// Routes calls between the backend, the response cache and the write queue.
///
/// Clones share the same collaborators.
pub struct RequestGateway<B> {
  backend: Arc<B>,
  monitor: NetworkMonitor,
  cache: ResponseCache,
  queue: Arc<PendingWriteQueue>,
  meter: Arc<UsageMeter>,
  options: Arc<GatewayOptions>,
}

impl<B> Clone for RequestGateway<B> {
  fn clone(&self) -> Self {
    Self {
      backend: self.backend.clone(),
      monitor: self.monitor.clone(),
      cache: self.cache.clone(),
      queue: self.queue.clone(),
      meter: self.meter.clone(),
      options: self.options.clone(),
    }
  }
}

impl<B: Backend> RequestGateway<B> {
  pub fn new(
    backend: B,
    monitor: NetworkMonitor,
    cache: ResponseCache,
    queue: Arc<PendingWriteQueue>,
    meter: Arc<UsageMeter>,
  ) -> Self {
    Self {
      backend: Arc::new(backend),
      monitor,
      cache,
      queue,
      meter,
      options: Arc::new(GatewayOptions::default()),
    }
  }

  pub fn with_options(mut self, options: GatewayOptions) -> Self {
    self.options = Arc::new(options);
    self
  }

  pub fn monitor(&self) -> &NetworkMonitor {
    &self.monitor
  }

  pub fn cache(&self) -> &ResponseCache {
    &self.cache
  }

  pub fn queue(&self) -> &Arc<PendingWriteQueue> {
    &self.queue
  }

  pub fn meter(&self) -> &Arc<UsageMeter> {
    &self.meter
  }

  /// Issue a call, choosing network, cache or queue by method and connectivity.
  pub async fn send(&self, request: ApiRequest) -> Result<GatewayResponse, GatewayError> {
    let request = self.prepare(request)?;
    let fingerprint = RequestFingerprint::new(&request.method, &request.url);

    if self.monitor.is_online() {
      self.send_online(request, &fingerprint).await
    } else if request.is_read() {
      self.serve_cached(&fingerprint)
    } else {
      self.enqueue(&request)
    }
  }

  /// Cache-first read: a live cached value is returned without touching the
  /// network. Concurrent misses on the same URL share one backend call.
  pub async fn get_cached(&self, url: &str) -> Result<GatewayResponse, GatewayError> {
    let request = self.prepare(ApiRequest::get(url))?;
    let fingerprint = RequestFingerprint::new(&request.method, &request.url);

    if !self.monitor.is_online() {
      return self.serve_cached(&fingerprint);
    }

    let mut fetched: Option<ApiResponse> = None;
    let slot = &mut fetched;
    let backend = &self.backend;
    let monitor = &self.monitor;

    let cached = self
      .cache
      .get_or_add(
        &fingerprint,
        move || async move {
          let response = backend.send(request).await.map_err(|e| {
            monitor.nudge();
            GatewayError::from(e)
          })?;
          let value = response.is_success().then(|| CachedResponse {
            body: response.body.clone(),
            media_type: response.media_type.clone(),
          });
          *slot = Some(response);
          Ok::<_, GatewayError>(value)
        },
        None,
      )
      .await?;

    match (fetched, cached) {
      (Some(response), _) => Ok(GatewayResponse::from_network(response)),
      (None, Some(cached)) => {
        self.meter.increment(Counter::CacheHit);
        tracing::debug!(%fingerprint, "cache hit");
        Ok(GatewayResponse::from_cache(cached))
      }
      // The factory always records what it fetched
      (None, None) => Err(GatewayError::NoCacheAvailable {
        fingerprint: fingerprint.to_string(),
      }),
    }
  }

  /// Replay queued writes against the backend, in order.
  ///
  /// Returns `None` if a drain is already running.
  pub async fn drain_now(&self) -> Result<Option<DrainReport>, QueueError> {
    let report = self.queue.drain(|entry| self.replay(entry)).await?;

    if let Some(report) = &report {
      if report.dead_lettered > 0 {
        self.meter.add(Counter::DeadLettered, report.dead_lettered as u64);
      }
      if report.delivered > 0 || report.dead_lettered > 0 || report.halted.is_some() {
        tracing::info!(
          delivered = report.delivered,
          dead_lettered = report.dead_lettered,
          remaining = report.remaining,
          halted = report.halted.is_some(),
          "drain finished"
        );
      }
    }
    Ok(report)
  }

  async fn send_online(
    &self,
    request: ApiRequest,
    fingerprint: &RequestFingerprint,
  ) -> Result<GatewayResponse, GatewayError> {
    let is_read = request.is_read();

    match self.backend.send(request).await {
      Ok(response) => {
        if response.is_success() {
          if is_read {
            self.store(fingerprint, &response);
          } else {
            self.invalidate(fingerprint);
          }
        }
        Ok(GatewayResponse::from_network(response))
      }
      Err(error) => {
        // The monitor still thinks we are online; let it catch up
        self.monitor.nudge();
        tracing::warn!(%fingerprint, %error, "call failed while online");

        if is_read {
          if let Some(hit) = self.cache.get::<_, CachedResponse>(fingerprint)? {
            self.meter.increment(Counter::CacheHit);
            tracing::debug!(%fingerprint, "serving cached read after transport failure");
            return Ok(GatewayResponse::from_cache(hit.value));
          }
        }
        Err(error.into())
      }
    }
  }

  fn serve_cached(&self, fingerprint: &RequestFingerprint) -> Result<GatewayResponse, GatewayError> {
    match self.cache.get::<_, CachedResponse>(fingerprint)? {
      Some(hit) => {
        self.meter.increment(Counter::CacheHit);
        tracing::debug!(%fingerprint, "offline cache hit");
        Ok(GatewayResponse::from_cache(hit.value))
      }
      None => {
        self.meter.increment(Counter::CacheMiss);
        tracing::debug!(%fingerprint, "offline cache miss");
        Err(GatewayError::NoCacheAvailable {
          fingerprint: fingerprint.to_string(),
        })
      }
    }
  }

  fn enqueue(&self, request: &ApiRequest) -> Result<GatewayResponse, GatewayError> {
    let queued = self.queue.enqueue(request).map_err(GatewayError::QueueWrite)?;
    self.meter.increment(Counter::Queued);
    tracing::info!(id = queued.id, method = %queued.method, url = %queued.url, "write queued while offline");
    Ok(GatewayResponse::queued(queued.id))
  }

  async fn replay(&self, entry: QueuedRequest) -> ReplayOutcome {
    let fingerprint = RequestFingerprint::new(&entry.method, &entry.url);
    let mut request = entry.to_request();
    if request.body.is_some() && request.content_type().is_none() {
      request = request.with_header("Content-Type", DEFAULT_MEDIA_TYPE);
    }

    let outcome = match self.backend.send(request).await {
      Ok(response) => ReplayOutcome::from_response(&response),
      Err(error) => {
        self.monitor.nudge();
        ReplayOutcome::from_transport_error(&error)
      }
    };

    match &outcome {
      ReplayOutcome::Delivered => {
        self.meter.increment(Counter::Replayed);
        self.invalidate(&fingerprint);
      }
      ReplayOutcome::Transient(_) => self.meter.increment(Counter::ReplayFailed),
      ReplayOutcome::Rejected(_) => {}
    }
    outcome
  }

  /// Resolve the URL against the base and check that headers are well formed,
  /// so nothing unsendable ever reaches the queue.
  fn prepare(&self, mut request: ApiRequest) -> Result<ApiRequest, GatewayError> {
    request.url = crate::backend::resolve_url(self.options.base_url.as_ref(), &request.url)
      .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?
      .to_string();

    for (name, value) in &request.headers {
      HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| GatewayError::InvalidRequest(format!("bad header name {:?}", name)))?;
      HeaderValue::from_str(value)
        .map_err(|_| GatewayError::InvalidRequest(format!("bad value for header {}", name)))?;
    }
    Ok(request)
  }

  fn store(&self, fingerprint: &RequestFingerprint, response: &ApiResponse) {
    let cached = CachedResponse {
      body: response.body.clone(),
      media_type: response.media_type.clone(),
    };
    // A failed cache write must not fail a successful call
    if let Err(e) = self.cache.insert(fingerprint, &cached, None) {
      tracing::warn!(%fingerprint, error = %e, "failed to cache response");
    }
  }

  fn invalidate(&self, fingerprint: &RequestFingerprint) {
    if !self.options.invalidate_on_write {
      return;
    }
    match self.cache.remove_resources(&fingerprint.affected_resources()) {
      Ok(0) => {}
      Ok(removed) => tracing::debug!(%fingerprint, removed, "invalidated cached reads"),
      Err(e) => tracing::warn!(%fingerprint, error = %e, "cache invalidation failed"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::mock::MockBackend;
  use crate::backend::TransportError;
  use crate::cache::SqliteStorage;
  use crate::clock::ManualClock;
  use crate::db::Database;
  use crate::network::{BackendProbe, ConnectivityState};
  use crate::queue::QueueStatus;
  use chrono::Duration;
  use reqwest::Method;

  struct Harness {
    backend: Arc<MockBackend>,
    clock: Arc<ManualClock>,
    db: Arc<Database>,
    gateway: RequestGateway<Arc<MockBackend>>,
  }

  fn harness() -> Harness {
    let backend = Arc::new(MockBackend::new());
    let clock = Arc::new(ManualClock::default());
    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = NetworkMonitor::new(
      Arc::new(BackendProbe::new(backend.clone(), "https://api.test/")),
      std::time::Duration::from_secs(3600),
      std::time::Duration::from_secs(1),
    );
    let cache = ResponseCache::new(Arc::new(SqliteStorage::new(db.clone())))
      .with_clock(clock.clone());
    let queue = Arc::new(PendingWriteQueue::new(db.clone()).with_clock(clock.clone()));
    let gateway = RequestGateway::new(
      backend.clone(),
      monitor,
      cache,
      queue,
      Arc::new(UsageMeter::new()),
    )
    .with_options(GatewayOptions {
      base_url: Some(Url::parse("https://api.test/").unwrap()),
      invalidate_on_write: true,
    });

    Harness {
      backend,
      clock,
      db,
      gateway,
    }
  }

  impl Harness {
    fn online(&self) {
      self.gateway.monitor().report(ConnectivityState::Online);
    }

    fn offline(&self) {
      self.gateway.monitor().report(ConnectivityState::Offline);
    }
  }

  #[tokio::test]
  async fn test_offline_read_matches_online_response() {
    let h = harness();
    h.backend.script(
      Method::GET,
      "https://api.test/items/1",
      Ok(ApiResponse::new(200, Some("application/vnd.item+json"), b"{\"id\":1}".to_vec())),
    );

    h.online();
    let live = h.gateway.send(ApiRequest::get("/items/1")).await.unwrap();
    assert_eq!(live.origin, ResponseOrigin::Network);

    h.offline();
    let cached = h.gateway.send(ApiRequest::get("/items/1")).await.unwrap();
    assert_eq!(cached.origin, ResponseOrigin::Cache);
    assert_eq!(cached.status, 200);
    assert_eq!(cached.body, live.body);
    assert_eq!(cached.media_type, live.media_type);
    assert_eq!(h.gateway.meter().snapshot().cache_hit, 1);
    assert_eq!(h.backend.call_count(), 1);
  }

  #[tokio::test]
  async fn test_offline_read_without_cache_fails_distinctly() {
    let h = harness();
    let err = h.gateway.send(ApiRequest::get("/items/9")).await.unwrap_err();

    assert!(err.is_offline_miss());
    assert_eq!(h.gateway.meter().snapshot().cache_miss, 1);
    assert_eq!(h.backend.call_count(), 0);
  }

  #[tokio::test]
  async fn test_cached_read_expires_after_ttl() {
    let h = harness();
    h.backend.always(Method::GET, "https://api.test/items/1", Ok(ApiResponse::json(200, "{}")));

    h.online();
    h.gateway.send(ApiRequest::get("/items/1")).await.unwrap();
    h.offline();

    h.clock.advance(Duration::minutes(5));
    assert!(h.gateway.send(ApiRequest::get("/items/1")).await.is_ok());

    h.clock.advance(Duration::milliseconds(1));
    let err = h.gateway.send(ApiRequest::get("/items/1")).await.unwrap_err();
    assert!(err.is_offline_miss());
  }

  #[tokio::test]
  async fn test_offline_write_is_queued_exactly() {
    let h = harness();
    let request = ApiRequest::post("https://api.test/items")
      .with_header("Content-Type", "application/json")
      .with_header("X-Trace", "abc")
      .with_body(br#"{"name":"x"}"#.to_vec());

    let response = h.gateway.send(request.clone()).await.unwrap();

    assert_eq!(response.status, 202);
    assert_eq!(response.text(), QUEUED_BODY);
    assert!(response.is_queued());
    assert_eq!(h.gateway.meter().snapshot().queued, 1);

    let pending = h.gateway.queue().pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].to_request(), request);
    assert_eq!(response.origin, ResponseOrigin::Queued { id: pending[0].id });
    assert_eq!(h.backend.call_count(), 0);
  }

  #[tokio::test]
  async fn test_malformed_header_is_not_queued() {
    let h = harness();
    let request = ApiRequest::post("/items")
      .with_header("Bad Header", "x")
      .with_body(b"{}".to_vec());

    let err = h.gateway.send(request).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    assert!(h.gateway.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_failed_queue_write_propagates() {
    let h = harness();
    h.offline();
    h.db.conn().unwrap().execute_batch("DROP TABLE pending_writes").unwrap();

    let err = h
      .gateway
      .send(ApiRequest::post("/items").with_body(b"{}".to_vec()))
      .await
      .unwrap_err();
    assert!(matches!(err, GatewayError::QueueWrite(_)));
    assert_eq!(h.gateway.meter().snapshot().queued, 0);
  }

  #[tokio::test]
  async fn test_relative_url_without_base_is_invalid() {
    let h = harness();
    let gateway = h.gateway.clone().with_options(GatewayOptions {
      base_url: None,
      invalidate_on_write: true,
    });
    h.offline();

    let err = gateway.send(ApiRequest::post("/items").with_body(b"{}".to_vec())).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    assert!(gateway.queue().is_empty().unwrap());
    assert_eq!(h.backend.call_count(), 0);
  }

  #[tokio::test]
  async fn test_online_write_passes_through_and_invalidates() {
    let h = harness();
    h.backend.always(Method::GET, "https://api.test/items", Ok(ApiResponse::json(200, "[]")));
    h.backend.always(Method::GET, "https://api.test/items/1", Ok(ApiResponse::json(200, "{}")));
    h.backend.always(Method::GET, "https://api.test/users", Ok(ApiResponse::json(200, "[]")));
    h.backend.script(
      Method::PUT,
      "https://api.test/items/1",
      Ok(ApiResponse::json(200, r#"{"id":1,"name":"y"}"#)),
    );

    h.online();
    for url in ["/items", "/items/1", "/users"] {
      h.gateway.send(ApiRequest::get(url)).await.unwrap();
    }
    assert_eq!(h.gateway.cache().len().unwrap(), 3);

    let response = h
      .gateway
      .send(ApiRequest::put("/items/1").with_body(br#"{"name":"y"}"#.to_vec()))
      .await
      .unwrap();
    assert_eq!(response.origin, ResponseOrigin::Network);
    assert_eq!(response.text(), r#"{"id":1,"name":"y"}"#);

    // Item and its collection are dropped; unrelated entries stay
    assert_eq!(h.gateway.cache().len().unwrap(), 1);
    assert!(h.gateway.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_transport_failure_while_online() {
    let h = harness();
    h.backend.script(Method::GET, "https://api.test/items/1", Ok(ApiResponse::json(200, "{}")));

    h.online();
    h.gateway.send(ApiRequest::get("/items/1")).await.unwrap();
    h.backend.set_down(true);

    // Read falls back to the cache
    let cached = h.gateway.send(ApiRequest::get("/items/1")).await.unwrap();
    assert_eq!(cached.origin, ResponseOrigin::Cache);

    // Uncached read and writes propagate; writes are not queued
    let err = h.gateway.send(ApiRequest::get("/items/2")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Transport(TransportError::Connect(_))));
    let err = h
      .gateway
      .send(ApiRequest::post("/items").with_body(b"{}".to_vec()))
      .await
      .unwrap_err();
    assert!(matches!(err, GatewayError::Transport(_)));
    assert!(h.gateway.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_drain_replays_verbatim_with_default_content_type() {
    let h = harness();
    h.gateway
      .send(ApiRequest::post("/items").with_header("X-Trace", "t1").with_body(b"{\"a\":1}".to_vec()))
      .await
      .unwrap();
    h.gateway.send(ApiRequest::delete("/items/7")).await.unwrap();
    h.backend.script(Method::POST, "https://api.test/items", Ok(ApiResponse::json(201, "{}")));
    h.backend.script(Method::DELETE, "https://api.test/items/7", Ok(ApiResponse::new(204, None, Vec::new())));

    h.online();
    let report = h.gateway.drain_now().await.unwrap().unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(report.remaining, 0);

    let calls = h.backend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].method, Method::POST);
    assert_eq!(calls[0].header("X-Trace"), Some("t1"));
    assert_eq!(calls[0].content_type(), Some(DEFAULT_MEDIA_TYPE));
    assert_eq!(calls[0].body.as_deref(), Some(b"{\"a\":1}".as_slice()));
    assert_eq!(calls[1].method, Method::DELETE);
    assert_eq!(calls[1].content_type(), None);
    assert_eq!(h.gateway.meter().snapshot().replayed, 2);
  }

  #[tokio::test]
  async fn test_drain_dead_letters_rejected_writes() {
    let h = harness();
    h.gateway.send(ApiRequest::put("/items/1").with_body(b"{}".to_vec())).await.unwrap();
    h.gateway.send(ApiRequest::put("/items/2").with_body(b"{}".to_vec())).await.unwrap();
    h.backend.script(Method::PUT, "https://api.test/items/1", Ok(ApiResponse::json(404, "{}")));
    h.backend.script(Method::PUT, "https://api.test/items/2", Ok(ApiResponse::json(200, "{}")));

    h.online();
    let report = h.gateway.drain_now().await.unwrap().unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.delivered, 1);

    let dead = h.gateway.queue().dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].status, QueueStatus::DeadLettered);
    assert!(dead[0].url.ends_with("/items/1"));

    let snapshot = h.gateway.meter().snapshot();
    assert_eq!(snapshot.dead_lettered, 1);
    assert_eq!(snapshot.replayed, 1);
  }

  #[tokio::test]
  async fn test_get_cached_reuses_live_entry() {
    let h = harness();
    h.backend.always(Method::GET, "https://api.test/items", Ok(ApiResponse::json(200, "[1]")));
    h.online();

    let first = h.gateway.get_cached("/items").await.unwrap();
    let second = h.gateway.get_cached("/items").await.unwrap();

    assert_eq!(first.origin, ResponseOrigin::Network);
    assert_eq!(second.origin, ResponseOrigin::Cache);
    assert_eq!(second.body, first.body);
    assert_eq!(h.backend.call_count(), 1);
  }

  #[tokio::test]
  async fn test_get_cached_does_not_store_errors() {
    let h = harness();
    h.online();

    let response = h.gateway.get_cached("/missing").await.unwrap();
    assert_eq!(response.status, 404);
    assert!(h.gateway.cache().is_empty().unwrap());
  }
}
