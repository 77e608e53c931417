//! Scripted backend for unit tests.

use futures::future::BoxFuture;
use reqwest::Method;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{ApiRequest, ApiResponse, Backend, TransportError, TransportResult};

/// Backend that replays scripted outcomes and records every call.
///
/// Outcomes are consumed per (method, url); once a route's script is empty
/// its fallback (if any) is returned forever, otherwise 404.
#[derive(Default)]
pub struct MockBackend {
  scripts: Mutex<HashMap<(Method, String), VecDeque<TransportResult<ApiResponse>>>>,
  fallbacks: Mutex<HashMap<(Method, String), TransportResult<ApiResponse>>>,
  calls: Mutex<Vec<ApiRequest>>,
  down: AtomicBool,
}

impl MockBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queue a one-shot outcome for a route.
  pub fn script(&self, method: Method, url: &str, outcome: TransportResult<ApiResponse>) {
    self
      .scripts
      .lock()
      .unwrap()
      .entry((method, url.to_string()))
      .or_default()
      .push_back(outcome);
  }

  /// Set the outcome returned once a route's script runs out.
  pub fn always(&self, method: Method, url: &str, outcome: TransportResult<ApiResponse>) {
    self
      .fallbacks
      .lock()
      .unwrap()
      .insert((method, url.to_string()), outcome);
  }

  /// While down, every call fails with a connection error.
  pub fn set_down(&self, down: bool) {
    self.down.store(down, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<ApiRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  fn respond(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
    if self.down.load(Ordering::SeqCst) {
      return Err(TransportError::Connect("backend unreachable".to_string()));
    }

    let key = (request.method.clone(), request.url.clone());
    if let Some(outcome) = self
      .scripts
      .lock()
      .unwrap()
      .get_mut(&key)
      .and_then(|q| q.pop_front())
    {
      return outcome;
    }

    self
      .fallbacks
      .lock()
      .unwrap()
      .get(&key)
      .cloned()
      .unwrap_or_else(|| Ok(ApiResponse::json(404, r#"{"error":"not found"}"#)))
  }
}

impl Backend for MockBackend {
  fn send(&self, request: ApiRequest) -> BoxFuture<'_, TransportResult<ApiResponse>> {
    Box::pin(async move {
      let outcome = self.respond(&request);
      self.calls.lock().unwrap().push(request);
      outcome
    })
  }
}
