//! Reachability probes.

use futures::future::BoxFuture;
use reqwest::Method;

use crate::backend::{ApiRequest, Backend, TransportResult};

/// A single reachability check.
///
/// `Ok(true)` means the backend answered. Errors and `Ok(false)` are both
/// treated as Offline by the monitor.
pub trait Probe: Send + Sync {
  fn check(&self) -> BoxFuture<'_, TransportResult<bool>>;
}

/// Probes by sending a `HEAD` request through a backend.
///
/// Any HTTP response counts as reachable, including 4xx and 5xx: the
/// question is whether the server can be reached, not whether it is healthy.
pub struct BackendProbe<B> {
  backend: B,
  url: String,
}

impl<B: Backend> BackendProbe<B> {
  pub fn new(backend: B, url: impl Into<String>) -> Self {
    Self {
      backend,
      url: url.into(),
    }
  }

  pub fn url(&self) -> &str {
    &self.url
  }
}

impl<B: Backend> Probe for BackendProbe<B> {
  fn check(&self) -> BoxFuture<'_, TransportResult<bool>> {
    Box::pin(async move {
      let response = self
        .backend
        .send(ApiRequest::new(Method::HEAD, self.url.clone()))
        .await?;
      tracing::trace!(url = %self.url, status = response.status, "probe answered");
      Ok(true)
    })
  }
}
