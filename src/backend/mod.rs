//! Transport seam between the gateway and the backend HTTP API.
//!
//! Provides a trait-based backend that enables:
//! - Real HTTP calls via reqwest in production
//! - Scripted backends for unit testing

mod http;
mod types;

#[cfg(test)]
pub(crate) mod mock;

use futures::future::BoxFuture;
use std::sync::Arc;

pub use http::HttpBackend;
pub use types::{resolve_url, ApiRequest, ApiResponse, DEFAULT_MEDIA_TYPE};

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  /// Could not reach the server.
  #[error("connection failed: {0}")]
  Connect(String),

  /// The call did not complete in time.
  #[error("request timed out")]
  Timeout,

  /// The connection broke while the body was being read or written.
  #[error("I/O failed: {0}")]
  Io(String),

  /// The URL could not be resolved.
  #[error("invalid URL: {0}")]
  InvalidUrl(String),

  /// The request could not be built (bad method or header).
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Backend trait for request/response calls.
///
/// Implementations return the full response, body included. Any HTTP
/// status is a successful transport; only failures to get a response at all
/// are errors.
pub trait Backend: Send + Sync {
  fn send(&self, request: ApiRequest) -> BoxFuture<'_, TransportResult<ApiResponse>>;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
  fn send(&self, request: ApiRequest) -> BoxFuture<'_, TransportResult<ApiResponse>> {
    (**self).send(request)
  }
}
