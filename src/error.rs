//! Error taxonomy for the gateway and its collaborators.

use crate::backend::TransportError;
use crate::cache::CacheError;
use crate::queue::QueueError;

/// Errors surfaced to callers of [`crate::gateway::RequestGateway`].
///
/// A queued write is not an error: it comes back as a successful
/// response with [`crate::gateway::ResponseOrigin::Queued`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
  /// The network call failed and nothing local could stand in for it.
  #[error("transport error: {0}")]
  Transport(#[from] TransportError),

  /// Offline read with no cached value for the fingerprint.
  #[error("no connectivity and no cached value for {fingerprint}")]
  NoCacheAvailable { fingerprint: String },

  /// Persisting a write to the pending queue failed; the write was not captured.
  #[error("failed to queue write: {0}")]
  QueueWrite(#[source] QueueError),

  /// The response cache could not be read or written.
  #[error("cache error: {0}")]
  Cache(#[from] CacheError),

  /// The request itself is malformed (bad header, bad method).
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl GatewayError {
  /// True for the "unavailable offline" condition, which UIs render differently
  /// from a generic failure.
  pub fn is_offline_miss(&self) -> bool {
    matches!(self, GatewayError::NoCacheAvailable { .. })
  }
}

/// Errors from the shared SQLite database.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("lock poisoned: {0}")]
  Poisoned(String),

  #[error("could not determine data directory")]
  NoDataDir,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_offline_miss_is_distinct() {
    let miss = GatewayError::NoCacheAvailable {
      fingerprint: "GET:https://api.test/items/1".to_string(),
    };
    assert!(miss.is_offline_miss());
    assert!(miss.to_string().contains("GET:https://api.test/items/1"));

    let transport = GatewayError::Transport(TransportError::Timeout);
    assert!(!transport.is_offline_miss());
  }
}
