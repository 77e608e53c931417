//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};

use super::fingerprint::hash_key;
use super::CacheError;

/// Anything that can address a cache entry.
pub trait CacheKey {
  /// Stable, fixed-length storage key.
  fn cache_hash(&self) -> String;

  /// Human-readable form, stored next to the entry for inspection.
  fn description(&self) -> String;

  /// Resource path used for write invalidation, if the key addresses one.
  fn resource(&self) -> Option<&str> {
    None
  }
}

impl CacheKey for str {
  fn cache_hash(&self) -> String {
    hash_key(self)
  }

  fn description(&self) -> String {
    self.to_string()
  }
}

impl CacheKey for String {
  fn cache_hash(&self) -> String {
    hash_key(self)
  }

  fn description(&self) -> String {
    self.clone()
  }
}

/// Values that can be stored in the response cache.
pub trait Cacheable: Sized + Send {
  /// Encode into stored bytes plus an optional media type.
  fn encode(&self) -> Result<(Vec<u8>, Option<String>), CacheError>;

  /// Rebuild from what [`Cacheable::encode`] produced.
  fn decode(data: Vec<u8>, media_type: Option<String>) -> Result<Self, CacheError>;
}

/// A response body and its media type, stored byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub body: Vec<u8>,
  pub media_type: Option<String>,
}

impl Cacheable for CachedResponse {
  fn encode(&self) -> Result<(Vec<u8>, Option<String>), CacheError> {
    Ok((self.body.clone(), self.media_type.clone()))
  }

  fn decode(data: Vec<u8>, media_type: Option<String>) -> Result<Self, CacheError> {
    Ok(Self {
      body: data,
      media_type,
    })
  }
}

/// Wrapper that caches any serde value as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: Serialize + DeserializeOwned + Send> Cacheable for Json<T> {
  fn encode(&self) -> Result<(Vec<u8>, Option<String>), CacheError> {
    Ok((
      serde_json::to_vec(&self.0)?,
      Some("application/json".to_string()),
    ))
  }

  fn decode(data: Vec<u8>, _media_type: Option<String>) -> Result<Self, CacheError> {
    Ok(Json(serde_json::from_slice(&data)?))
  }
}

/// A stored cache row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  /// Storage key (digest of the fingerprint)
  pub key: String,
  /// Readable fingerprint, e.g. `GET:https://api.example.com/items/1`
  pub fingerprint: String,
  /// Resource path for invalidation
  pub resource: String,
  pub data: Vec<u8>,
  pub media_type: Option<String>,
  pub stored_at: DateTime<Utc>,
  /// Absolute expiry, fixed at store time
  pub expires_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn ttl(&self) -> Duration {
    self.expires_at - self.stored_at
  }

  /// Expired for any lookup strictly after `stored_at + ttl`.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }
}

/// Result of a successful cache lookup.
#[derive(Debug, Clone)]
pub struct CacheHit<T> {
  pub value: T,
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}
