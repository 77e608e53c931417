//! Response cache: TTL-bounded key/value store with single-flight population.

use chrono::Duration;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use super::storage::CacheStorage;
use super::traits::{CacheHit, CacheKey, Cacheable, CachedEntry};
use super::CacheError;
use crate::clock::{to_millis, Clock, SystemClock};

/// Cache layer that manages expiry and population of cached values.
///
/// Cheap to clone; clones share storage and the per-key lock table.
#[derive(Clone)]
pub struct ResponseCache {
  storage: Arc<dyn CacheStorage>,
  clock: Arc<dyn Clock>,
  /// TTL used when a caller does not pass one
  default_ttl: Duration,
  /// Per-key locks held while a missing value is being produced
  key_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ResponseCache {
  /// Create a new cache over the given storage backend.
  pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
    Self {
      storage,
      clock: Arc::new(SystemClock),
      default_ttl: Duration::minutes(5),
      key_locks: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Look up an unexpired value.
  pub fn get<K, T>(&self, key: &K) -> Result<Option<CacheHit<T>>, CacheError>
  where
    K: CacheKey + ?Sized,
    T: Cacheable,
  {
    let Some(entry) = self.storage.get(&key.cache_hash())? else {
      return Ok(None);
    };

    if entry.is_expired_at(self.clock.now()) {
      tracing::trace!(key = %entry.fingerprint, "cache entry expired");
      return Ok(None);
    }

    Ok(Some(CacheHit {
      value: T::decode(entry.data, entry.media_type)?,
      stored_at: entry.stored_at,
      expires_at: entry.expires_at,
    }))
  }

  /// Store a value, superseding any previous one. Expiry is absolute:
  /// `now + ttl`, never extended by later reads.
  pub fn insert<K, T>(&self, key: &K, value: &T, ttl: Option<Duration>) -> Result<(), CacheError>
  where
    K: CacheKey + ?Sized,
    T: Cacheable,
  {
    let (data, media_type) = value.encode()?;
    let fingerprint = key.description();
    let stored_at = self.clock.now();

    let entry = CachedEntry {
      key: key.cache_hash(),
      resource: key
        .resource()
        .map(String::from)
        .unwrap_or_else(|| fingerprint.clone()),
      fingerprint,
      data,
      media_type,
      stored_at,
      expires_at: stored_at + ttl.unwrap_or(self.default_ttl),
    };

    self.storage.put(&entry)
  }

  /// Return the cached value for `key`, or produce it with `factory`.
  ///
  /// At most one factory runs per key at a time: concurrent callers that
  /// miss on the same key wait for the first and then read its result.
  /// A `None` from the factory is returned but not stored.
  pub async fn get_or_add<K, T, E, F, Fut>(
    &self,
    key: &K,
    factory: F,
    ttl: Option<Duration>,
  ) -> Result<Option<T>, E>
  where
    K: CacheKey + ?Sized,
    T: Cacheable,
    E: From<CacheError>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
  {
    if let Some(hit) = self.get::<K, T>(key)? {
      return Ok(Some(hit.value));
    }

    let hash = key.cache_hash();
    let lock = self.key_lock(&hash);
    let result = self.fill_locked(key, factory, ttl, &lock).await;
    self.release_key_lock(&hash, lock);

    result
  }

  async fn fill_locked<K, T, E, F, Fut>(
    &self,
    key: &K,
    factory: F,
    ttl: Option<Duration>,
    lock: &tokio::sync::Mutex<()>,
  ) -> Result<Option<T>, E>
  where
    K: CacheKey + ?Sized,
    T: Cacheable,
    E: From<CacheError>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
  {
    let _guard = lock.lock().await;

    // Another caller may have filled it while we waited
    if let Some(hit) = self.get::<K, T>(key)? {
      return Ok(Some(hit.value));
    }

    let value = factory().await?;
    if let Some(value) = &value {
      self.insert(key, value, ttl)?;
    }
    Ok(value)
  }

  /// Invalidate one key.
  pub fn remove<K: CacheKey + ?Sized>(&self, key: &K) -> Result<bool, CacheError> {
    self.storage.remove(&key.cache_hash())
  }

  /// Invalidate every entry addressing any of `resources`.
  pub fn remove_resources(&self, resources: &[String]) -> Result<usize, CacheError> {
    self.storage.remove_resources(resources)
  }

  /// Drop every entry.
  pub fn clear(&self) -> Result<usize, CacheError> {
    self.storage.clear()
  }

  /// Delete entries that are already past their expiry.
  pub fn purge_expired(&self) -> Result<usize, CacheError> {
    self.storage.purge_expired(to_millis(self.clock.now()))
  }

  pub fn len(&self) -> Result<usize, CacheError> {
    self.storage.len()
  }

  pub fn is_empty(&self) -> Result<bool, CacheError> {
    Ok(self.len()? == 0)
  }

  fn key_lock(&self, hash: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = match self.key_locks.lock() {
      Ok(locks) => locks,
      Err(poisoned) => poisoned.into_inner(),
    };
    Arc::clone(locks.entry(hash.to_string()).or_default())
  }

  fn release_key_lock(&self, hash: &str, lock: Arc<tokio::sync::Mutex<()>>) {
    let mut locks = match self.key_locks.lock() {
      Ok(locks) => locks,
      Err(poisoned) => poisoned.into_inner(),
    };
    // Only the table and this caller hold it: nobody else is waiting
    if Arc::strong_count(&lock) == 2 {
      locks.remove(hash);
    }
  }
}
