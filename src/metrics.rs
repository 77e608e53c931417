//! Usage counters.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Names of the counters kept by [`UsageMeter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
  /// Offline read served from the cache
  CacheHit,
  /// Offline read with nothing cached
  CacheMiss,
  /// Write captured while offline
  Queued,
  /// Queued write delivered during a drain
  Replayed,
  /// Queued write moved to the dead-letter shelf
  DeadLettered,
  /// Replay attempt that failed transiently
  ReplayFailed,
}

impl Counter {
  pub const ALL: [Counter; 6] = [
    Counter::CacheHit,
    Counter::CacheMiss,
    Counter::Queued,
    Counter::Replayed,
    Counter::DeadLettered,
    Counter::ReplayFailed,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      Counter::CacheHit => "cache_hit",
      Counter::CacheMiss => "cache_miss",
      Counter::Queued => "queued",
      Counter::Replayed => "replayed",
      Counter::DeadLettered => "dead_lettered",
      Counter::ReplayFailed => "replay_failed",
    }
  }

  fn index(&self) -> usize {
    *self as usize
  }
}

impl fmt::Display for Counter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Lock-free event counters, shared across the gateway and replay worker.
#[derive(Debug, Default)]
pub struct UsageMeter {
  counters: [AtomicU64; 6],
}

impl UsageMeter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn increment(&self, counter: Counter) {
    self.add(counter, 1);
  }

  pub fn add(&self, counter: Counter, n: u64) {
    self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    tracing::trace!(counter = counter.name(), n, "usage");
  }

  pub fn get(&self, counter: Counter) -> u64 {
    self.counters[counter.index()].load(Ordering::Relaxed)
  }

  pub fn snapshot(&self) -> UsageSnapshot {
    UsageSnapshot {
      cache_hit: self.get(Counter::CacheHit),
      cache_miss: self.get(Counter::CacheMiss),
      queued: self.get(Counter::Queued),
      replayed: self.get(Counter::Replayed),
      dead_lettered: self.get(Counter::DeadLettered),
      replay_failed: self.get(Counter::ReplayFailed),
    }
  }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
  pub cache_hit: u64,
  pub cache_miss: u64,
  pub queued: u64,
  pub replayed: u64,
  pub dead_lettered: u64,
  pub replay_failed: u64,
}
