//! Queued write records and the outcomes of replaying them.

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use std::fmt;

use crate::backend::{ApiRequest, ApiResponse, TransportError};

/// Lifecycle state of a queued write.
///
/// Delivered writes are removed from the log, so they have no state here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
  /// Waiting to be replayed.
  Pending,
  /// Shelved for inspection; excluded from drains.
  DeadLettered,
}

impl QueueStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueueStatus::Pending => "pending",
      QueueStatus::DeadLettered => "dead_lettered",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(QueueStatus::Pending),
      "dead_lettered" => Some(QueueStatus::DeadLettered),
      _ => None,
    }
  }
}

impl fmt::Display for QueueStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A mutating request captured for later delivery. Never a GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRequest {
  /// Log sequence number; replay order is ascending `id`
  pub id: i64,
  pub method: Method,
  pub url: String,
  pub body: Option<Vec<u8>>,
  pub headers: Vec<(String, String)>,
  pub enqueued_at: DateTime<Utc>,
  /// Replay attempts that failed transiently
  pub attempts: u32,
  pub status: QueueStatus,
  pub last_error: Option<String>,
  pub last_attempt_at: Option<DateTime<Utc>>,
  /// Earliest time the next replay may run
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedRequest {
  /// Rebuild the captured request verbatim.
  pub fn to_request(&self) -> ApiRequest {
    ApiRequest {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }

  pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

/// Result of one replay attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
  /// The backend confirmed the write.
  Delivered,
  /// Worth retrying later (transport failure, 5xx, 408, 429).
  Transient(String),
  /// The backend refused the write for good (other 4xx).
  Rejected(String),
}

impl ReplayOutcome {
  /// Classify a backend reply to a replayed write.
  pub fn from_response(response: &ApiResponse) -> Self {
    match response.status {
      200..=299 => ReplayOutcome::Delivered,
      408 | 429 => ReplayOutcome::Transient(format!("HTTP {}", response.status)),
      400..=499 => ReplayOutcome::Rejected(format!(
        "HTTP {}: {}",
        response.status,
        truncate(&response.text(), 200)
      )),
      status => ReplayOutcome::Transient(format!("HTTP {}", status)),
    }
  }

  pub fn from_transport_error(error: &TransportError) -> Self {
    match error {
      // A request we cannot even build will never succeed
      TransportError::InvalidUrl(_) | TransportError::InvalidRequest(_) => {
        ReplayOutcome::Rejected(error.to_string())
      }
      _ => ReplayOutcome::Transient(error.to_string()),
    }
  }
}

/// Bounded exponential backoff for transient replay failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Transient failures tolerated before a write is dead-lettered
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_backoff: Duration::milliseconds(500),
      max_backoff: Duration::seconds(60),
    }
  }
}

impl RetryPolicy {
  /// Delay before the next attempt after `attempts` failures.
  pub fn backoff(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(30);
    let factor = 1i32 << exponent;
    let delay = self
      .initial_backoff
      .checked_mul(factor)
      .unwrap_or(self.max_backoff);
    std::cmp::min(delay, self.max_backoff)
  }
}

/// Why a drain stopped before the log was empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainHalt {
  /// The head entry failed transiently and was rescheduled.
  TransientFailure { id: i64, error: String },
  /// The head entry is still inside its backoff window.
  BackingOff { id: i64, until: DateTime<Utc> },
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: usize,
  pub dead_lettered: usize,
  pub halted: Option<DrainHalt>,
  /// Pending entries left when the pass ended
  pub remaining: usize,
}

fn truncate(s: &str, max: usize) -> &str {
  match s.char_indices().nth(max) {
    Some((i, _)) => &s[..i],
    None => s,
  }
}
