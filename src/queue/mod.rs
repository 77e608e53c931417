//! Pending write queue: a small write-ahead log for offline mutations.
//!
//! Writes captured while offline are appended to a durable log and replayed
//! strictly in order once connectivity returns:
//! - delivered entries are checkpointed (removed)
//! - a transient failure reschedules the head entry and stops the pass, so
//!   nothing behind it can overtake it
//! - a definitive rejection, or running out of attempts, moves the entry to
//!   the dead-letter shelf; rejections do not block the entries behind them
//!
//! Delivery is at-least-once: a crash between a successful replay and its
//! checkpoint replays that entry again on the next drain.

mod request;
mod storage;

pub use request::{
  DrainHalt, DrainReport, QueueStatus, QueuedRequest, ReplayOutcome, RetryPolicy,
};
pub use storage::PendingWriteQueue;

use std::future::Future;
use std::sync::atomic::Ordering;

use crate::error::StorageError;

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("queue storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("queue serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Only mutating requests may be queued.
  #[error("{0} requests cannot be queued")]
  InvalidMethod(String),

  #[error("no such queue entry: {0}")]
  NotFound(i64),

  #[error("corrupt queue entry: {0}")]
  Corrupt(String),
}

impl From<rusqlite::Error> for QueueError {
  fn from(e: rusqlite::Error) -> Self {
    QueueError::Storage(StorageError::Sqlite(e))
  }
}

/// Releases the drain lease and clears the draining flag when a pass ends,
/// however it ends.
struct DrainGuard<'a> {
  queue: &'a PendingWriteQueue,
  leased: bool,
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    if self.leased {
      if let Err(e) = self.queue.release_lease(&self.queue.holder) {
        tracing::warn!(error = %e, "failed to release drain lease");
      }
    }
    self.queue.draining.store(false, Ordering::Release);
  }
}

impl PendingWriteQueue {
  /// True while a drain pass in this process holds the log.
  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  /// Replay pending entries in enqueue order.
  ///
  /// Returns `None` without touching the log if another drain is already
  /// running, here or in another process sharing the database.
  pub async fn drain<F, Fut>(&self, mut replay: F) -> Result<Option<DrainReport>, QueueError>
  where
    F: FnMut(QueuedRequest) -> Fut,
    Fut: Future<Output = ReplayOutcome>,
  {
    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      tracing::debug!("drain already in progress");
      return Ok(None);
    }
    let mut guard = DrainGuard {
      queue: self,
      leased: false,
    };
    if !self.acquire_lease(&self.holder)? {
      tracing::debug!("drain lease held elsewhere");
      return Ok(None);
    }
    guard.leased = true;

    let mut report = DrainReport::default();

    while let Some(entry) = self.head()? {
      if !self.renew_lease(&self.holder)? {
        tracing::warn!("drain lease lost, stopping pass");
        break;
      }

      let now = self.clock.now();
      if !entry.is_ready_at(now) {
        if let Some(until) = entry.next_attempt_at {
          report.halted = Some(DrainHalt::BackingOff { id: entry.id, until });
        }
        break;
      }

      let id = entry.id;
      let method = entry.method.clone();
      let url = entry.url.clone();

      match replay(entry).await {
        ReplayOutcome::Delivered => {
          self.checkpoint(id)?;
          report.delivered += 1;
          tracing::info!(id, %method, %url, "queued write delivered");
        }
        ReplayOutcome::Rejected(error) => {
          self.dead_letter(id, &error)?;
          report.dead_lettered += 1;
          tracing::warn!(id, %method, %url, %error, "queued write rejected, dead-lettered");
        }
        ReplayOutcome::Transient(error) => {
          let attempts = self.record_attempt(id, &error)?;
          if attempts >= self.policy.max_attempts {
            self.dead_letter(id, &error)?;
            report.dead_lettered += 1;
            tracing::warn!(id, attempts, %method, %url, %error, "attempt cap reached, dead-lettered");
          } else {
            tracing::warn!(id, attempts, %method, %url, %error, "queued write failed, will retry");
          }
          report.halted = Some(DrainHalt::TransientFailure { id, error });
          break;
        }
      }
    }

    report.remaining = self.len()?;
    Ok(Some(report))
  }
}
