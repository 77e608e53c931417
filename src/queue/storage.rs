//! SQLite-backed pending write log.

use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::request::{QueueStatus, QueuedRequest, RetryPolicy};
use super::QueueError;
use crate::backend::ApiRequest;
use crate::clock::{from_millis, to_millis, Clock, SystemClock};
use crate::db::Database;

const SELECT_COLUMNS: &str = "SELECT seq, method, url, body, headers, enqueued_at, attempts,
                                     status, last_error, last_attempt_at, next_attempt_at
                              FROM pending_writes";

/// How long a drain lease stays valid without renewal.
///
/// Renewed before every replay, so it only runs out when its holder died.
pub(super) const LEASE_TTL_SECS: i64 = 300;

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(0);

fn holder_token() -> String {
  format!(
    "{}:{}:{}",
    std::process::id(),
    to_millis(chrono::Utc::now()),
    NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
  )
}

/// Durable, ordered store of writes that have not reached the backend.
///
/// Append-only from the caller's side: entries leave the log only when
/// delivered (checkpoint), or move to the dead-letter shelf.
pub struct PendingWriteQueue {
  pub(super) db: Arc<Database>,
  pub(super) clock: Arc<dyn Clock>,
  pub(super) policy: RetryPolicy,
  /// Set while a drain pass is running in this process
  pub(super) draining: AtomicBool,
  /// Identifies this queue in the shared drain lease
  pub(super) holder: String,
}

impl PendingWriteQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self {
      db,
      clock: Arc::new(SystemClock),
      policy: RetryPolicy::default(),
      draining: AtomicBool::new(false),
      holder: holder_token(),
    }
  }

  pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn policy(&self) -> RetryPolicy {
    self.policy
  }

  /// Append a write to the tail of the log.
  ///
  /// The entry is committed before this returns. Reads are refused.
  pub fn enqueue(&self, request: &ApiRequest) -> Result<QueuedRequest, QueueError> {
    if request.is_read() {
      return Err(QueueError::InvalidMethod(request.method.to_string()));
    }

    let headers = serde_json::to_string(&request.headers)?;
    let enqueued_at = self.clock.now();

    let conn = self.db.conn()?;
    conn.execute(
      "INSERT INTO pending_writes (method, url, body, headers, enqueued_at, attempts, status)
       VALUES (?, ?, ?, ?, ?, 0, ?)",
      params![
        request.method.as_str(),
        request.url,
        request.body,
        headers,
        to_millis(enqueued_at),
        QueueStatus::Pending.as_str(),
      ],
    )?;
    let id = conn.last_insert_rowid();

    tracing::debug!(id, method = %request.method, url = %request.url, "write queued");

    Ok(QueuedRequest {
      id,
      method: request.method.clone(),
      url: request.url.clone(),
      body: request.body.clone(),
      headers: request.headers.clone(),
      enqueued_at: from_millis(to_millis(enqueued_at)),
      attempts: 0,
      status: QueueStatus::Pending,
      last_error: None,
      last_attempt_at: None,
      next_attempt_at: None,
    })
  }

  /// Get a specific entry by id, whatever its status.
  pub fn get(&self, id: i64) -> Result<Option<QueuedRequest>, QueueError> {
    let conn = self.db.conn()?;
    let sql = format!("{} WHERE seq = ?", SELECT_COLUMNS);

    let row = conn
      .query_row(&sql, params![id], read_row)
      .optional()?;

    row.map(QueuedRequest::try_from).transpose()
  }

  /// Oldest pending entry: the next one to replay.
  pub fn head(&self) -> Result<Option<QueuedRequest>, QueueError> {
    let conn = self.db.conn()?;
    let sql = format!("{} WHERE status = ? ORDER BY seq ASC LIMIT 1", SELECT_COLUMNS);

    let row = conn
      .query_row(&sql, params![QueueStatus::Pending.as_str()], read_row)
      .optional()?;

    row.map(QueuedRequest::try_from).transpose()
  }

  /// All pending entries in replay order.
  pub fn pending(&self) -> Result<Vec<QueuedRequest>, QueueError> {
    self.list(QueueStatus::Pending)
  }

  /// All dead-lettered entries, oldest first.
  pub fn dead_letters(&self) -> Result<Vec<QueuedRequest>, QueueError> {
    self.list(QueueStatus::DeadLettered)
  }

  fn list(&self, status: QueueStatus) -> Result<Vec<QueuedRequest>, QueueError> {
    let conn = self.db.conn()?;
    let sql = format!("{} WHERE status = ? ORDER BY seq ASC", SELECT_COLUMNS);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.as_str()], read_row)?;

    let mut entries = Vec::new();
    for row in rows {
      entries.push(QueuedRequest::try_from(row?)?);
    }
    Ok(entries)
  }

  /// Number of pending entries.
  pub fn len(&self) -> Result<usize, QueueError> {
    self.count(QueueStatus::Pending)
  }

  pub fn is_empty(&self) -> Result<bool, QueueError> {
    Ok(self.len()? == 0)
  }

  pub fn dead_letter_count(&self) -> Result<usize, QueueError> {
    self.count(QueueStatus::DeadLettered)
  }

  fn count(&self, status: QueueStatus) -> Result<usize, QueueError> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM pending_writes WHERE status = ?",
      params![status.as_str()],
      |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or_default())
  }

  /// Remove a delivered entry.
  pub(super) fn checkpoint(&self, id: i64) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    conn.execute("DELETE FROM pending_writes WHERE seq = ?", params![id])?;
    Ok(())
  }

  /// Record a transient failure and when the entry may be retried.
  pub(super) fn record_attempt(&self, id: i64, error: &str) -> Result<u32, QueueError> {
    let now = self.clock.now();
    let conn = self.db.conn()?;

    let attempts: u32 = conn.query_row(
      "UPDATE pending_writes SET attempts = attempts + 1, last_error = ?, last_attempt_at = ?
       WHERE seq = ? RETURNING attempts",
      params![error, to_millis(now), id],
      |row| row.get(0),
    )?;

    let next = now + self.policy.backoff(attempts);
    conn.execute(
      "UPDATE pending_writes SET next_attempt_at = ? WHERE seq = ?",
      params![to_millis(next), id],
    )?;

    Ok(attempts)
  }

  /// Move an entry to the dead-letter shelf.
  pub(super) fn dead_letter(&self, id: i64, error: &str) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    conn.execute(
      "UPDATE pending_writes SET status = ?, last_error = ?, last_attempt_at = ?,
              next_attempt_at = NULL
       WHERE seq = ?",
      params![
        QueueStatus::DeadLettered.as_str(),
        error,
        to_millis(self.clock.now()),
        id
      ],
    )?;
    Ok(())
  }

  /// Claim the drain lease for `holder`.
  ///
  /// Fails when another holder's lease has not yet expired. The check and
  /// the claim share one write transaction, so two processes cannot both
  /// win.
  pub(super) fn acquire_lease(&self, holder: &str) -> Result<bool, QueueError> {
    let now = to_millis(self.clock.now());
    let mut conn = self.db.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current: Option<(String, i64)> = tx
      .query_row("SELECT holder, expires_at FROM drain_lease WHERE id = 1", [], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .optional()?;
    if let Some((other, expires_at)) = current {
      if other != holder && expires_at > now {
        return Ok(false);
      }
      if other != holder {
        tracing::warn!(%other, "taking over expired drain lease");
      }
    }

    tx.execute(
      "INSERT INTO drain_lease (id, holder, expires_at) VALUES (1, ?, ?)
       ON CONFLICT(id) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at",
      params![holder, now + LEASE_TTL_SECS * 1000],
    )?;
    tx.commit()?;
    Ok(true)
  }

  /// Push the lease expiry forward. False if `holder` no longer owns it.
  pub(super) fn renew_lease(&self, holder: &str) -> Result<bool, QueueError> {
    let expires_at = to_millis(self.clock.now()) + LEASE_TTL_SECS * 1000;
    let conn = self.db.conn()?;
    let updated = conn.execute(
      "UPDATE drain_lease SET expires_at = ? WHERE id = 1 AND holder = ?",
      params![expires_at, holder],
    )?;
    Ok(updated == 1)
  }

  pub(super) fn release_lease(&self, holder: &str) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    conn.execute("DELETE FROM drain_lease WHERE id = 1 AND holder = ?", params![holder])?;
    Ok(())
  }

  /// Put a dead letter back at the tail of the log with a fresh attempt count.
  pub fn requeue(&self, id: i64) -> Result<QueuedRequest, QueueError> {
    let new_id = {
      let mut conn = self.db.conn()?;
      let tx = conn.transaction()?;

      let inserted = tx.execute(
        "INSERT INTO pending_writes (method, url, body, headers, enqueued_at, attempts, status)
         SELECT method, url, body, headers, enqueued_at, 0, ?
         FROM pending_writes WHERE seq = ? AND status = ?",
        params![
          QueueStatus::Pending.as_str(),
          id,
          QueueStatus::DeadLettered.as_str()
        ],
      )?;
      if inserted == 0 {
        return Err(QueueError::NotFound(id));
      }
      let new_id = tx.last_insert_rowid();
      tx.execute("DELETE FROM pending_writes WHERE seq = ?", params![id])?;
      tx.commit()?;
      new_id
    };

    tracing::info!(id, new_id, "dead letter requeued");
    self.get(new_id)?.ok_or(QueueError::NotFound(new_id))
  }

  /// Delete a dead letter for good.
  pub fn discard(&self, id: i64) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    let removed = conn.execute(
      "DELETE FROM pending_writes WHERE seq = ? AND status = ?",
      params![id, QueueStatus::DeadLettered.as_str()],
    )?;

    if removed == 0 {
      return Err(QueueError::NotFound(id));
    }
    tracing::info!(id, "dead letter discarded");
    Ok(())
  }
}

/// Raw column values of one log row.
pub(super) struct QueueRow {
  seq: i64,
  method: String,
  url: String,
  body: Option<Vec<u8>>,
  headers: String,
  enqueued_at: i64,
  attempts: u32,
  status: String,
  last_error: Option<String>,
  last_attempt_at: Option<i64>,
  next_attempt_at: Option<i64>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<QueueRow> {
  Ok(QueueRow {
    seq: row.get(0)?,
    method: row.get(1)?,
    url: row.get(2)?,
    body: row.get(3)?,
    headers: row.get(4)?,
    enqueued_at: row.get(5)?,
    attempts: row.get(6)?,
    status: row.get(7)?,
    last_error: row.get(8)?,
    last_attempt_at: row.get(9)?,
    next_attempt_at: row.get(10)?,
  })
}

impl TryFrom<QueueRow> for QueuedRequest {
  type Error = QueueError;

  fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
    let method = reqwest::Method::from_bytes(row.method.as_bytes())
      .map_err(|_| QueueError::Corrupt(format!("entry {} has method {:?}", row.seq, row.method)))?;
    let status = QueueStatus::parse(&row.status)
      .ok_or_else(|| QueueError::Corrupt(format!("entry {} has status {:?}", row.seq, row.status)))?;

    Ok(QueuedRequest {
      id: row.seq,
      method,
      url: row.url,
      body: row.body,
      headers: serde_json::from_str(&row.headers)?,
      enqueued_at: from_millis(row.enqueued_at),
      attempts: row.attempts,
      status,
      last_error: row.last_error,
      last_attempt_at: row.last_attempt_at.map(from_millis),
      next_attempt_at: row.next_attempt_at.map(from_millis),
    })
  }
}
