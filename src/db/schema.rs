/// Schema for the response cache and the pending write log.
///
/// Timestamps are milliseconds since the Unix epoch.
pub const SCHEMA: &str = r#"
-- Cached GET responses, keyed by fingerprint digest
CREATE TABLE IF NOT EXISTS response_cache (
    cache_key TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    resource TEXT NOT NULL,
    data BLOB NOT NULL,
    media_type TEXT,
    stored_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_response_cache_resource
    ON response_cache(resource);

CREATE INDEX IF NOT EXISTS idx_response_cache_expires
    ON response_cache(expires_at);

-- Append-only log of writes captured while offline
CREATE TABLE IF NOT EXISTS pending_writes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body BLOB,
    headers TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT,
    last_attempt_at INTEGER,
    next_attempt_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_pending_writes_status
    ON pending_writes(status, seq);

-- At most one drain pass across every process sharing this file
CREATE TABLE IF NOT EXISTS drain_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;
