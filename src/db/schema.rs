//! Durable store schema, one entry per version.
//!
//! The applied version is tracked in `PRAGMA user_version`; entries are only
//! ever appended.

pub const MIGRATIONS: &[&str] = &[V1, V2];

/// Domain entities and the pending-operation queue.
const V1: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    pending_sync INTEGER
);

CREATE INDEX IF NOT EXISTS idx_items_status ON items(status);
CREATE INDEX IF NOT EXISTS idx_items_created ON items(created_at);

-- AUTOINCREMENT keeps ids monotonic even after deletes
CREATE TABLE IF NOT EXISTS pending_ops (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_ops_entity ON pending_ops(entity_type, entity_id);
"#;

/// Retry bookkeeping for backoff and dead-lettering.
const V2: &str = r#"
ALTER TABLE pending_ops ADD COLUMN last_attempt_at TEXT;
ALTER TABLE pending_ops ADD COLUMN dead_lettered_at TEXT;
"#;
