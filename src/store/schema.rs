//! SQLite schema for the offline cache.

/// Schema for all cache tables. Idempotent: re-running is a no-op, and a
/// version bump that adds a table leaves existing partitions untouched.
pub const SCHEMA: &str = r#"
-- Binary payloads: exercise images, synthesized audio, nutrition documents,
-- user snapshots. Partition + key is the natural primary key; a put with an
-- existing key overwrites.
CREATE TABLE IF NOT EXISTS blobs (
    partition TEXT NOT NULL,
    key TEXT NOT NULL,
    payload BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key)
);

CREATE INDEX IF NOT EXISTS idx_blobs_partition ON blobs(partition);

-- Small metadata records (cached user, timestamps, completion marker,
-- persisted preload state) as JSON values under well-known keys.
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Preload lease: at most one row. A row whose expires_at is in the past is
-- free to take.
CREATE TABLE IF NOT EXISTS preload_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;
