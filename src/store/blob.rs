//! Blob store: keyed binary payloads in fixed named partitions.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;

use super::CacheDb;

/// Fixed logical partitions of the blob store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
  /// Exercise and app images, keyed by raw URL.
  Images,
  /// Synthesized speech clips, keyed by `tts:<sha256 of text>`.
  Audio,
  /// Nutrition documents, keyed by URL.
  Nutrition,
  /// Per-user payload snapshots, keyed by email.
  Snapshots,
  /// Per-plan progress records, keyed by plan name.
  Progress,
}

impl Partition {
  pub fn as_str(&self) -> &'static str {
    match self {
      Partition::Images => "images",
      Partition::Audio => "audio",
      Partition::Nutrition => "nutrition",
      Partition::Snapshots => "snapshots",
      Partition::Progress => "progress",
    }
  }
}

/// One stored blob.
#[derive(Debug, Clone)]
pub struct BlobRecord {
  pub key: String,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

/// Keyed binary persistence over the shared cache database.
#[derive(Clone)]
pub struct BlobStore {
  db: CacheDb,
}

impl BlobStore {
  pub fn new(db: CacheDb) -> Self {
    Self { db }
  }

  /// Persist a payload under its key, overwriting any existing entry.
  pub fn put(&self, partition: Partition, key: &str, payload: &[u8]) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO blobs (partition, key, payload, stored_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![partition.as_str(), key, payload],
      )
      .map_err(|e| eyre!("Failed to store blob {}/{}: {}", partition.as_str(), key, e))?;
    Ok(())
  }

  /// Look up one blob. `Ok(None)` means not cached.
  pub fn get(&self, partition: Partition, key: &str) -> Result<Option<BlobRecord>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT payload, stored_at FROM blobs WHERE partition = ? AND key = ?")
      .map_err(|e| eyre!("Failed to prepare blob query: {}", e))?;

    let row: Option<(Vec<u8>, String)> = stmt
      .query_row(params![partition.as_str(), key], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .ok();

    match row {
      Some((payload, stored_at)) => Ok(Some(BlobRecord {
        key: key.to_string(),
        payload,
        stored_at: parse_datetime(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  /// Cheap presence check, used by the per-item idempotence guard.
  pub fn contains(&self, partition: Partition, key: &str) -> Result<bool> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT 1 FROM blobs WHERE partition = ? AND key = ?")
      .map_err(|e| eyre!("Failed to prepare blob query: {}", e))?;
    let found = stmt
      .query_row(params![partition.as_str(), key], |_| Ok(()))
      .is_ok();
    Ok(found)
  }

  /// Enumerate every record in a partition, ordered by key.
  pub fn get_all(&self, partition: Partition) -> Result<Vec<BlobRecord>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT key, payload, stored_at FROM blobs WHERE partition = ? ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare blob enumeration: {}", e))?;

    let rows = stmt
      .query_map(params![partition.as_str()], |row| {
        let key: String = row.get(0)?;
        let payload: Vec<u8> = row.get(1)?;
        let stored_at: String = row.get(2)?;
        Ok((key, payload, stored_at))
      })
      .map_err(|e| eyre!("Failed to enumerate blobs: {}", e))?;

    let mut records = Vec::new();
    for row in rows {
      let (key, payload, stored_at) = row.map_err(|e| eyre!("Failed to read blob row: {}", e))?;
      records.push(BlobRecord {
        key,
        payload,
        stored_at: parse_datetime(&stored_at)?,
      });
    }
    Ok(records)
  }

  /// Number of records in a partition.
  pub fn count(&self, partition: Partition) -> Result<u32> {
    let conn = self.db.lock()?;
    let count: u32 = conn
      .query_row(
        "SELECT COUNT(*) FROM blobs WHERE partition = ?",
        params![partition.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count blobs: {}", e))?;
    Ok(count)
  }

  /// Remove every entry in a partition.
  pub fn clear(&self, partition: Partition) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "DELETE FROM blobs WHERE partition = ?",
        params![partition.as_str()],
      )
      .map_err(|e| eyre!("Failed to clear partition {}: {}", partition.as_str(), e))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> BlobStore {
    BlobStore::new(CacheDb::open_in_memory().unwrap())
  }

  #[test]
  fn test_put_get_roundtrip() {
    let store = store();
    store
      .put(Partition::Images, "https://cdn.example.com/a.png", b"png-bytes")
      .unwrap();

    let rec = store
      .get(Partition::Images, "https://cdn.example.com/a.png")
      .unwrap()
      .unwrap();
    assert_eq!(rec.payload, b"png-bytes");
  }

  #[test]
  fn test_put_overwrites_existing_key() {
    let store = store();
    store.put(Partition::Audio, "tts:abc", b"v1").unwrap();
    store.put(Partition::Audio, "tts:abc", b"v2").unwrap();

    let rec = store.get(Partition::Audio, "tts:abc").unwrap().unwrap();
    assert_eq!(rec.payload, b"v2");
    assert_eq!(store.count(Partition::Audio).unwrap(), 1);
  }

  #[test]
  fn test_partitions_are_isolated() {
    let store = store();
    store.put(Partition::Images, "k", b"img").unwrap();
    store.put(Partition::Audio, "k", b"aud").unwrap();

    assert_eq!(
      store.get(Partition::Images, "k").unwrap().unwrap().payload,
      b"img"
    );
    assert_eq!(
      store.get(Partition::Audio, "k").unwrap().unwrap().payload,
      b"aud"
    );

    store.clear(Partition::Images).unwrap();
    assert!(store.get(Partition::Images, "k").unwrap().is_none());
    assert!(store.contains(Partition::Audio, "k").unwrap());
  }

  #[test]
  fn test_get_all_ordered_by_key() {
    let store = store();
    store.put(Partition::Nutrition, "b", b"2").unwrap();
    store.put(Partition::Nutrition, "a", b"1").unwrap();

    let all = store.get_all(Partition::Nutrition).unwrap();
    let keys: Vec<&str> = all.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b"]);
  }

  #[test]
  fn test_open_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    let db = CacheDb::open_at(&path).unwrap();
    BlobStore::new(db).put(Partition::Images, "k", b"v").unwrap();

    // Re-opening must not disturb existing partitions
    let db2 = CacheDb::open_at(&path).unwrap();
    let rec = BlobStore::new(db2).get(Partition::Images, "k").unwrap();
    assert!(rec.is_some());
  }
}
