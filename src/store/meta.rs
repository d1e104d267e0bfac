//! Metadata store: small persisted records under well-known keys, plus the
//! preload lease.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::CacheDb;

/// Well-known metadata keys.
const KEY_CACHED_USER: &str = "cached_user";
const KEY_CACHE_REFRESHED_AT: &str = "cache_refreshed_at";
const KEY_COMPLETION_MARKER: &str = "completion_marker";
const KEY_PRELOAD_STATE: &str = "preload_state";

/// Durable record of the last successful full preload on this device.
///
/// At most one marker is current; a marker for a different email than the
/// active session is not applicable and forces a fresh preload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
  pub email: String,
  pub completed_at: DateTime<Utc>,
  pub images_loaded: u32,
  pub audio_loaded: u32,
}

/// Held lease over the preload cycle. An expired lease is free to take.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadLease {
  pub owner: String,
  pub expires_at: DateTime<Utc>,
}

/// Typed access to metadata records. Shares the blob store's database but
/// owns a distinct table and distinct keys.
#[derive(Clone)]
pub struct MetaStore {
  db: CacheDb,
}

impl MetaStore {
  pub fn new(db: CacheDb) -> Self {
    Self { db }
  }

  /// Store a JSON-serializable value under a key, overwriting.
  pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let json =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO meta (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, json],
      )
      .map_err(|e| eyre!("Failed to store meta {}: {}", key, e))?;
    Ok(())
  }

  /// Read a value back, `Ok(None)` if absent.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT value FROM meta WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare meta query: {}", e))?;

    let json: Option<String> = stmt.query_row(params![key], |row| row.get(0)).ok();
    match json {
      Some(json) => {
        let value =
          serde_json::from_str(&json).map_err(|e| eyre!("Failed to parse meta {}: {}", key, e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  /// Remove one record.
  pub fn remove(&self, key: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM meta WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove meta {}: {}", key, e))?;
    Ok(())
  }

  /// Remove every metadata record and the lease.
  pub fn clear(&self) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM meta", [])
      .map_err(|e| eyre!("Failed to clear meta: {}", e))?;
    conn
      .execute("DELETE FROM preload_lease", [])
      .map_err(|e| eyre!("Failed to clear lease: {}", e))?;
    Ok(())
  }

  // Typed helpers over the well-known keys.

  pub fn cached_user(&self) -> Result<Option<String>> {
    self.get(KEY_CACHED_USER)
  }

  pub fn set_cached_user(&self, email: &str) -> Result<()> {
    self.set(KEY_CACHED_USER, &email)
  }

  pub fn cache_refreshed_at(&self) -> Result<Option<DateTime<Utc>>> {
    self.get(KEY_CACHE_REFRESHED_AT)
  }

  pub fn touch_cache_refreshed_at(&self) -> Result<()> {
    self.set(KEY_CACHE_REFRESHED_AT, &Utc::now())
  }

  pub fn completion_marker(&self) -> Result<Option<CompletionMarker>> {
    self.get(KEY_COMPLETION_MARKER)
  }

  pub fn set_completion_marker(&self, marker: &CompletionMarker) -> Result<()> {
    self.set(KEY_COMPLETION_MARKER, marker)
  }

  pub fn clear_completion_marker(&self) -> Result<()> {
    self.remove(KEY_COMPLETION_MARKER)
  }

  /// Raw persisted preload state record. The state channel owns the shape;
  /// the metadata store only round-trips JSON.
  pub fn preload_state<T: DeserializeOwned>(&self) -> Result<Option<T>> {
    self.get(KEY_PRELOAD_STATE)
  }

  pub fn set_preload_state<T: Serialize>(&self, state: &T) -> Result<()> {
    self.set(KEY_PRELOAD_STATE, state)
  }

  pub fn clear_preload_state(&self) -> Result<()> {
    self.remove(KEY_PRELOAD_STATE)
  }

  // Lease operations.

  /// Try to take (or re-take) the preload lease.
  ///
  /// Succeeds when no lease exists, the existing lease has expired, or the
  /// existing lease already belongs to `owner` (renewal).
  pub fn try_acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool> {
    let conn = self.db.lock()?;
    let now = Utc::now();

    let current: Option<(String, String)> = conn
      .query_row("SELECT owner, expires_at FROM preload_lease WHERE id = 1", [], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .ok();

    if let Some((held_by, expires_at)) = current {
      let expires_at = expires_at
        .parse::<DateTime<Utc>>()
        .map_err(|e| eyre!("Failed to parse lease expiry: {}", e))?;
      if held_by != owner && expires_at > now {
        return Ok(false);
      }
    }

    let expires_at = now + ttl;
    conn
      .execute(
        "INSERT OR REPLACE INTO preload_lease (id, owner, expires_at) VALUES (1, ?, ?)",
        params![owner, expires_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to write lease: {}", e))?;
    Ok(true)
  }

  /// Current lease if one exists (expired or not).
  pub fn lease(&self) -> Result<Option<PreloadLease>> {
    let conn = self.db.lock()?;
    let row: Option<(String, String)> = conn
      .query_row("SELECT owner, expires_at FROM preload_lease WHERE id = 1", [], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .ok();

    match row {
      Some((owner, expires_at)) => Ok(Some(PreloadLease {
        owner,
        expires_at: expires_at
          .parse::<DateTime<Utc>>()
          .map_err(|e| eyre!("Failed to parse lease expiry: {}", e))?,
      })),
      None => Ok(None),
    }
  }

  /// Release the lease if `owner` holds it.
  pub fn release_lease(&self, owner: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM preload_lease WHERE owner = ?", params![owner])
      .map_err(|e| eyre!("Failed to release lease: {}", e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> MetaStore {
    MetaStore::new(CacheDb::open_in_memory().unwrap())
  }

  #[test]
  fn test_completion_marker_roundtrip() {
    let store = store();
    assert!(store.completion_marker().unwrap().is_none());

    let marker = CompletionMarker {
      email: "alice@example.com".to_string(),
      completed_at: Utc::now(),
      images_loaded: 42,
      audio_loaded: 17,
    };
    store.set_completion_marker(&marker).unwrap();

    let got = store.completion_marker().unwrap().unwrap();
    assert_eq!(got.email, "alice@example.com");
    assert_eq!(got.images_loaded, 42);
  }

  #[test]
  fn test_cached_user_overwrite() {
    let store = store();
    store.set_cached_user("alice@example.com").unwrap();
    store.set_cached_user("bob@example.com").unwrap();
    assert_eq!(
      store.cached_user().unwrap().as_deref(),
      Some("bob@example.com")
    );
  }

  #[test]
  fn test_lease_blocks_other_owner_until_expiry() {
    let store = store();
    assert!(store
      .try_acquire_lease("ctx-a", Duration::minutes(5))
      .unwrap());

    // Live lease held by someone else
    assert!(!store
      .try_acquire_lease("ctx-b", Duration::minutes(5))
      .unwrap());

    // Same owner may renew
    assert!(store
      .try_acquire_lease("ctx-a", Duration::minutes(5))
      .unwrap());
  }

  #[test]
  fn test_expired_lease_is_free_to_take() {
    let store = store();
    assert!(store
      .try_acquire_lease("ctx-a", Duration::seconds(-1))
      .unwrap());
    assert!(store
      .try_acquire_lease("ctx-b", Duration::minutes(5))
      .unwrap());
    assert_eq!(store.lease().unwrap().unwrap().owner, "ctx-b");
  }

  #[test]
  fn test_release_only_removes_own_lease() {
    let store = store();
    store
      .try_acquire_lease("ctx-a", Duration::minutes(5))
      .unwrap();

    store.release_lease("ctx-b").unwrap();
    assert!(store.lease().unwrap().is_some());

    store.release_lease("ctx-a").unwrap();
    assert!(store.lease().unwrap().is_none());
  }

  #[test]
  fn test_clear_removes_everything() {
    let store = store();
    store.set_cached_user("alice@example.com").unwrap();
    store
      .try_acquire_lease("ctx-a", Duration::minutes(5))
      .unwrap();

    store.clear().unwrap();
    assert!(store.cached_user().unwrap().is_none());
    assert!(store.lease().unwrap().is_none());
  }
}
