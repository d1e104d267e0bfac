//! Durable storage for the offline cache.
//!
//! One sqlite database backs everything: large binary payloads in named
//! partitions (`BlobStore`), and small metadata records (cached user,
//! timestamps, completion marker, persisted preload state, preload lease)
//! via `MetaStore`. The two stores share a connection but are logically
//! distinct; each subsystem writes only its own keys.

mod blob;
mod meta;
mod schema;

pub use blob::{BlobRecord, BlobStore, Partition};
pub use meta::{CompletionMarker, MetaStore, PreloadLease};

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared handle to the cache database.
///
/// Opening is idempotent: migrations use `CREATE TABLE IF NOT EXISTS`, so
/// partitions survive schema version bumps that do not touch them.
#[derive(Clone)]
pub struct CacheDb {
  conn: Arc<Mutex<Connection>>,
}

impl CacheDb {
  /// Open or create the database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the database at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// In-memory database for tests.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory db: {}", e))?;
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Default database path under the platform data dir.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fitsync").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  pub(crate) fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}
