//! Session cache for the full server payload and per-plan progress.
//!
//! The in-memory copy serves repeat reads within a short window so a
//! browsing session does not hammer the origin. When the network is down,
//! the last good copy is served instead (memory first, then the persisted
//! snapshot), annotated with where it came from. Progress writes land
//! locally first and sync to the origin in the background; local state is
//! authoritative for this device until a sync succeeds.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::model::{PlanProgress, UserData};
use crate::store::{BlobStore, Partition};

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// In-memory session copy, still fresh
  CacheFresh,
  /// Network failed; served the session copy past its freshness window
  CacheStale,
  /// Network failed; served the persisted snapshot
  Offline,
}

/// Served payload plus provenance.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  pub cached_at: Option<DateTime<Utc>>,
}

struct SessionSnapshot {
  data: UserData,
  fetched_at: Instant,
}

/// Short-lived cache of one user's payload plus plan progress records.
pub struct SessionCache {
  blobs: BlobStore,
  snapshot: Mutex<Option<SessionSnapshot>>,
  fresh_for: Duration,
}

impl SessionCache {
  pub fn new(blobs: BlobStore) -> Self {
    Self {
      blobs,
      snapshot: Mutex::new(None),
      fresh_for: Duration::from_secs(5 * 60),
    }
  }

  /// Override the session freshness window.
  pub fn with_fresh_for(mut self, fresh_for: Duration) -> Self {
    self.fresh_for = fresh_for;
    self
  }

  /// Get the full payload for `email`.
  ///
  /// 1. Session copy under the freshness window (unless `force_refresh`)
  /// 2. Network fetch, persisting a snapshot on success
  /// 3. On fetch failure: stale session copy, then persisted snapshot
  pub async fn get_user_data<F, Fut>(
    &self,
    email: &str,
    force_refresh: bool,
    fetcher: F,
  ) -> Result<CacheResult<UserData>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<UserData>>,
  {
    if !force_refresh {
      let guard = self.lock_snapshot()?;
      if let Some(snap) = guard.as_ref() {
        if snap.fetched_at.elapsed() < self.fresh_for {
          return Ok(CacheResult {
            data: snap.data.clone(),
            source: CacheSource::CacheFresh,
            cached_at: None,
          });
        }
      }
    }

    match fetcher().await {
      Ok(data) => {
        self.persist_snapshot(email, &data)?;
        *self.lock_snapshot()? = Some(SessionSnapshot {
          data: data.clone(),
          fetched_at: Instant::now(),
        });
        Ok(CacheResult {
          data,
          source: CacheSource::Network,
          cached_at: None,
        })
      }
      Err(e) => {
        // Stale-but-available beats unavailable
        if let Some(snap) = self.lock_snapshot()?.as_ref() {
          warn!("user data fetch failed, serving stale session copy: {}", e);
          return Ok(CacheResult {
            data: snap.data.clone(),
            source: CacheSource::CacheStale,
            cached_at: None,
          });
        }
        if let Some(rec) = self.blobs.get(Partition::Snapshots, email)? {
          warn!("user data fetch failed, serving persisted snapshot: {}", e);
          let data: UserData = serde_json::from_slice(&rec.payload)
            .map_err(|e| eyre!("Failed to parse persisted snapshot: {}", e))?;
          return Ok(CacheResult {
            data,
            source: CacheSource::Offline,
            cached_at: Some(rec.stored_at),
          });
        }
        Err(e)
      }
    }
  }

  /// Read the locally recorded progress for a plan.
  pub fn plan_progress(&self, plan: &str) -> Result<Option<PlanProgress>> {
    match self.blobs.get(Partition::Progress, plan)? {
      Some(rec) => {
        let progress = serde_json::from_slice(&rec.payload)
          .map_err(|e| eyre!("Failed to parse progress for {}: {}", plan, e))?;
        Ok(Some(progress))
      }
      None => Ok(None),
    }
  }

  /// Record progress for a plan: local write first, then a background sync
  /// to the origin. Sync failures are logged, never surfaced; local state
  /// stays authoritative until the next successful sync. The returned handle
  /// lets short-lived callers wait out the sync before exiting.
  pub fn save_plan_progress<Fut>(
    &self,
    plan: &str,
    progress: &PlanProgress,
    sync: Fut,
  ) -> Result<tokio::task::JoinHandle<()>>
  where
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let payload = serde_json::to_vec(progress)
      .map_err(|e| eyre!("Failed to serialize progress for {}: {}", plan, e))?;
    self.blobs.put(Partition::Progress, plan, &payload)?;

    let plan = plan.to_string();
    Ok(tokio::spawn(async move {
      match sync.await {
        Ok(()) => debug!(%plan, "plan progress synced"),
        Err(e) => warn!(%plan, "plan progress sync failed, will retry next save: {}", e),
      }
    }))
  }

  fn persist_snapshot(&self, email: &str, data: &UserData) -> Result<()> {
    let payload = serde_json::to_vec(data)
      .map_err(|e| eyre!("Failed to serialize user snapshot: {}", e))?;
    self.blobs.put(Partition::Snapshots, email, &payload)
  }

  fn lock_snapshot(&self) -> Result<std::sync::MutexGuard<'_, Option<SessionSnapshot>>> {
    self
      .snapshot
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}
