//! Preload state channel: the single shared progress record, broadcast to
//! every observer.
//!
//! The active preloader is the sole writer; everyone else only observes.
//! In-process observers get push notifications through a `watch` channel at
//! every `publish`. Observers in other processes see only the persisted
//! record, so a polling fallback re-reads it on a fixed interval and
//! re-emits locally when the value changes underneath us.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::store::MetaStore;

/// A `loading` state older than this is abandoned (crashed preloader) and
/// must not be shown as active progress.
pub const STATE_STALE_SECS: i64 = 30;

/// Polling fallback interval for updates that arrive outside this process.
pub const POLL_INTERVAL: StdDuration = StdDuration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadStatus {
  Idle,
  Loading,
  Complete,
  Error,
}

/// Phase label. Free-form by contract; these are the phases the engine
/// itself emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreloadPhase {
  Init,
  Checking,
  Images,
  Audio,
  Nutrition,
  UserData,
}

/// The shared progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreloadState {
  pub status: PreloadStatus,
  pub phase: PreloadPhase,
  pub current: u32,
  pub total: u32,
  pub percent: u32,
  pub timestamp: DateTime<Utc>,
}

impl PreloadState {
  pub fn new(status: PreloadStatus, phase: PreloadPhase, current: u32, total: u32) -> Self {
    let percent = if total == 0 {
      0
    } else {
      (current * 100) / total
    };
    Self {
      status,
      phase,
      current,
      total,
      percent,
      timestamp: Utc::now(),
    }
  }

  /// A loading state whose timestamp predates now by more than the stale
  /// window belongs to a crashed preloader.
  pub fn is_stale(&self) -> bool {
    self.status == PreloadStatus::Loading
      && Utc::now() - self.timestamp > Duration::seconds(STATE_STALE_SECS)
  }
}

/// Publishes and observes the shared preload state.
#[derive(Clone)]
pub struct StateChannel {
  meta: MetaStore,
  tx: watch::Sender<Option<PreloadState>>,
}

impl StateChannel {
  pub fn new(meta: MetaStore) -> Self {
    let initial = meta.preload_state().ok().flatten();
    let (tx, _rx) = watch::channel(initial);
    Self { meta, tx }
  }

  /// Persist the state and notify in-process subscribers.
  pub fn publish(&self, state: PreloadState) -> Result<()> {
    self.meta.set_preload_state(&state)?;
    // No subscribers is fine
    let _ = self.tx.send(Some(state));
    Ok(())
  }

  /// Last persisted state, stale or not.
  pub fn read(&self) -> Result<Option<PreloadState>> {
    self.meta.preload_state()
  }

  /// Last persisted state, with abandoned loading states filtered out.
  pub fn read_active(&self) -> Result<Option<PreloadState>> {
    match self.read()? {
      Some(state) if state.is_stale() => Ok(None),
      other => Ok(other),
    }
  }

  /// Remove the persisted record and notify subscribers.
  pub fn clear(&self) -> Result<()> {
    self.meta.clear_preload_state()?;
    let _ = self.tx.send(None);
    Ok(())
  }

  /// Subscribe to in-process state change notifications.
  pub fn subscribe(&self) -> watch::Receiver<Option<PreloadState>> {
    self.tx.subscribe()
  }

  /// Spawn the polling fallback: re-read the persisted record every
  /// `POLL_INTERVAL` and re-emit when it differs by value from the last
  /// snapshot pushed on the watch channel. Covers writers in other
  /// processes sharing the database.
  pub fn spawn_poller(&self) -> JoinHandle<()> {
    let meta = self.meta.clone();
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(POLL_INTERVAL);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        interval.tick().await;
        let persisted: Option<PreloadState> = match meta.preload_state() {
          Ok(state) => state,
          Err(e) => {
            tracing::debug!("state poll failed: {}", e);
            continue;
          }
        };
        let changed = {
          let last = tx.borrow();
          *last != persisted
        };
        if changed && tx.send(persisted).is_err() {
          break;
        }
      }
    })
  }
}
