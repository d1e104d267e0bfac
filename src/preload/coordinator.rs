//! Foreground preload coordinator.
//!
//! Runs once per qualifying app start: decides whether a preload cycle is
//! needed, delegates to the background orchestrator when one is reachable,
//! and otherwise runs the full download sequence itself. Snapshot and
//! metadata writes happen up front so readers never wait on downloads.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

use crate::api::ResourceFetcher;
use crate::collect;
use crate::config::PreloadConfig;
use crate::model::UserData;
use crate::state::{PreloadStatus, StateChannel};
use crate::store::{BlobStore, MetaStore, Partition};

use super::cycle::{CycleOutcome, PreloadCycle};
use super::orchestrator::{OrchestratorHandle, StartReply};

/// Bounded wait for a status round-trip to the background orchestrator.
/// Past this, the orchestrator is assumed unreachable and the coordinator
/// falls back to local execution.
const STATUS_TIMEOUT: StdDuration = StdDuration::from_secs(3);

/// Why a preload was (or was not) required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadReason {
  UserChanged,
  Interrupted,
  Stale,
  Incomplete,
  Forced,
}

/// Which path the decision procedure took.
#[derive(Debug)]
pub enum PreloadDecision {
  /// Cache fresh, marker fresh, user matches: nothing to do.
  UpToDate,
  /// Work handed to the background orchestrator.
  Delegated {
    reason: PreloadReason,
    reply: StartReply,
  },
  /// No orchestrator reachable: the full sequence ran here.
  RanLocally {
    reason: PreloadReason,
    outcome: CycleOutcome,
  },
  /// Another context holds the preload lease; left it alone.
  AlreadyInProgress,
}

/// Per-run preload decision-maker.
pub struct Coordinator<F> {
  blobs: BlobStore,
  meta: MetaStore,
  channel: StateChannel,
  cycle: Arc<PreloadCycle<F>>,
  orchestrator: Option<OrchestratorHandle>,
  windows: PreloadConfig,
}

impl<F: ResourceFetcher> Coordinator<F> {
  pub fn new(
    blobs: BlobStore,
    meta: MetaStore,
    channel: StateChannel,
    cycle: PreloadCycle<F>,
    orchestrator: Option<OrchestratorHandle>,
    windows: PreloadConfig,
  ) -> Self {
    Self {
      blobs,
      meta,
      channel,
      cycle: Arc::new(cycle),
      orchestrator,
      windows,
    }
  }

  /// Decide and, if needed, run or delegate a preload for `email`.
  ///
  /// `user_data` is the payload already synced from the origin for this
  /// session; the coordinator snapshots it for offline reads whatever else
  /// happens.
  pub async fn ensure_preloaded(
    &self,
    email: &str,
    user_data: &UserData,
    force: bool,
  ) -> Result<PreloadDecision> {
    if email.trim().is_empty() {
      return Err(eyre!("Cannot preload: missing user identity"));
    }

    // Read identity state before overwriting it.
    let cached_user = self.meta.cached_user()?;
    let user_changed = cached_user.as_deref().is_some_and(|u| u != email);

    // Snapshot and metadata refresh happen before any download path so UI
    // reads are served immediately.
    self.write_snapshot(email, user_data)?;

    if user_changed {
      // The old user's completion flag means nothing for this user.
      self.meta.clear_completion_marker()?;
      info!(%email, "cached user changed, full preload required");
      return self.run_or_delegate(email, user_data, PreloadReason::UserChanged).await;
    }

    if force {
      self.meta.clear_completion_marker()?;
      return self.run_or_delegate(email, user_data, PreloadReason::Forced).await;
    }

    // A live (non-stale) loading state means an interrupted preload:
    // request a resume, which restarts the phase and re-checks presence.
    if let Some(state) = self.channel.read_active()? {
      if state.status == PreloadStatus::Loading {
        info!(%email, "interrupted preload detected, resuming");
        return self.run_or_delegate(email, user_data, PreloadReason::Interrupted).await;
      }
    }

    // Fresh cache + completion flag + matching user: nothing to do.
    let marker = self.meta.completion_marker()?;
    let refreshed_at = self.meta.cache_refreshed_at()?;
    let cache_fresh = refreshed_at.is_some_and(|t| {
      Utc::now() - t < Duration::hours(self.windows.cache_fresh_hours)
    });
    match &marker {
      Some(marker) if marker.email == email && cache_fresh => {
        return Ok(PreloadDecision::UpToDate);
      }
      Some(_) => {
        return self.run_or_delegate(email, user_data, PreloadReason::Stale).await;
      }
      None => {
        return self.run_or_delegate(email, user_data, PreloadReason::Incomplete).await;
      }
    }
  }

  /// Snapshot the payload and refresh identity/timestamp metadata.
  fn write_snapshot(&self, email: &str, user_data: &UserData) -> Result<()> {
    let payload = serde_json::to_vec(user_data)
      .map_err(|e| eyre!("Failed to serialize user snapshot: {}", e))?;
    self.blobs.put(Partition::Snapshots, email, &payload)?;
    self.meta.set_cached_user(email)?;
    self.meta.touch_cache_refreshed_at()?;
    Ok(())
  }

  async fn run_or_delegate(
    &self,
    email: &str,
    user_data: &UserData,
    reason: PreloadReason,
  ) -> Result<PreloadDecision> {
    let resources = collect::collect(&user_data.plans, &user_data.workouts);
    let nutrition_url = user_data.nutrition_url.clone();

    if let Some(handle) = self.reachable_orchestrator().await {
      let reply = handle
        .start_preload(email, resources, nutrition_url)
        .await?;
      info!(%email, ?reason, ?reply, "preload delegated to background orchestrator");
      return Ok(PreloadDecision::Delegated { reason, reply });
    }

    // No background context: run the whole sequence here, under the same
    // lease discipline the orchestrator follows.
    let owner = format!("coordinator-{}", std::process::id());
    if !self
      .meta
      .try_acquire_lease(&owner, Duration::minutes(super::LEASE_TTL_MINS))?
    {
      info!(%email, "preload lease held elsewhere, not starting a second cycle");
      return Ok(PreloadDecision::AlreadyInProgress);
    }

    info!(%email, ?reason, "no background orchestrator, running preload locally");
    let outcome = self
      .cycle
      .run(email, &resources, nutrition_url.as_deref())
      .await;
    if let Err(e) = self.meta.release_lease(&owner) {
      warn!("cannot release preload lease: {}", e);
    }
    Ok(PreloadDecision::RanLocally {
      reason,
      outcome: outcome?,
    })
  }

  /// The orchestrator counts as available only if it answers a status
  /// round-trip within the bounded wait.
  async fn reachable_orchestrator(&self) -> Option<&OrchestratorHandle> {
    let handle = self.orchestrator.as_ref()?;
    match tokio::time::timeout(STATUS_TIMEOUT, handle.check_status()).await {
      Ok(Ok(_)) => Some(handle),
      Ok(Err(e)) => {
        warn!("orchestrator unreachable: {}", e);
        None
      }
      Err(_) => {
        warn!("orchestrator status check timed out");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collect::APP_IMAGES;
  use crate::model::{Exercise, Plan, Workout};
  use crate::preload::spawn_orchestrator;
  use crate::state::{PreloadPhase, PreloadState};
  use crate::store::{CacheDb, CompletionMarker};
  use futures::future::BoxFuture;
  use std::collections::BTreeMap;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Default)]
  struct CountingFetcher {
    fetches: AtomicU32,
  }

  impl ResourceFetcher for CountingFetcher {
    fn fetch_image<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
      Box::pin(async move {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(b"img".to_vec())
      })
    }

    fn fetch_speech<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
      Box::pin(async move {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(b"aud".to_vec())
      })
    }

    fn fetch_document<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
      Box::pin(async move {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(b"doc".to_vec())
      })
    }
  }

  struct Rig {
    coordinator: Coordinator<CountingFetcher>,
    meta: MetaStore,
    blobs: BlobStore,
    channel: StateChannel,
  }

  fn rig(with_orchestrator: bool) -> Rig {
    let db = CacheDb::open_in_memory().unwrap();
    let blobs = BlobStore::new(db.clone());
    let meta = MetaStore::new(db);
    let channel = StateChannel::new(meta.clone());
    let fetcher = Arc::new(CountingFetcher::default());

    let orchestrator = if with_orchestrator {
      let cycle = PreloadCycle::new(
        blobs.clone(),
        meta.clone(),
        channel.clone(),
        Arc::clone(&fetcher),
      );
      Some(spawn_orchestrator(cycle, meta.clone(), channel.clone()))
    } else {
      None
    };

    let cycle = PreloadCycle::new(
      blobs.clone(),
      meta.clone(),
      channel.clone(),
      Arc::clone(&fetcher),
    );
    let coordinator = Coordinator::new(
      blobs.clone(),
      meta.clone(),
      channel.clone(),
      cycle,
      orchestrator,
      PreloadConfig::default(),
    );

    Rig {
      coordinator,
      meta,
      blobs,
      channel,
    }
  }

  fn user_data(email: &str) -> UserData {
    let mut workouts = BTreeMap::new();
    workouts.insert(
      "push".to_string(),
      Workout::Muscle {
        name: "push".to_string(),
        exercises: vec![Exercise {
          name: "Bench Press".to_string(),
          image: Some("https://cdn.example.com/bench.png".to_string()),
          extra: BTreeMap::new(),
        }],
      },
    );
    UserData {
      email: email.to_string(),
      plans: vec![Plan {
        name: "Beginner".to_string(),
        workouts: vec!["push".to_string()],
      }],
      workouts,
      nutrition_url: Some("https://cdn.example.com/diet.pdf".to_string()),
      progress: BTreeMap::new(),
    }
  }

  #[tokio::test]
  async fn test_local_fallback_fills_every_store() {
    let rig = rig(false);
    let data = user_data("alice@example.com");

    let decision = rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, false)
      .await
      .unwrap();

    match decision {
      PreloadDecision::RanLocally { reason, outcome } => {
        assert_eq!(reason, PreloadReason::Incomplete);
        assert!(matches!(outcome, CycleOutcome::Complete { .. }));
      }
      other => panic!("expected local run, got {:?}", other),
    }

    // Everything the user needs is in the blob store after the call
    assert!(rig
      .blobs
      .contains(Partition::Images, "https://cdn.example.com/bench.png")
      .unwrap());
    assert!(rig
      .blobs
      .contains(Partition::Images, APP_IMAGES[0])
      .unwrap());
    assert!(rig
      .blobs
      .contains(Partition::Nutrition, "https://cdn.example.com/diet.pdf")
      .unwrap());
    assert!(rig.blobs.count(Partition::Audio).unwrap() > 0);
    assert!(rig
      .blobs
      .contains(Partition::Snapshots, "alice@example.com")
      .unwrap());
  }

  #[tokio::test]
  async fn test_fresh_cache_is_up_to_date() {
    let rig = rig(false);
    let data = user_data("alice@example.com");

    rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, false)
      .await
      .unwrap();

    let decision = rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, false)
      .await
      .unwrap();
    assert!(matches!(decision, PreloadDecision::UpToDate));
  }

  #[tokio::test]
  async fn test_user_switch_invalidates_marker() {
    let rig = rig(false);

    rig
      .coordinator
      .ensure_preloaded("alice@example.com", &user_data("alice@example.com"), false)
      .await
      .unwrap();
    assert!(rig.meta.completion_marker().unwrap().is_some());

    // Bob logs in: even a fresh marker must not be trusted
    let decision = rig
      .coordinator
      .ensure_preloaded("bob@example.com", &user_data("bob@example.com"), false)
      .await
      .unwrap();

    match decision {
      PreloadDecision::RanLocally { reason, .. } => {
        assert_eq!(reason, PreloadReason::UserChanged)
      }
      other => panic!("expected local run, got {:?}", other),
    }
    let marker = rig.meta.completion_marker().unwrap().unwrap();
    assert_eq!(marker.email, "bob@example.com");
  }

  #[tokio::test]
  async fn test_stale_loading_state_is_not_resumed() {
    let rig = rig(false);
    let data = user_data("alice@example.com");

    // Complete once so freshness would normally short-circuit
    rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, false)
      .await
      .unwrap();

    // Persist an abandoned loading state (31s old against a 30s window)
    let mut state = PreloadState::new(
      crate::state::PreloadStatus::Loading,
      PreloadPhase::Images,
      1,
      10,
    );
    state.timestamp = Utc::now() - Duration::seconds(31);
    rig.channel.publish(state).unwrap();

    let decision = rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, false)
      .await
      .unwrap();

    // The stale state is ignored, not treated as an active preload
    assert!(matches!(decision, PreloadDecision::UpToDate));
  }

  #[tokio::test]
  async fn test_live_loading_state_triggers_resume() {
    let rig = rig(false);
    let data = user_data("alice@example.com");

    rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, false)
      .await
      .unwrap();

    rig
      .channel
      .publish(PreloadState::new(
        crate::state::PreloadStatus::Loading,
        PreloadPhase::Audio,
        2,
        10,
      ))
      .unwrap();

    let decision = rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, false)
      .await
      .unwrap();

    match decision {
      PreloadDecision::RanLocally { reason, .. } => {
        assert_eq!(reason, PreloadReason::Interrupted)
      }
      other => panic!("expected resume, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_forced_refresh_ignores_freshness() {
    let rig = rig(false);
    let data = user_data("alice@example.com");

    rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, false)
      .await
      .unwrap();

    let decision = rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, true)
      .await
      .unwrap();

    match decision {
      PreloadDecision::RanLocally { reason, outcome } => {
        assert_eq!(reason, PreloadReason::Forced);
        // Blobs are already present, so the forced pass re-checks presence
        // without re-downloading
        assert!(matches!(
          outcome,
          CycleOutcome::Complete {
            images_loaded: 0,
            ..
          }
        ));
      }
      other => panic!("expected forced local run, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_delegates_when_orchestrator_reachable() {
    let rig = rig(true);
    let data = user_data("alice@example.com");

    let decision = rig
      .coordinator
      .ensure_preloaded("alice@example.com", &data, false)
      .await
      .unwrap();

    match decision {
      PreloadDecision::Delegated { reply, .. } => {
        assert_eq!(reply, StartReply::Started);
      }
      other => panic!("expected delegation, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_foreign_lease_blocks_local_run() {
    let rig = rig(false);
    rig
      .meta
      .try_acquire_lease("some-other-context", Duration::minutes(5))
      .unwrap();

    let decision = rig
      .coordinator
      .ensure_preloaded("alice@example.com", &user_data("alice@example.com"), false)
      .await
      .unwrap();

    assert!(matches!(decision, PreloadDecision::AlreadyInProgress));
    // The snapshot was still refreshed before the lease check
    assert!(rig
      .blobs
      .contains(Partition::Snapshots, "alice@example.com")
      .unwrap());
  }

  #[tokio::test]
  async fn test_empty_email_rejected_without_side_effects() {
    let rig = rig(false);
    let err = rig
      .coordinator
      .ensure_preloaded("", &user_data(""), false)
      .await
      .unwrap_err();
    assert!(err.to_string().contains("missing user identity"));
    assert!(rig.meta.cached_user().unwrap().is_none());
  }
}
