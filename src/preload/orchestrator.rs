//! Background preload orchestrator.
//!
//! Runs as a long-lived task decoupled from any foreground caller. Commands
//! arrive over an mpsc channel; progress leaves through the state channel;
//! replies come back on oneshot channels. The in-flight flag and the abort
//! flag are instance state, so independent orchestrators can be tested in
//! isolation.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::api::ResourceFetcher;
use crate::collect::ResourceSet;
use crate::state::{PreloadPhase, PreloadState, PreloadStatus, StateChannel};
use crate::store::MetaStore;

use super::cycle::{CycleOutcome, PreloadCycle};
use super::{Command, LEASE_TTL_MINS};

/// Immediate reply to a start command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartReply {
  /// Cycle accepted and running in the background.
  Started,
  /// A cycle is already running (here or, per the lease, elsewhere).
  AlreadyRunning,
  /// Fresh completion marker for this user; nothing to do.
  AlreadyComplete { age_days: i64 },
  /// Invalid request, no side effects.
  Rejected { message: String },
}

/// Reply to a status check.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReply {
  pub running: bool,
  pub state: Option<PreloadState>,
}

/// Foreground-side handle to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
  tx: mpsc::UnboundedSender<Command>,
}

impl OrchestratorHandle {
  /// Request a preload cycle. Resolves as soon as the orchestrator has
  /// decided; the download itself continues in the background.
  pub async fn start_preload(
    &self,
    email: &str,
    resources: ResourceSet,
    nutrition_url: Option<String>,
  ) -> Result<StartReply> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Start {
        email: email.to_string(),
        resources,
        nutrition_url,
        reply,
      })
      .map_err(|_| eyre!("Orchestrator is gone"))?;
    rx.await.map_err(|_| eyre!("Orchestrator dropped the reply"))
  }

  /// Ask whether a cycle is in flight. Callers should wrap this in a
  /// bounded wait and treat a timeout as "orchestrator unavailable".
  pub async fn check_status(&self) -> Result<StatusReply> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::CheckStatus { reply })
      .map_err(|_| eyre!("Orchestrator is gone"))?;
    rx.await.map_err(|_| eyre!("Orchestrator dropped the reply"))
  }

  /// Raise the cooperative abort flag. Best-effort: the in-flight item
  /// finishes, later items are dropped.
  pub fn abort(&self) {
    let _ = self.tx.send(Command::Abort);
  }
}

/// Spawn the orchestrator task. The handle is cheap to clone; the task
/// exits when every handle is dropped.
pub fn spawn_orchestrator<F: ResourceFetcher + 'static>(
  cycle: PreloadCycle<F>,
  meta: MetaStore,
  channel: StateChannel,
) -> OrchestratorHandle {
  let (tx, rx) = mpsc::unbounded_channel();
  let owner = format!("orchestrator-{}", std::process::id());
  tokio::spawn(run(cycle, meta, channel, rx, owner));
  OrchestratorHandle { tx }
}

async fn run<F: ResourceFetcher + 'static>(
  cycle: PreloadCycle<F>,
  meta: MetaStore,
  channel: StateChannel,
  mut rx: mpsc::UnboundedReceiver<Command>,
  owner: String,
) {
  let cycle = Arc::new(cycle);
  let abort = cycle.abort_flag();
  let mut running: Option<tokio::task::JoinHandle<()>> = None;

  loop {
    tokio::select! {
      cmd = rx.recv() => {
        let cmd = match cmd {
          Some(cmd) => cmd,
          None => break,
        };
        match cmd {
          Command::Start { email, resources, nutrition_url, reply } => {
            let decision = handle_start(
              &cycle, &meta, &owner, &mut running, email, resources, nutrition_url,
            );
            let _ = reply.send(decision);
          }
          Command::CheckStatus { reply } => {
            let _ = reply.send(StatusReply {
              running: running.is_some(),
              state: channel.read_active().unwrap_or(None),
            });
          }
          Command::Abort => {
            if running.is_some() {
              info!("abort requested");
              abort.store(true, Ordering::Relaxed);
            }
          }
        }
      }
      _ = wait_for(&mut running), if running.is_some() => {
        running = None;
      }
    }
  }

  // Handles all dropped: stop any in-flight cycle cooperatively.
  abort.store(true, Ordering::Relaxed);
}

async fn wait_for(running: &mut Option<tokio::task::JoinHandle<()>>) {
  if let Some(handle) = running {
    let _ = handle.await;
  }
}

fn handle_start<F: ResourceFetcher + 'static>(
  cycle: &Arc<PreloadCycle<F>>,
  meta: &MetaStore,
  owner: &str,
  running: &mut Option<tokio::task::JoinHandle<()>>,
  email: String,
  resources: ResourceSet,
  nutrition_url: Option<String>,
) -> StartReply {
  if email.trim().is_empty() {
    return StartReply::Rejected {
      message: "missing user identity".to_string(),
    };
  }

  // Re-entrant start while running is a no-op, not a queued second run.
  if running.is_some() {
    return StartReply::AlreadyRunning;
  }

  // Fresh marker check happens before taking the lease so a repeat start
  // costs nothing.
  match fresh_marker_age(cycle, meta, &email) {
    Ok(Some(age_days)) => return StartReply::AlreadyComplete { age_days },
    Ok(None) => {}
    Err(e) => {
      // Store unreadable at the very start: cycle-level error
      error!("cannot read completion marker: {}", e);
      return StartReply::Rejected {
        message: format!("store failure: {}", e),
      };
    }
  }

  // The lease closes the race with preloaders in other processes.
  match meta.try_acquire_lease(owner, Duration::minutes(LEASE_TTL_MINS)) {
    Ok(true) => {}
    Ok(false) => return StartReply::AlreadyRunning,
    Err(e) => {
      error!("cannot acquire preload lease: {}", e);
      return StartReply::Rejected {
        message: format!("store failure: {}", e),
      };
    }
  }

  let cycle = Arc::clone(cycle);
  let meta = meta.clone();
  let owner = owner.to_string();
  *running = Some(tokio::spawn(async move {
    match cycle.run(&email, &resources, nutrition_url.as_deref()).await {
      Ok(CycleOutcome::Complete { images_loaded, audio_loaded, .. }) => {
        info!(%email, images_loaded, audio_loaded, "background preload finished");
      }
      Ok(CycleOutcome::AlreadyComplete { age_days }) => {
        info!(%email, age_days, "background preload found fresh marker");
      }
      Ok(CycleOutcome::Aborted) => {
        warn!(%email, "background preload aborted");
      }
      Err(e) => {
        error!(%email, "background preload failed: {}", e);
        let state = PreloadState::new(PreloadStatus::Error, PreloadPhase::Checking, 0, 0);
        if let Err(e) = cycle.channel().publish(state) {
          error!("cannot publish error state: {}", e);
        }
      }
    }
    if let Err(e) = meta.release_lease(&owner) {
      warn!("cannot release preload lease: {}", e);
    }
  }));

  StartReply::Started
}

fn fresh_marker_age<F: ResourceFetcher>(
  cycle: &PreloadCycle<F>,
  meta: &MetaStore,
  email: &str,
) -> Result<Option<i64>> {
  let marker = match meta.completion_marker()? {
    Some(marker) => marker,
    None => return Ok(None),
  };
  if marker.email != email {
    return Ok(None);
  }
  let age = chrono::Utc::now() - marker.completed_at;
  if age < cycle.marker_freshness() {
    Ok(Some(age.num_days()))
  } else {
    Ok(None)
  }
}
