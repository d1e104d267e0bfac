//! Preload engine: one-cycle download logic, the background orchestrator
//! that runs it off the foreground path, and the foreground coordinator
//! that decides per run whether a cycle is needed at all.

mod coordinator;
mod cycle;
mod orchestrator;

pub use coordinator::{Coordinator, PreloadDecision, PreloadReason};
pub use cycle::{CycleOutcome, PreloadCycle};
pub use orchestrator::{spawn_orchestrator, OrchestratorHandle, StartReply, StatusReply};

use tokio::sync::oneshot;

use crate::collect::ResourceSet;

/// How long a cycle may hold the preload lease before another context may
/// reclaim it. Long enough for a slow full download, short enough that a
/// crashed holder does not block preloading forever.
pub(crate) const LEASE_TTL_MINS: i64 = 10;

/// Commands accepted by the background orchestrator.
pub(crate) enum Command {
  Start {
    email: String,
    resources: ResourceSet,
    nutrition_url: Option<String>,
    reply: oneshot::Sender<StartReply>,
  },
  CheckStatus {
    reply: oneshot::Sender<StatusReply>,
  },
  Abort,
}
