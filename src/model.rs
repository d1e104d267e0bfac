//! Domain payload types flowing through the cache.
//!
//! The plan/workout model is deliberately shallow: the preload engine only
//! needs enough structure to walk plans to workouts to resources. Anything
//! deeper (sets, reps, rest timers) stays opaque JSON inside `extra`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An ordered sequence of workout references assigned to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
  pub name: String,
  /// Workout names in plan order, resolved against the workout library.
  pub workouts: Vec<String>,
}

/// One exercise inside a muscle workout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
  pub name: String,
  /// Demo image URL, absent for bodyweight/freeform entries.
  #[serde(default)]
  pub image: Option<String>,
  /// Fields the engine does not interpret (sets, reps, weight hints).
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

/// A workout is either a strength ("muscle") workout with an exercise list
/// or a run workout with narration cues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Workout {
  Muscle {
    name: String,
    exercises: Vec<Exercise>,
  },
  Run {
    name: String,
    /// Spoken cue texts for interval transitions.
    #[serde(default)]
    narration: Vec<String>,
  },
}

/// Full per-user payload from the remote origin, cached as one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
  pub email: String,
  pub plans: Vec<Plan>,
  /// Workout library keyed by workout name.
  pub workouts: BTreeMap<String, Workout>,
  #[serde(default)]
  pub nutrition_url: Option<String>,
  /// Per-plan progress as last synced from the server.
  #[serde(default)]
  pub progress: BTreeMap<String, PlanProgress>,
}

/// Per-plan progress record, advanced only by the user's own actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanProgress {
  pub last_workout_index: u32,
  pub total_workouts: u32,
  pub last_updated: DateTime<Utc>,
}
