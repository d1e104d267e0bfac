//! Resource collector: enumerates everything a user needs cached for
//! offline use.
//!
//! Walks every plan assigned to the user, resolves each workout against the
//! library, and gathers exercise image URLs plus the texts that get spoken
//! during a session. A fixed baseline of app images and common narration
//! phrases is always included, whatever the plans reference.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

use crate::model::{Plan, Workout};

/// Images every page needs regardless of the user's plans.
pub const APP_IMAGES: &[&str] = &[
  "https://cdn.fitsync.app/img/logo.png",
  "https://cdn.fitsync.app/img/phase-work.png",
  "https://cdn.fitsync.app/img/phase-rest.png",
  "https://cdn.fitsync.app/img/phase-done.png",
];

/// Spoken phrases used by every workout, independent of exercise names.
pub const COMMON_PHRASES: &[&str] = &[
  "Get ready",
  "Three",
  "Two",
  "One",
  "Go",
  "Rest",
  "Halfway there",
  "Last exercise",
  "Workout complete",
];

/// Deduplicated resource lists for one user's preload cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSet {
  pub image_urls: Vec<String>,
  pub speech_texts: Vec<String>,
}

/// Blob-store key for a synthesized speech clip.
///
/// Texts are arbitrary length, so the key is a prefixed SHA256 for stable,
/// fixed-length lookups.
pub fn speech_key(text: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(text.as_bytes());
  format!("tts:{}", hex::encode(hasher.finalize()))
}

/// Enumerate the deduplicated image URLs and speech texts for a user's
/// assigned plans. Order is first-seen (baseline entries first), so repeated
/// runs over the same input produce identical lists.
pub fn collect(plans: &[Plan], workouts: &BTreeMap<String, Workout>) -> ResourceSet {
  let mut images = DedupList::new();
  let mut speech = DedupList::new();

  for url in APP_IMAGES {
    images.push(url);
  }
  for phrase in COMMON_PHRASES {
    speech.push(phrase);
  }

  for plan in plans {
    for workout_name in &plan.workouts {
      let workout = match workouts.get(workout_name) {
        Some(w) => w,
        None => {
          tracing::warn!(plan = %plan.name, workout = %workout_name, "workout missing from library");
          continue;
        }
      };

      match workout {
        Workout::Muscle { exercises, .. } => {
          for exercise in exercises {
            if let Some(image) = &exercise.image {
              images.push(image);
            }
            speech.push(&exercise.name);
          }
        }
        Workout::Run { narration, .. } => {
          for cue in narration {
            speech.push(cue);
          }
        }
      }
    }
  }

  ResourceSet {
    image_urls: images.into_vec(),
    speech_texts: speech.into_vec(),
  }
}

/// Insertion-ordered list with set semantics.
struct DedupList {
  seen: HashSet<String>,
  items: Vec<String>,
}

impl DedupList {
  fn new() -> Self {
    Self {
      seen: HashSet::new(),
      items: Vec::new(),
    }
  }

  fn push(&mut self, item: &str) {
    if self.seen.insert(item.to_string()) {
      self.items.push(item.to_string());
    }
  }

  fn into_vec(self) -> Vec<String> {
    self.items
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Exercise;

  fn muscle(name: &str, exercises: &[(&str, Option<&str>)]) -> Workout {
    Workout::Muscle {
      name: name.to_string(),
      exercises: exercises
        .iter()
        .map(|(n, img)| Exercise {
          name: n.to_string(),
          image: img.map(String::from),
          extra: BTreeMap::new(),
        })
        .collect(),
    }
  }

  fn plan(name: &str, workouts: &[&str]) -> Plan {
    Plan {
      name: name.to_string(),
      workouts: workouts.iter().map(|w| w.to_string()).collect(),
    }
  }

  #[test]
  fn test_baselines_always_included() {
    let set = collect(&[], &BTreeMap::new());
    assert_eq!(set.image_urls.len(), APP_IMAGES.len());
    assert_eq!(set.speech_texts.len(), COMMON_PHRASES.len());
  }

  #[test]
  fn test_shared_resources_deduplicated() {
    // Two plans referencing the same workout, and two exercises sharing an
    // image URL, must yield exactly one entry for that URL.
    let mut library = BTreeMap::new();
    library.insert(
      "push".to_string(),
      muscle(
        "push",
        &[
          ("Bench Press", Some("https://cdn.example.com/bench.png")),
          ("Incline Press", Some("https://cdn.example.com/bench.png")),
        ],
      ),
    );

    let plans = vec![plan("Beginner", &["push"]), plan("Advanced", &["push"])];
    let set = collect(&plans, &library);

    let shared: Vec<_> = set
      .image_urls
      .iter()
      .filter(|u| u.as_str() == "https://cdn.example.com/bench.png")
      .collect();
    assert_eq!(shared.len(), 1);

    let bench: Vec<_> = set
      .speech_texts
      .iter()
      .filter(|t| t.as_str() == "Bench Press")
      .collect();
    assert_eq!(bench.len(), 1);
  }

  #[test]
  fn test_run_workout_contributes_narration_not_images() {
    let mut library = BTreeMap::new();
    library.insert(
      "run".to_string(),
      Workout::Run {
        name: "run".to_string(),
        narration: vec!["Speed up".to_string(), "Slow down".to_string()],
      },
    );

    let set = collect(&[plan("Cardio", &["run"])], &library);
    assert_eq!(set.image_urls.len(), APP_IMAGES.len());
    assert!(set.speech_texts.iter().any(|t| t == "Speed up"));
    assert!(set.speech_texts.iter().any(|t| t == "Slow down"));
  }

  #[test]
  fn test_missing_workout_is_skipped() {
    let set = collect(&[plan("Broken", &["nonexistent"])], &BTreeMap::new());
    assert_eq!(set.image_urls.len(), APP_IMAGES.len());
  }

  #[test]
  fn test_collect_order_is_stable() {
    let mut library = BTreeMap::new();
    library.insert(
      "push".to_string(),
      muscle("push", &[("Dips", Some("https://cdn.example.com/dips.png"))]),
    );
    let plans = vec![plan("Beginner", &["push"])];

    let a = collect(&plans, &library);
    let b = collect(&plans, &library);
    assert_eq!(a, b);
    // Baselines come first
    assert_eq!(a.image_urls[0], APP_IMAGES[0]);
  }

  #[test]
  fn test_speech_key_is_stable_and_prefixed() {
    let a = speech_key("Bench Press");
    let b = speech_key("Bench Press");
    assert_eq!(a, b);
    assert!(a.starts_with("tts:"));
    assert_ne!(a, speech_key("Squat"));
  }
}
