//! One end-to-end preload cycle: images, then audio, then the nutrition
//! document.
//!
//! Every item is idempotent: already-stored blobs are skipped, so an
//! interrupted cycle resumes by re-running the phase and re-checking each
//! item's presence. Item-level fetch failures are skipped and counted; only
//! a store write failure aborts the cycle.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::api::ResourceFetcher;
use crate::collect::{speech_key, ResourceSet};
use crate::state::{PreloadPhase, PreloadState, PreloadStatus, StateChannel};
use crate::store::{BlobStore, CompletionMarker, MetaStore, Partition};

/// Broadcast progress every this many items (plus once at phase end).
const BROADCAST_EVERY: u32 = 5;

/// Pause issued to the speech endpoint after every batch of requests.
const TTS_BATCH: u32 = 3;
const TTS_PAUSE: StdDuration = StdDuration::from_millis(300);

/// Terminal result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
  /// All phases ran to the end; marker written.
  Complete {
    images_loaded: u32,
    images_cached: u32,
    audio_loaded: u32,
    audio_cached: u32,
  },
  /// Fresh marker for this user; nothing downloaded.
  AlreadyComplete { age_days: i64 },
  /// Abort flag was raised mid-cycle; no marker written.
  Aborted,
}

/// Runs preload cycles against injected storage and fetcher.
///
/// The abort flag is instance state shared with whoever supervises the
/// cycle; it is re-checked between every item and every suspension point.
pub struct PreloadCycle<F> {
  blobs: BlobStore,
  meta: MetaStore,
  channel: StateChannel,
  fetcher: Arc<F>,
  abort: Arc<AtomicBool>,
  marker_fresh: Duration,
}

impl<F: ResourceFetcher> PreloadCycle<F> {
  pub fn new(blobs: BlobStore, meta: MetaStore, channel: StateChannel, fetcher: Arc<F>) -> Self {
    Self {
      blobs,
      meta,
      channel,
      fetcher,
      abort: Arc::new(AtomicBool::new(false)),
      marker_fresh: Duration::days(7),
    }
  }

  /// Override the marker freshness window.
  pub fn with_marker_freshness(mut self, window: Duration) -> Self {
    self.marker_fresh = window;
    self
  }

  /// Cooperative abort flag, shared with the supervising context.
  pub fn abort_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.abort)
  }

  pub fn channel(&self) -> &StateChannel {
    &self.channel
  }

  pub fn marker_freshness(&self) -> Duration {
    self.marker_fresh
  }

  fn aborted(&self) -> bool {
    self.abort.load(Ordering::Relaxed)
  }

  /// Run one cycle for `email`.
  pub async fn run(
    &self,
    email: &str,
    resources: &ResourceSet,
    nutrition_url: Option<&str>,
  ) -> Result<CycleOutcome> {
    if email.trim().is_empty() {
      return Err(eyre!("Cannot preload: missing user identity"));
    }

    // A cycle starting fresh clears any abort left over from a prior one.
    self.abort.store(false, Ordering::Relaxed);

    self.publish(PreloadStatus::Loading, PreloadPhase::Checking, 0, 0)?;

    // Fresh marker for the same user short-circuits the whole cycle.
    if let Some(marker) = self.meta.completion_marker()? {
      if marker.email == email {
        let age = Utc::now() - marker.completed_at;
        if age < self.marker_fresh {
          info!(%email, age_days = age.num_days(), "preload already complete");
          self.publish(PreloadStatus::Complete, PreloadPhase::Checking, 0, 0)?;
          return Ok(CycleOutcome::AlreadyComplete {
            age_days: age.num_days(),
          });
        }
      }
    }

    let images = self
      .run_image_phase(&resources.image_urls)
      .await?;
    if images.aborted {
      return self.finish_aborted();
    }

    let audio = self.run_audio_phase(&resources.speech_texts).await?;
    if audio.aborted {
      return self.finish_aborted();
    }

    if let Some(url) = nutrition_url {
      if self.aborted() {
        return self.finish_aborted();
      }
      self.run_nutrition_phase(url).await?;
    }

    // An abort raised during the final item must still suppress the marker.
    if self.aborted() {
      return self.finish_aborted();
    }

    let marker = CompletionMarker {
      email: email.to_string(),
      completed_at: Utc::now(),
      images_loaded: images.loaded,
      audio_loaded: audio.loaded,
    };
    self.meta.set_completion_marker(&marker)?;

    let total = resources.image_urls.len() as u32 + resources.speech_texts.len() as u32;
    self.publish(PreloadStatus::Complete, PreloadPhase::Nutrition, total, total)?;
    info!(
      email,
      images_loaded = images.loaded,
      images_cached = images.cached,
      audio_loaded = audio.loaded,
      audio_cached = audio.cached,
      "preload cycle complete"
    );

    Ok(CycleOutcome::Complete {
      images_loaded: images.loaded,
      images_cached: images.cached,
      audio_loaded: audio.loaded,
      audio_cached: audio.cached,
    })
  }

  async fn run_image_phase(&self, urls: &[String]) -> Result<PhaseReport> {
    let total = urls.len() as u32;
    let mut report = PhaseReport::default();

    for (i, url) in urls.iter().enumerate() {
      if self.aborted() {
        report.aborted = true;
        return Ok(report);
      }

      if self.is_cached(Partition::Images, url) {
        report.cached += 1;
      } else {
        match self.fetcher.fetch_image(url).await {
          Ok(bytes) => {
            // Store failures are cycle-fatal, unlike fetch failures.
            self.blobs.put(Partition::Images, url, &bytes)?;
            report.loaded += 1;
          }
          Err(e) => {
            warn!(%url, "image fetch failed, skipping: {}", e);
            report.skipped += 1;
          }
        }
      }

      self.progress(PreloadPhase::Images, i as u32 + 1, total)?;
    }

    Ok(report)
  }

  async fn run_audio_phase(&self, texts: &[String]) -> Result<PhaseReport> {
    let total = texts.len() as u32;
    let mut report = PhaseReport::default();
    let mut requests = 0u32;

    for (i, text) in texts.iter().enumerate() {
      if self.aborted() {
        report.aborted = true;
        return Ok(report);
      }

      let key = speech_key(text);
      if self.is_cached(Partition::Audio, &key) {
        report.cached += 1;
      } else {
        // Rate-limit the synthesis endpoint: pause after each batch.
        if requests > 0 && requests % TTS_BATCH == 0 {
          tokio::time::sleep(TTS_PAUSE).await;
          if self.aborted() {
            report.aborted = true;
            return Ok(report);
          }
        }
        requests += 1;

        match self.fetcher.fetch_speech(text).await {
          Ok(bytes) => {
            self.blobs.put(Partition::Audio, &key, &bytes)?;
            report.loaded += 1;
          }
          Err(e) => {
            debug!(%text, "speech synthesis failed, skipping: {}", e);
            report.skipped += 1;
          }
        }
      }

      self.progress(PreloadPhase::Audio, i as u32 + 1, total)?;
    }

    Ok(report)
  }

  async fn run_nutrition_phase(&self, url: &str) -> Result<()> {
    self.publish(PreloadStatus::Loading, PreloadPhase::Nutrition, 0, 1)?;

    if self.is_cached(Partition::Nutrition, url) {
      self.publish(PreloadStatus::Loading, PreloadPhase::Nutrition, 1, 1)?;
      return Ok(());
    }

    match self.fetcher.fetch_document(url).await {
      Ok(bytes) => {
        self.blobs.put(Partition::Nutrition, url, &bytes)?;
      }
      Err(e) => {
        warn!(%url, "nutrition document fetch failed, skipping: {}", e);
      }
    }

    self.publish(PreloadStatus::Loading, PreloadPhase::Nutrition, 1, 1)?;
    Ok(())
  }

  /// A store read failure counts as "not cached": the item is re-fetched
  /// rather than failing the cycle.
  fn is_cached(&self, partition: Partition, key: &str) -> bool {
    match self.blobs.contains(partition, key) {
      Ok(found) => found,
      Err(e) => {
        debug!(%key, "store lookup failed, treating as uncached: {}", e);
        false
      }
    }
  }

  fn finish_aborted(&self) -> Result<CycleOutcome> {
    info!("preload cycle aborted");
    self.publish(PreloadStatus::Error, PreloadPhase::Checking, 0, 0)?;
    Ok(CycleOutcome::Aborted)
  }

  /// Bounded-frequency progress broadcast: every `BROADCAST_EVERY` items
  /// and always at phase end.
  fn progress(&self, phase: PreloadPhase, current: u32, total: u32) -> Result<()> {
    if current % BROADCAST_EVERY == 0 || current == total {
      self.publish(PreloadStatus::Loading, phase, current, total)?;
    }
    Ok(())
  }

  fn publish(
    &self,
    status: PreloadStatus,
    phase: PreloadPhase,
    current: u32,
    total: u32,
  ) -> Result<()> {
    self
      .channel
      .publish(PreloadState::new(status, phase, current, total))
  }
}

#[derive(Debug, Default)]
struct PhaseReport {
  loaded: u32,
  cached: u32,
  skipped: u32,
  aborted: bool,
}
