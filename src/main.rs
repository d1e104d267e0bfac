mod api;
mod collect;
mod config;
mod model;
mod preload;
mod session;
mod state;
mod store;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api::{ApiClient, HttpFetcher, TtsClient};
use preload::{Coordinator, PreloadCycle, PreloadDecision};
use session::SessionCache;
use state::{PreloadStatus, StateChannel};
use store::{BlobStore, CacheDb, MetaStore, Partition};

#[derive(Parser, Debug)]
#[command(name = "fitsync")]
#[command(about = "Offline preload and caching engine for fitness plans")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fitsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Active user email (overrides config)
  #[arg(short, long)]
  email: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sync user data and preload all offline assets
  Preload {
    /// Re-run the preload even if the cache is fresh
    #[arg(long)]
    force: bool,
  },
  /// Show the current preload state and completion marker
  Status,
  /// Show locally recorded progress for a plan
  Progress { plan: String },
  /// Record completed-workout progress for a plan and sync it to the origin
  Record {
    plan: String,
    /// Index of the last completed workout
    index: u32,
    /// Total workouts in the plan
    total: u32,
  },
  /// Clear every cached asset and metadata record (logout)
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;

  init_logging(&config)?;

  let db = match &config.data_dir {
    Some(dir) => CacheDb::open_at(&dir.join("cache.db"))?,
    None => CacheDb::open()?,
  };
  let blobs = BlobStore::new(db.clone());
  let meta = MetaStore::new(db);
  let channel = StateChannel::new(meta.clone());

  let email = args.email.or_else(|| config.email.clone());

  match args.command {
    Command::Preload { force } => {
      let email = email.ok_or_else(|| eyre!("No user email: pass --email or set it in the config"))?;
      run_preload(&config, blobs, meta, channel, &email, force).await
    }
    Command::Status => show_status(&meta, &channel),
    Command::Progress { plan } => show_progress(blobs, &plan),
    Command::Record { plan, index, total } => {
      let email = email.ok_or_else(|| eyre!("No user email: pass --email or set it in the config"))?;
      run_record(&config, blobs, &email, &plan, index, total).await
    }
    Command::Clear => clear_cache(&blobs, &meta, &channel),
  }
}

fn init_logging(config: &config::Config) -> Result<()> {
  let log_dir = config
    .data_dir
    .clone()
    .or_else(|| dirs::data_dir().map(|d| d.join("fitsync")))
    .ok_or_else(|| eyre!("Could not determine log directory"))?;
  let file = tracing_appender::rolling::daily(log_dir, "fitsync.log");

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fitsync=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_target(false))
    .with(fmt::layer().with_writer(file).with_ansi(false))
    .init();
  Ok(())
}

async fn run_preload(
  config: &config::Config,
  blobs: BlobStore,
  meta: MetaStore,
  channel: StateChannel,
  email: &str,
  force: bool,
) -> Result<()> {
  let api = ApiClient::new(config)?;
  let tts = TtsClient::new(&config.tts)?;
  let fetcher = Arc::new(HttpFetcher::new(tts));

  // Lightweight server round-trip first: the snapshot is what UI reads,
  // so it must never wait on asset downloads.
  let session = SessionCache::new(blobs.clone()).with_fresh_for(
    std::time::Duration::from_secs(config.preload.session_fresh_mins as u64 * 60),
  );
  let result = {
    let api = api.clone();
    let user = email.to_string();
    session
      .get_user_data(email, force, move || async move {
        api.get_user_data(&user).await
      })
      .await?
  };
  tracing::info!(source = ?result.source, "user data synced");

  let cycle = PreloadCycle::new(
    blobs.clone(),
    meta.clone(),
    channel.clone(),
    Arc::clone(&fetcher),
  )
  .with_marker_freshness(chrono::Duration::days(config.preload.marker_fresh_days));
  let orchestrator = preload::spawn_orchestrator(
    PreloadCycle::new(blobs.clone(), meta.clone(), channel.clone(), fetcher)
      .with_marker_freshness(chrono::Duration::days(config.preload.marker_fresh_days)),
    meta.clone(),
    channel.clone(),
  );
  let abort_handle = orchestrator.clone();

  let coordinator = Coordinator::new(
    blobs,
    meta,
    channel.clone(),
    cycle,
    Some(orchestrator),
    config.preload.clone(),
  );

  let decision = coordinator
    .ensure_preloaded(email, &result.data, force)
    .await?;

  match decision {
    PreloadDecision::UpToDate => {
      println!("Cache is fresh, nothing to preload.");
      Ok(())
    }
    PreloadDecision::AlreadyInProgress => {
      println!("Another preload is already in progress.");
      Ok(())
    }
    PreloadDecision::RanLocally { outcome, .. } => {
      println!("Preload finished: {:?}", outcome);
      Ok(())
    }
    PreloadDecision::Delegated { reply, .. } => match reply {
      preload::StartReply::Started | preload::StartReply::AlreadyRunning => {
        tokio::select! {
          res = watch_progress(&channel) => res,
          _ = tokio::signal::ctrl_c() => {
            abort_handle.abort();
            println!("Abort requested; the background cycle stops at the next item.");
            Ok(())
          }
        }
      }
      preload::StartReply::AlreadyComplete { age_days } => {
        println!("Preload already complete {} days ago.", age_days);
        Ok(())
      }
      preload::StartReply::Rejected { message } => Err(eyre!("Preload rejected: {}", message)),
    },
  }
}

/// Follow state broadcasts until the background cycle reaches a terminal
/// status, printing progress lines as they arrive.
async fn watch_progress(channel: &StateChannel) -> Result<()> {
  let mut rx = channel.subscribe();
  let poller = channel.spawn_poller();
  let mut first = true;

  loop {
    // Read first, wait second: the cycle may already be terminal. The very
    // first value can also be a leftover record from a previous run, so it
    // only counts if it is recent.
    let state = rx.borrow_and_update().clone();
    let state = match state {
      Some(s)
        if first
          && (chrono::Utc::now() - s.timestamp).num_seconds() > state::STATE_STALE_SECS =>
      {
        None
      }
      other => other,
    };
    first = false;
    if let Some(state) = state {
      match state.status {
        PreloadStatus::Loading => {
          println!(
            "{:?}: {}/{} ({}%)",
            state.phase, state.current, state.total, state.percent
          );
        }
        PreloadStatus::Complete => {
          println!("Preload complete.");
          break;
        }
        PreloadStatus::Error => {
          println!("Preload failed; see the log for details.");
          break;
        }
        PreloadStatus::Idle => {}
      }
    }
    if rx.changed().await.is_err() {
      break;
    }
  }

  poller.abort();
  Ok(())
}

fn show_status(meta: &MetaStore, channel: &StateChannel) -> Result<()> {
  match channel.read_active()? {
    Some(state) => println!(
      "State: {:?} / {:?} {}/{} ({}%)",
      state.status, state.phase, state.current, state.total, state.percent
    ),
    None => println!("State: idle"),
  }

  match meta.completion_marker()? {
    Some(marker) => {
      let age = chrono::Utc::now() - marker.completed_at;
      println!(
        "Last preload: {} ({} days ago, {} images, {} audio clips)",
        marker.email,
        age.num_days(),
        marker.images_loaded,
        marker.audio_loaded
      );
    }
    None => println!("Last preload: never"),
  }
  Ok(())
}

async fn run_record(
  config: &config::Config,
  blobs: BlobStore,
  email: &str,
  plan: &str,
  index: u32,
  total: u32,
) -> Result<()> {
  let api = ApiClient::new(config)?;
  let session = SessionCache::new(blobs);
  let progress = model::PlanProgress {
    last_workout_index: index,
    total_workouts: total,
    last_updated: chrono::Utc::now(),
  };

  let sync = {
    let user = email.to_string();
    let plan_name = plan.to_string();
    async move { api.save_plan_progress(&user, &plan_name, index).await }
  };
  let sync = session.save_plan_progress(plan, &progress, sync)?;
  println!("{}: workout {}/{} recorded", plan, index, total);

  // Local write is already durable; wait out the origin sync so the process
  // does not exit under it.
  let _ = sync.await;
  Ok(())
}

fn show_progress(blobs: BlobStore, plan: &str) -> Result<()> {
  let session = SessionCache::new(blobs);
  match session.plan_progress(plan)? {
    Some(progress) => println!(
      "{}: workout {}/{} (updated {})",
      plan, progress.last_workout_index, progress.total_workouts, progress.last_updated
    ),
    None => println!("{}: no recorded progress", plan),
  }
  Ok(())
}

fn clear_cache(blobs: &BlobStore, meta: &MetaStore, channel: &StateChannel) -> Result<()> {
  for partition in [
    Partition::Images,
    Partition::Audio,
    Partition::Nutrition,
    Partition::Snapshots,
    Partition::Progress,
  ] {
    blobs.clear(partition)?;
  }
  channel.clear()?;
  meta.clear()?;
  println!("Cache cleared.");
  Ok(())
}
