use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub tts: TtsConfig,
  /// Active user for preload decisions. Overridable on the command line.
  pub email: Option<String>,
  /// Override for the cache database location (default: platform data dir).
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub preload: PreloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the remote data origin.
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfig {
  /// Speech synthesis endpoint.
  pub url: String,
  /// Language code sent with every synthesis request.
  #[serde(default = "default_lang")]
  pub lang: String,
}

impl Default for TtsConfig {
  fn default() -> Self {
    Self {
      url: "https://tts.fitsync.app/speak".to_string(),
      lang: default_lang(),
    }
  }
}

fn default_lang() -> String {
  "en".to_string()
}

/// Freshness windows for the preload decision procedure. Defaults match the
/// product behavior; tests shrink them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
  /// Completion marker is trusted for this many days.
  pub marker_fresh_days: i64,
  /// Cached metadata is fresh for this many hours.
  pub cache_fresh_hours: i64,
  /// Session cache of the server payload is fresh for this many minutes.
  pub session_fresh_mins: i64,
}

impl Default for PreloadConfig {
  fn default() -> Self {
    Self {
      marker_fresh_days: 7,
      cache_fresh_hours: 24,
      session_fresh_mins: 5,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fitsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fitsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/fitsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fitsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fitsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the remote origin API token from the environment.
  pub fn get_api_token() -> Result<String> {
    std::env::var("FITSYNC_API_TOKEN")
      .map_err(|_| eyre!("API token not found. Set FITSYNC_API_TOKEN environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_gets_defaults() {
    let config: Config = serde_yaml::from_str(
      r#"
api:
  url: https://api.fitsync.app
email: alice@example.com
"#,
    )
    .unwrap();

    assert_eq!(config.preload.marker_fresh_days, 7);
    assert_eq!(config.preload.cache_fresh_hours, 24);
    assert_eq!(config.preload.session_fresh_mins, 5);
    assert_eq!(config.tts.lang, "en");
  }

  #[test]
  fn test_windows_are_overridable() {
    let config: Config = serde_yaml::from_str(
      r#"
api:
  url: https://api.fitsync.app
preload:
  marker_fresh_days: 1
"#,
    )
    .unwrap();

    assert_eq!(config.preload.marker_fresh_days, 1);
    // Unset fields keep their defaults
    assert_eq!(config.preload.cache_fresh_hours, 24);
  }
}
