//! Speech synthesis client.
//!
//! The endpoint takes a text and language code and returns a binary audio
//! clip. No authentication; treated as unreliable by contract, so callers
//! skip failures rather than retry.

use color_eyre::{eyre::eyre, Result};
use url::Url;

use crate::config::TtsConfig;

#[derive(Clone)]
pub struct TtsClient {
  http: reqwest::Client,
  base: Url,
  lang: String,
}

impl TtsClient {
  pub fn new(config: &TtsConfig) -> Result<Self> {
    let base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid TTS url {}: {}", config.url, e))?;
    Ok(Self {
      http: reqwest::Client::new(),
      base,
      lang: config.lang.clone(),
    })
  }

  /// Synthesize one text into audio bytes.
  pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
    let mut url = self.base.clone();
    url
      .query_pairs_mut()
      .append_pair("q", text)
      .append_pair("lang", &self.lang);

    let resp = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("TTS request failed for '{}': {}", text, e))?;

    if !resp.status().is_success() {
      return Err(eyre!("TTS returned {} for '{}'", resp.status(), text));
    }

    let bytes = resp
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read TTS audio for '{}': {}", text, e))?;
    Ok(bytes.to_vec())
  }
}
