//! Download seam for the preload cycle.
//!
//! The orchestrator fetches through this trait so the cycle logic stays
//! testable without network; `HttpFetcher` is the production impl.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;

use super::tts::TtsClient;

/// Fetches the three resource classes a preload cycle downloads.
pub trait ResourceFetcher: Send + Sync {
  /// Read-only GET of an image by URL.
  fn fetch_image<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;

  /// Synthesize speech audio for a text.
  fn fetch_speech<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;

  /// Read-only GET of a document (nutrition PDF/HTML) by URL.
  fn fetch_document<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// Production fetcher over plain HTTP plus the TTS client.
#[derive(Clone)]
pub struct HttpFetcher {
  http: reqwest::Client,
  tts: TtsClient,
}

impl HttpFetcher {
  pub fn new(tts: TtsClient) -> Self {
    Self {
      http: reqwest::Client::new(),
      tts,
    }
  }

  async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
    let resp = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Fetch failed for {}: {}", url, e))?;

    if !resp.status().is_success() {
      return Err(eyre!("Fetch returned {} for {}", resp.status(), url));
    }

    let bytes = resp
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body for {}: {}", url, e))?;
    Ok(bytes.to_vec())
  }
}

impl ResourceFetcher for HttpFetcher {
  fn fetch_image<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
    Box::pin(self.get_bytes(url))
  }

  fn fetch_speech<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
    Box::pin(self.tts.synthesize(text))
  }

  fn fetch_document<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
    Box::pin(self.get_bytes(url))
  }
}
