//! Clients for the external collaborators: the remote data origin and the
//! speech synthesis endpoint, plus the `ResourceFetcher` seam the preload
//! cycle downloads through.

mod client;
mod fetch;
mod tts;
mod types;

pub use client::ApiClient;
pub use fetch::{HttpFetcher, ResourceFetcher};
pub use tts::TtsClient;
pub use types::{ApiResponse, ApiStatus, Catalog};
