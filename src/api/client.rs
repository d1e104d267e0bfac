//! Remote data origin client.

use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use url::Url;

use crate::config::Config;
use crate::model::UserData;

use super::types::{ApiResponse, Catalog};

/// JSON client for the spreadsheet-backed origin.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
  token: String,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    let base = Url::parse(&config.api.url)
      .map_err(|e| eyre!("Invalid API url {}: {}", config.api.url, e))?;

    Ok(Self {
      http: reqwest::Client::new(),
      base,
      token,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))
  }

  /// Full catalog: every plan and workout definition.
  #[allow(dead_code)]
  pub async fn get_catalog(&self) -> Result<Catalog> {
    let url = self.endpoint("catalog")?;
    let resp: ApiResponse<Catalog> = self
      .http
      .get(url)
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch catalog: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse catalog: {}", e))?;
    resp.into_data()
  }

  /// Narrow per-user read: only this user's plans, workouts and progress.
  pub async fn get_user_data(&self, email: &str) -> Result<UserData> {
    let mut url = self.endpoint("user")?;
    url.query_pairs_mut().append_pair("email", email);

    let resp: ApiResponse<UserData> = self
      .http
      .get(url)
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch user data for {}: {}", email, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse user data: {}", e))?;
    resp.into_data()
  }

  /// Record the last completed workout index for a plan.
  pub async fn save_plan_progress(&self, email: &str, plan: &str, index: u32) -> Result<()> {
    let url = self.endpoint("progress/save")?;
    let body = json!({
      "email": email,
      "plan": plan,
      "lastWorkoutIndex": index,
    });
    self.post_ack(url, body).await
  }

  /// Record a weight selection for an exercise.
  #[allow(dead_code)]
  pub async fn save_weight(&self, email: &str, exercise: &str, weight: f64) -> Result<()> {
    let url = self.endpoint("weights/save")?;
    let body = json!({
      "email": email,
      "exercise": exercise,
      "weight": weight,
    });
    self.post_ack(url, body).await
  }

  /// Register a new trial user.
  #[allow(dead_code)]
  pub async fn register_trial(&self, name: &str, email: &str) -> Result<()> {
    let url = self.endpoint("trial/register")?;
    let body = json!({
      "name": name,
      "email": email,
    });
    self.post_ack(url, body).await
  }

  async fn post_ack(&self, url: Url, body: serde_json::Value) -> Result<()> {
    let resp: ApiResponse<serde_json::Value> = self
      .http
      .post(url)
      .bearer_auth(&self.token)
      .json(&body)
      .send()
      .await
      .map_err(|e| eyre!("Origin request failed: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse origin response: {}", e))?;
    resp.into_ack()
  }
}
