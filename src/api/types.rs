//! Wire types for the remote data origin.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Plan, Workout};

/// Response status field used by every origin endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
  Success,
  Error,
  Info,
}

/// Envelope shared by all origin endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
  pub status: ApiStatus,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub data: Option<T>,
}

impl<T> ApiResponse<T> {
  /// Unwrap the envelope. `error` becomes an `Err`; `info` carries no data
  /// and is surfaced to the caller the same way (the origin uses it for
  /// "nothing to do" responses).
  pub fn into_data(self) -> Result<T> {
    match self.status {
      ApiStatus::Success => self
        .data
        .ok_or_else(|| eyre!("Origin returned success without data")),
      ApiStatus::Error => Err(eyre!(
        "Origin error: {}",
        self.message.unwrap_or_else(|| "unknown".to_string())
      )),
      ApiStatus::Info => Err(eyre!(
        "Origin info: {}",
        self.message.unwrap_or_else(|| "no data".to_string())
      )),
    }
  }

  /// For write endpoints: success or info both count as accepted.
  pub fn into_ack(self) -> Result<()> {
    match self.status {
      ApiStatus::Success | ApiStatus::Info => Ok(()),
      ApiStatus::Error => Err(eyre!(
        "Origin error: {}",
        self.message.unwrap_or_else(|| "unknown".to_string())
      )),
    }
  }
}

/// Full catalog from the wide read endpoint: every plan and workout
/// definition, independent of any user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
  pub plans: Vec<Plan>,
  pub workouts: BTreeMap<String, Workout>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_status_becomes_err() {
    let resp: ApiResponse<u32> = serde_json::from_str(
      r#"{"status":"error","message":"no such user"}"#,
    )
    .unwrap();
    let err = resp.into_data().unwrap_err();
    assert!(err.to_string().contains("no such user"));
  }

  #[test]
  fn test_info_acks_write() {
    let resp: ApiResponse<()> =
      serde_json::from_str(r#"{"status":"info","message":"already saved"}"#).unwrap();
    assert!(resp.into_ack().is_ok());
  }

  #[test]
  fn test_success_without_data_is_err() {
    let resp: ApiResponse<u32> = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
    assert!(resp.into_data().is_err());
  }
}
