//! REST client for the subset of the Syncthing API the pipeline drives:
//! rescans and folder completion. Everything else Syncthing offers is out
//! of scope here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use thiserror::Error;

use crate::settings::SyncthingSettings;

/// Failures talking to the replication service, classified so callers can
/// distinguish a bad credential from a down service from everything else.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error(
        "replication request failed ({status}): unauthorized. Verify Syncthing API key and ACLs."
    )]
    Auth { status: u16 },

    #[error("replication request failed ({status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("unable to reach replication service: {0}")]
    Connect(String),

    #[error("unexpected replication payload: {0}")]
    Protocol(String),
}

impl ReplicationError {
    /// Auth failures are never fixed by waiting; callers use this to stop
    /// retrying and demand operator attention instead.
    pub fn is_auth(&self) -> bool {
        matches!(self, ReplicationError::Auth { .. })
    }
}

/// The replication operations the sync tracker needs. Implemented by
/// [`SyncthingClient`] for production and by scripted stubs in tests.
#[async_trait]
pub trait ReplicationApi: Send + Sync {
    /// Ask the service to rescan a configured folder, optionally narrowed
    /// to subdirectories relative to the folder root.
    async fn rescan_folder(
        &self,
        folder: &str,
        subdirs: &[String],
    ) -> Result<(), ReplicationError>;

    /// Legacy absolute-path rescan for setups without a folder id.
    async fn rescan_path(&self, path: &str) -> Result<(), ReplicationError>;

    /// Completion percentage in `[0, 100]` for a folder, optionally scoped
    /// to a single device.
    async fn folder_completion(
        &self,
        folder: &str,
        device: Option<&str>,
    ) -> Result<f64, ReplicationError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), ReplicationError>;
}

pub struct SyncthingClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl std::fmt::Debug for SyncthingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncthingClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SyncthingClient {
    pub fn new(settings: &SyncthingSettings) -> Result<Self, ReplicationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| {
                ReplicationError::Protocol(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, ReplicationError> {
        let mut request = request.header(reqwest::header::ACCEPT, "application/json");
        if !self.api_key.is_empty() {
            request = request.header("X-API-Key", &self.api_key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ReplicationError::Auth {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = body.lines().next().unwrap_or("").trim().to_string();
            return Err(ReplicationError::Api {
                status: status.as_u16(),
                detail,
            });
        }

        let raw = response.text().await.map_err(classify_transport)?;
        if raw.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&raw).map_err(|e| {
            ReplicationError::Protocol(format!("invalid JSON from replication service: {e}"))
        })
    }
}

#[async_trait]
impl ReplicationApi for SyncthingClient {
    async fn rescan_folder(
        &self,
        folder: &str,
        subdirs: &[String],
    ) -> Result<(), ReplicationError> {
        let mut payload = json!({ "folder": folder });
        if !subdirs.is_empty() {
            payload["subdirs"] = json!(subdirs);
        }
        self.execute(self.client.post(self.endpoint("/db/scan")).json(&payload))
            .await?;
        Ok(())
    }

    async fn rescan_path(&self, path: &str) -> Result<(), ReplicationError> {
        self.execute(
            self.client
                .post(self.endpoint("/system/scan"))
                .json(&json!({ "path": path })),
        )
        .await?;
        Ok(())
    }

    async fn folder_completion(
        &self,
        folder: &str,
        device: Option<&str>,
    ) -> Result<f64, ReplicationError> {
        let mut params = vec![("folder", folder)];
        if let Some(device) = device {
            params.push(("device", device));
        }
        let payload = self
            .execute(
                self.client
                    .get(self.endpoint("/db/completion"))
                    .query(&params),
            )
            .await?;
        Ok(normalize_completion(&payload))
    }

    async fn ping(&self) -> Result<(), ReplicationError> {
        self.execute(self.client.get(self.endpoint("/system/status")))
            .await?;
        Ok(())
    }
}

fn classify_transport(error: reqwest::Error) -> ReplicationError {
    if error.is_timeout() || error.is_connect() {
        ReplicationError::Connect(error.to_string())
    } else if error.is_decode() {
        ReplicationError::Protocol(error.to_string())
    } else {
        ReplicationError::Connect(error.to_string())
    }
}

/// Normalize the `/db/completion` payload across the shapes Syncthing is
/// known to produce: a scalar `completion`, a per-device map (the minimum
/// wins; replication is only done when the slowest device is done), a
/// `globalCompletion` fallback, or a bare number. Unknown shapes read as
/// 0 and the result is clamped to `[0, 100]`.
pub fn normalize_completion(payload: &Value) -> f64 {
    completion_value(payload).unwrap_or(0.0).clamp(0.0, 100.0)
}

fn completion_value(payload: &Value) -> Option<f64> {
    let Value::Object(map) = payload else {
        return as_f64(payload);
    };

    match map.get("completion") {
        Some(Value::Object(devices)) => {
            let completions: Vec<f64> =
                devices.values().filter_map(device_completion).collect();
            if let Some(min) = completions
                .into_iter()
                .reduce(|a, b| if b < a { b } else { a })
            {
                return Some(min);
            }
        }
        Some(other) => {
            if let Some(value) = as_f64(other) {
                return Some(value);
            }
        }
        None => {}
    }

    map.get("globalCompletion")
        .or_else(|| map.get("globalcompletion"))
        .and_then(as_f64)
}

fn device_completion(value: &Value) -> Option<f64> {
    match value {
        Value::Object(map) => map.get("completion").and_then(as_f64),
        other => as_f64(other),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
