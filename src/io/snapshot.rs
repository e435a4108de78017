//! Meraki dashboard snapshot client
//!
//! Two steps: ask the dashboard to generate a snapshot (returns a URL), then
//! download the image. The image is usually not ready when the URL comes back,
//! so the download is retried under a `RetryPolicy`.

use crate::domain::error::DeliveryError;
use crate::domain::types::CameraSerial;
use crate::infra::config::{Config, SnapshotConfig};
use crate::services::dispatcher::{Snapshot, SnapshotSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SnapshotConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after the given failed attempt (1-based): initial, 2x, 4x, ... capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    url: Option<String>,
}

pub struct MerakiSnapshotClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl MerakiSnapshotClient {
    pub fn new(config: &Config) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.meraki_timeout_ms()))
            .build()
            .map_err(|e| DeliveryError::SnapshotRequest(Box::new(e)))?;

        Ok(Self {
            http,
            base_url: config.meraki_base_url().trim_end_matches('/').to_string(),
            api_key: config.meraki_api_key().to_string(),
            retry: RetryPolicy::from_config(config.snapshot()),
        })
    }

    /// Override the retry policy (tests use millisecond backoffs)
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ask the dashboard for a snapshot URL
    pub async fn generate(&self, camera: &CameraSerial, at: Option<u64>) -> Result<String, DeliveryError> {
        let url = format!("{}/devices/{}/camera/generateSnapshot", self.base_url, camera);

        let mut body = serde_json::Map::new();
        if let Some(ts) = at.and_then(rfc3339_from_epoch_ms) {
            body.insert("timestamp".to_string(), serde_json::Value::String(ts));
        }

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::SnapshotRequest(Box::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::SnapshotStatus(status.as_u16()));
        }

        let parsed: SnapshotResponse =
            response.json().await.map_err(|e| DeliveryError::SnapshotRequest(Box::new(e)))?;
        let image_url = parsed.url.ok_or(DeliveryError::SnapshotMissingUrl)?;
        debug!(camera_serial = %camera, url = %image_url, "snapshot_generated");
        Ok(image_url)
    }

    /// Download the image, retrying until it is available or attempts run out
    pub async fn download(&self, image_url: &str) -> Result<Snapshot, DeliveryError> {
        let start = Instant::now();

        for attempt in 1..=self.retry.max_attempts {
            match self.try_download(image_url).await {
                Ok(snapshot) => {
                    info!(
                        attempts = %attempt,
                        bytes = %snapshot.bytes.len(),
                        elapsed_ms = %start.elapsed().as_millis(),
                        "snapshot_downloaded"
                    );
                    return Ok(snapshot);
                }
                Err(reason) => {
                    debug!(attempt = %attempt, reason = %reason, "snapshot_not_ready");
                }
            }
            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }

        warn!(
            url = %image_url,
            attempts = %self.retry.max_attempts,
            elapsed_ms = %start.elapsed().as_millis(),
            "snapshot_download_exhausted"
        );
        Err(DeliveryError::SnapshotDownload { attempts: self.retry.max_attempts })
    }

    async fn try_download(&self, image_url: &str) -> Result<Snapshot, String> {
        let response = self.http.get(image_url).send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("status {}", status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(Snapshot { bytes, content_type })
    }
}

#[async_trait]
impl SnapshotSource for MerakiSnapshotClient {
    async fn fetch(&self, camera: &CameraSerial, at: Option<u64>) -> Result<Snapshot, DeliveryError> {
        let image_url = self.generate(camera, at).await?;
        self.download(&image_url).await
    }
}

fn rfc3339_from_epoch_ms(ms: u64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
}
