//! Shared types for the absence watcher

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Newtype wrapper for camera zone identifiers (opaque strings from the camera)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub String);

impl ZoneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for camera serial numbers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraSerial(pub String);

impl CameraSerial {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CameraSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phone number plus carrier name, delivered through the carrier's email gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsRecipient {
    pub number: String,
    pub carrier: String,
}

/// Immutable per-zone configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneConfig {
    pub zone_id: ZoneId,
    pub camera_serial: CameraSerial,
    /// Absence duration after which an alert is raised (always > 0)
    pub threshold: Duration,
    pub email_recipients: Vec<String>,
    pub sms_recipients: Vec<SmsRecipient>,
}

/// Normalized detection event, one per inbound camera message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionEvent {
    pub zone_id: ZoneId,
    pub person_count: u64,
    /// Observation time (epoch ms)
    pub observed_at: u64,
}

impl DetectionEvent {
    pub fn new(zone_id: ZoneId, person_count: u64, observed_at: u64) -> Self {
        Self { zone_id, person_count, observed_at }
    }

    #[inline]
    pub fn person_present(&self) -> bool {
        self.person_count > 0
    }
}

/// Alert raised when a zone crosses its absence threshold
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    /// UUIDv7 for correlating tracker and delivery logs
    pub alert_id: String,
    pub zone_id: ZoneId,
    pub camera_serial: CameraSerial,
    pub threshold: Duration,
    /// Observation time of the event that crossed the threshold (epoch ms)
    pub triggered_at: u64,
    pub message_text: String,
}

/// Inbound detection payload published by the cameras
///
/// `{"ts": 1767630090048, "counts": {"person": 0, "vehicle": 1}}`
#[derive(Debug, Deserialize)]
pub struct DetectionMessage {
    #[serde(default)]
    pub ts: Option<u64>,
    pub counts: Option<serde_json::Map<String, serde_json::Value>>,
}
