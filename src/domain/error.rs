//! Error taxonomy
//!
//! - `ConfigError` - fatal at startup
//! - `ParseError` - per message, logged and dropped by ingress
//! - `UnknownZoneError` - config/ingress mismatch, logged by the tracker
//! - `DeliveryError` - per destination or snapshot, logged and skipped

use crate::domain::types::ZoneId;
use std::path::PathBuf;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Bad or missing configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse zones file {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("zone entry #{index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("zone {zone_id} has non-positive threshold {value}")]
    InvalidThreshold { zone_id: String, value: f64 },

    #[error("zone {zone_id} is configured more than once")]
    DuplicateZone { zone_id: String },

    #[error("zone {zone_id} has malformed text recipient `{value}`")]
    InvalidSmsRecipient { zone_id: String, value: String },

    #[error("no zones configured")]
    NoZones,

    #[error("invalid broker bind address `{address}`")]
    BrokerAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Malformed inbound detection message
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON")]
    Json(#[from] serde_json::Error),

    #[error("payload has no `counts` object")]
    MissingCounts,

    #[error("person count `{0}` is not a non-negative integer")]
    InvalidCount(String),

    #[error("topic `{0}` does not name a camera and zone")]
    Topic(String),
}

/// Event for a zone the tracker holds no state for
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no state registered for zone {0}")]
pub struct UnknownZoneError(pub ZoneId);

/// Failed snapshot retrieval or message delivery
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("snapshot request failed")]
    SnapshotRequest(#[source] BoxError),

    #[error("snapshot request returned status {0}")]
    SnapshotStatus(u16),

    #[error("snapshot response carried no url")]
    SnapshotMissingUrl,

    #[error("snapshot download failed after {attempts} attempts")]
    SnapshotDownload { attempts: u32 },

    #[error("invalid address `{address}`")]
    Address {
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to build message")]
    Message(#[source] BoxError),

    #[error("send to {recipient} failed")]
    Send {
        recipient: String,
        #[source]
        source: BoxError,
    },

    #[error("unsupported carrier `{0}`")]
    UnsupportedCarrier(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = UnknownZoneError(ZoneId::new("42"));
        assert_eq!(err.to_string(), "no state registered for zone 42");

        let err = ConfigError::MissingField { index: 2, field: "zone_id" };
        assert_eq!(err.to_string(), "zone entry #2 is missing required field `zone_id`");

        let err = DeliveryError::SnapshotDownload { attempts: 30 };
        assert_eq!(err.to_string(), "snapshot download failed after 30 attempts");
    }
}
