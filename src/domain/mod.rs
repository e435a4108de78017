//! Domain models - zone configuration, detection and alert types, errors
//!
//! - `ZoneConfig` - immutable per-zone thresholds and destinations
//! - `DetectionEvent` - normalized camera observation
//! - `AlertEvent` - raised on an absence threshold crossing
//! - `error` - typed error taxonomy

pub mod error;
pub mod types;

pub use error::{ConfigError, DeliveryError, ParseError, UnknownZoneError};
pub use types::{AlertEvent, CameraSerial, DetectionEvent, SmsRecipient, ZoneConfig, ZoneId};
