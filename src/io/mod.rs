//! IO modules - external system interfaces
//!
//! - `mqtt` - MQTT client receiving camera detection messages
//! - `snapshot` - Meraki dashboard snapshot client
//! - `mailer` - SMTP delivery for email and carrier gateways
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod mailer;
pub mod mqtt;
pub mod prometheus;
pub mod snapshot;

pub use mailer::SmtpMailer;
pub use mqtt::{start_mqtt_client, DetectionIngress};
pub use snapshot::{MerakiSnapshotClient, RetryPolicy};
