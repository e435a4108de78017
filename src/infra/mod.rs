//! Infrastructure - configuration, metrics, and broker
//!
//! - `config` - Application configuration (TOML loading, defaults, zone registry)
//! - `metrics` - Lock-free metrics collection
//! - `broker` - Optional embedded MQTT broker (rumqttd)

pub mod broker;
pub mod config;
pub mod metrics;

pub use config::{CarrierGateway, Config};
pub use metrics::{Metrics, MetricsSummary};
