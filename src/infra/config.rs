//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/absence.toml).
//! Zones come from `[[zones]]` tables and/or the JSON list named by `zones_file`;
//! the zone registry is validated during load.

use crate::domain::error::ConfigError;
use crate::services::zone_registry::{ZoneEntry, ZoneRegistry};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Minimum spacing between forwarded absence messages per zone (0 = off)
    #[serde(default)]
    pub min_event_interval_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic_prefix: default_topic_prefix(),
            client_id: default_client_id(),
            username: None,
            password: None,
            min_event_interval_ms: 0,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "/merakimv".to_string()
}

fn default_client_id() -> String {
    "absence-watch".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_broker_bind_address(), port: default_mqtt_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MerakiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_meraki_base_url")]
    pub base_url: String,
    #[serde(default = "default_meraki_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for MerakiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_meraki_base_url(),
            timeout_ms: default_meraki_timeout_ms(),
        }
    }
}

fn default_meraki_base_url() -> String {
    "https://api.meraki.com/api/v1".to_string()
}

fn default_meraki_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Request the image at the trigger time instead of the latest frame
    #[serde(default)]
    pub use_trigger_timestamp: bool,
    #[serde(default = "default_snapshot_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_snapshot_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_snapshot_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_trigger_timestamp: false,
            max_attempts: default_snapshot_max_attempts(),
            initial_backoff_ms: default_snapshot_initial_backoff_ms(),
            max_backoff_ms: default_snapshot_max_backoff_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_snapshot_max_attempts() -> u32 {
    30
}

fn default_snapshot_initial_backoff_ms() -> u64 {
    250
}

fn default_snapshot_max_backoff_ms() -> u64 {
    4_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Sender address (defaults to username)
    #[serde(default)]
    pub from: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: None,
        }
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_queue_size")]
    pub queue_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { queue_size: default_dispatch_queue_size() }
    }
}

fn default_dispatch_queue_size() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site identifier used as the Prometheus label
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "absence-watch".to_string()
}

/// Carrier email-to-SMS gateway domains
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CarrierGateway {
    pub sms: String,
    #[serde(default)]
    pub mms: Option<String>,
}

impl CarrierGateway {
    fn new(sms: &str, mms: Option<&str>) -> Self {
        Self { sms: sms.to_string(), mms: mms.map(str::to_string) }
    }

    /// Gateway address for a number, preferring MMS so snapshots survive
    pub fn address_for(&self, number: &str) -> String {
        let domain = self.mms.as_deref().unwrap_or(&self.sms);
        format!("{}@{}", number, domain)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub meraki: MerakiConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub carriers: HashMap<String, CarrierGateway>,
    #[serde(default)]
    pub zones_file: Option<String>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    site_id: String,
    mqtt: MqttConfig,
    broker: BrokerConfig,
    meraki: MerakiConfig,
    snapshot: SnapshotConfig,
    smtp: SmtpConfig,
    dispatch: DispatchConfig,
    metrics: MetricsConfig,
    carriers: HashMap<String, CarrierGateway>,
    zones: Arc<ZoneRegistry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: "default".to_string(),
            site_id: default_site_id(),
            mqtt: MqttConfig::default(),
            broker: BrokerConfig::default(),
            meraki: MerakiConfig::default(),
            snapshot: SnapshotConfig::default(),
            smtp: SmtpConfig::default(),
            dispatch: DispatchConfig::default(),
            metrics: MetricsConfig::default(),
            carriers: Self::default_carriers(),
            zones: Arc::new(ZoneRegistry::default()),
        }
    }
}

impl Config {
    /// Common US carrier gateways; `[carriers.*]` entries override or extend these
    pub fn default_carriers() -> HashMap<String, CarrierGateway> {
        HashMap::from([
            ("att".to_string(), CarrierGateway::new("txt.att.net", Some("mms.att.net"))),
            ("verizon".to_string(), CarrierGateway::new("vtext.com", Some("vzwpix.com"))),
            ("tmobile".to_string(), CarrierGateway::new("tmomail.net", None)),
            ("sprint".to_string(), CarrierGateway::new("messaging.sprintpcs.com", Some("pm.sprint.com"))),
            ("uscellular".to_string(), CarrierGateway::new("email.uscc.net", Some("mms.uscc.net"))),
            ("cricket".to_string(), CarrierGateway::new("sms.cricketwireless.net", Some("mms.cricketwireless.net"))),
            ("boost".to_string(), CarrierGateway::new("sms.myboostmobile.com", Some("myboostmobile.com"))),
        ])
    }

    /// Load configuration from a TOML file, validating the zone registry
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .map_err(|source| ConfigError::Toml { path: path.to_path_buf(), source })?;

        let mut entries = toml_config.zones;
        if let Some(zones_file) = toml_config.zones_file.as_deref() {
            let zones_path = Self::relative_to(path, zones_file);
            entries.extend(ZoneRegistry::read_json_entries(&zones_path)?);
        }
        let zones = ZoneRegistry::load(entries)?;

        let mut carriers = Self::default_carriers();
        for (name, gateway) in toml_config.carriers {
            carriers.insert(name.to_lowercase(), gateway);
        }

        Ok(Self {
            config_file: path.display().to_string(),
            site_id: toml_config.site.id,
            mqtt: toml_config.mqtt,
            broker: toml_config.broker,
            meraki: toml_config.meraki,
            snapshot: toml_config.snapshot,
            smtp: toml_config.smtp,
            dispatch: toml_config.dispatch,
            metrics: toml_config.metrics,
            carriers,
            zones: Arc::new(zones),
        })
    }

    /// Resolve a path relative to the config file's directory
    fn relative_to(config_path: &Path, file: &str) -> PathBuf {
        let file = Path::new(file);
        if file.is_absolute() {
            return file.to_path_buf();
        }
        config_path.parent().map(|dir| dir.join(file)).unwrap_or_else(|| file.to_path_buf())
    }

    /// Look up a carrier gateway (case-insensitive)
    pub fn carrier(&self, name: &str) -> Option<&CarrierGateway> {
        self.carriers.get(&name.to_lowercase())
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn zones(&self) -> &Arc<ZoneRegistry> {
        &self.zones
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn mqtt_topic_prefix(&self) -> &str {
        &self.mqtt.topic_prefix
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt.client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt.password.as_deref()
    }

    pub fn mqtt_min_event_interval_ms(&self) -> u64 {
        self.mqtt.min_event_interval_ms
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker.enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker.bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker.port
    }

    pub fn meraki_api_key(&self) -> &str {
        &self.meraki.api_key
    }

    pub fn meraki_base_url(&self) -> &str {
        &self.meraki.base_url
    }

    pub fn meraki_timeout_ms(&self) -> u64 {
        self.meraki.timeout_ms
    }

    pub fn snapshot(&self) -> &SnapshotConfig {
        &self.snapshot
    }

    pub fn smtp_host(&self) -> &str {
        &self.smtp.host
    }

    pub fn smtp_port(&self) -> u16 {
        self.smtp.port
    }

    pub fn smtp_username(&self) -> &str {
        &self.smtp.username
    }

    pub fn smtp_password(&self) -> &str {
        &self.smtp.password
    }

    pub fn smtp_from(&self) -> &str {
        self.smtp.from.as_deref().unwrap_or(&self.smtp.username)
    }

    pub fn dispatch_queue_size(&self) -> usize {
        self.dispatch.queue_size.max(1)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs.max(1)
    }

    pub fn prometheus_port(&self) -> u16 {
        self.metrics.prometheus_port
    }

    /// Builder method for tests to install a zone registry
    pub fn with_zones(mut self, zones: ZoneRegistry) -> Self {
        self.zones = Arc::new(zones);
        self
    }

    /// Builder method for tests to set the ingress throttle
    pub fn with_min_event_interval_ms(mut self, ms: u64) -> Self {
        self.mqtt.min_event_interval_ms = ms;
        self
    }
}
