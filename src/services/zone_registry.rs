//! Zone registry - static zone_id -> ZoneConfig mapping loaded once at startup
//!
//! Entries come from `[[zones]]` tables in the TOML config and/or a JSON camera
//! list (`CAMERA_SERIAL`, `ZONE_ID`, `AGE_THRESHOLD`, `email`, `text` keys).
//! Validation happens here so every configuration mistake is a `ConfigError`.

use crate::domain::error::ConfigError;
use crate::domain::types::{CameraSerial, SmsRecipient, ZoneConfig, ZoneId};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Identifier that may be written as a string or a bare number
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Text(String),
    Number(u64),
}

impl IdValue {
    fn into_string(self) -> String {
        match self {
            IdValue::Text(s) => s,
            IdValue::Number(n) => n.to_string(),
        }
    }
}

/// Text recipient, either `["5551234567", "verizon"]` or `"5551234567-verizon"`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TextRecipient {
    Pair(String, String),
    Joined(String),
}

/// Raw zone entry as written in configuration, validated by `ZoneRegistry::load`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoneEntry {
    #[serde(default, alias = "CAMERA_SERIAL")]
    pub camera_serial: Option<IdValue>,
    #[serde(default, alias = "ZONE_ID")]
    pub zone_id: Option<IdValue>,
    #[serde(default, alias = "AGE_THRESHOLD")]
    pub age_threshold_seconds: Option<f64>,
    #[serde(default)]
    pub email: Vec<String>,
    #[serde(default)]
    pub text: Vec<TextRecipient>,
}

/// Read-only registry of configured zones
#[derive(Debug, Clone, Default)]
pub struct ZoneRegistry {
    zones: FxHashMap<ZoneId, ZoneConfig>,
    /// Zone ids in configuration order
    order: Vec<ZoneId>,
}

impl ZoneRegistry {
    /// Validate raw entries and build the registry
    pub fn load(entries: Vec<ZoneEntry>) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::NoZones);
        }

        let mut zones = FxHashMap::default();
        let mut order = Vec::with_capacity(entries.len());

        for (index, entry) in entries.into_iter().enumerate() {
            let config = Self::validate(index, entry)?;
            if zones.contains_key(&config.zone_id) {
                return Err(ConfigError::DuplicateZone { zone_id: config.zone_id.0 });
            }
            order.push(config.zone_id.clone());
            zones.insert(config.zone_id.clone(), config);
        }

        Ok(Self { zones, order })
    }

    /// Read raw entries from a JSON camera list
    pub fn read_json_entries<P: AsRef<Path>>(path: P) -> Result<Vec<ZoneEntry>, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_json::from_str(&content)
            .map_err(|source| ConfigError::Json { path: path.to_path_buf(), source })
    }

    /// Load a registry from a JSON camera list
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load(Self::read_json_entries(path)?)
    }

    fn validate(index: usize, entry: ZoneEntry) -> Result<ZoneConfig, ConfigError> {
        let camera_serial = entry
            .camera_serial
            .map(IdValue::into_string)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingField { index, field: "camera_serial" })?;
        let zone_id = entry
            .zone_id
            .map(IdValue::into_string)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingField { index, field: "zone_id" })?;
        let seconds = entry
            .age_threshold_seconds
            .ok_or(ConfigError::MissingField { index, field: "age_threshold_seconds" })?;

        let threshold = Duration::try_from_secs_f64(seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ConfigError::InvalidThreshold { zone_id: zone_id.clone(), value: seconds })?;

        let sms_recipients = entry
            .text
            .into_iter()
            .map(|t| parse_text_recipient(&zone_id, t))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ZoneConfig {
            zone_id: ZoneId(zone_id),
            camera_serial: CameraSerial(camera_serial),
            threshold,
            email_recipients: entry.email,
            sms_recipients,
        })
    }

    /// Look up a zone's configuration
    pub fn get(&self, zone_id: &ZoneId) -> Option<&ZoneConfig> {
        self.zones.get(zone_id)
    }

    /// Zone ids in configuration order
    pub fn zone_ids(&self) -> impl Iterator<Item = &ZoneId> {
        self.order.iter()
    }

    /// Zone configs in configuration order
    pub fn zones(&self) -> impl Iterator<Item = &ZoneConfig> {
        self.order.iter().filter_map(|id| self.zones.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// One subscription topic per zone: `<prefix>/<camera_serial>/<zone_id>`
    pub fn topics(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.trim_end_matches('/');
        self.zones()
            .map(|z| format!("{}/{}/{}", prefix, z.camera_serial, z.zone_id))
            .collect()
    }
}

fn parse_text_recipient(zone_id: &str, recipient: TextRecipient) -> Result<SmsRecipient, ConfigError> {
    let (number, carrier) = match recipient {
        TextRecipient::Pair(number, carrier) => (number, carrier),
        TextRecipient::Joined(value) => match value.split_once('-') {
            Some((number, carrier)) => (number.to_string(), carrier.to_string()),
            None => {
                return Err(ConfigError::InvalidSmsRecipient { zone_id: zone_id.to_string(), value })
            }
        },
    };

    let number = number.trim().to_string();
    let carrier = carrier.trim().to_lowercase();
    if number.is_empty() || carrier.is_empty() {
        return Err(ConfigError::InvalidSmsRecipient {
            zone_id: zone_id.to_string(),
            value: format!("{}-{}", number, carrier),
        });
    }

    Ok(SmsRecipient { number, carrier })
}
