//! State transitions for the AbsenceTracker
//!
//! `record` is pure in-memory work: no clocks, no I/O. All time comes from the
//! event's own `observed_at`.

use super::AbsenceTracker;
use crate::domain::error::UnknownZoneError;
use crate::domain::types::{new_uuid_v7, AlertEvent, DetectionEvent, ZoneConfig};
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info};

impl AbsenceTracker {
    /// Apply a detection event to its zone's state
    ///
    /// Returns an alert exactly when the zone's absence first reaches its
    /// threshold within the current episode. Unknown zones leave all state
    /// untouched.
    pub fn record(&mut self, event: &DetectionEvent) -> Result<Option<AlertEvent>, UnknownZoneError> {
        let (Some(state), Some(zone)) =
            (self.states.get_mut(&event.zone_id), self.registry.get(&event.zone_id))
        else {
            return Err(UnknownZoneError(event.zone_id.clone()));
        };

        if event.person_present() {
            let was_alerting = state.alerted;
            state.observe_presence(event.observed_at);
            if was_alerting {
                self.alerting = self.alerting.saturating_sub(1);
                info!(
                    zone_id = %event.zone_id,
                    person_count = %event.person_count,
                    "zone_presence_resumed"
                );
            }
            return Ok(None);
        }

        state.observe_absence(event.observed_at);
        debug!(
            zone_id = %event.zone_id,
            elapsed_ms = %state.elapsed_absence.as_millis(),
            alerted = %state.alerted,
            "zone_absence_observed"
        );

        if state.alerted || state.elapsed_absence < zone.threshold {
            return Ok(None);
        }

        state.alerted = true;
        self.alerting += 1;
        Ok(Some(build_alert(zone, event.observed_at)))
    }
}

fn build_alert(zone: &ZoneConfig, triggered_at: u64) -> AlertEvent {
    AlertEvent {
        alert_id: new_uuid_v7(),
        zone_id: zone.zone_id.clone(),
        camera_serial: zone.camera_serial.clone(),
        threshold: zone.threshold,
        triggered_at,
        message_text: alert_message(zone.threshold, triggered_at),
    }
}

/// Human-readable alert text for email and SMS bodies
pub(crate) fn alert_message(threshold: Duration, triggered_at: u64) -> String {
    format!(
        "Alert generated at {}. A person has not been detected for more than {} seconds.",
        format_epoch_ms(triggered_at),
        format_threshold(threshold)
    )
}

/// `YYYY-MM-DD HH:MM:SS UTC`, falling back to raw epoch ms if out of range
fn format_epoch_ms(ms: u64) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|dt| dt.format(&format).ok())
        .map(|s| format!("{} UTC", s))
        .unwrap_or_else(|| format!("{} ms", ms))
}

fn format_threshold(threshold: Duration) -> String {
    if threshold.subsec_nanos() == 0 {
        threshold.as_secs().to_string()
    } else {
        format!("{}", threshold.as_secs_f64())
    }
}
