//! Per-zone absence tracking
//!
//! The AbsenceTracker owns one `ZoneState` per configured zone and is the only
//! writer of that state. Each detection event moves a zone between two phases:
//! - Normal: a person was seen recently, or the absence is below threshold
//! - Alerting: the absence crossed the threshold and one alert was raised
//!
//! Alerts are handed to the dispatch worker with `try_send` so delivery never
//! stalls event processing.

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::types::{AlertEvent, DetectionEvent, ZoneId};
use crate::infra::metrics::Metrics;
use crate::services::zone_registry::ZoneRegistry;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Phase of a zone's absence state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonePhase {
    Normal,
    Alerting,
}

/// Runtime absence state for one zone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneState {
    elapsed_absence: Duration,
    alerted: bool,
    /// Latest observation time processed for this zone (epoch ms)
    last_observed_at: Option<u64>,
    /// Whether the latest processed observation saw nobody
    absent: bool,
}

impl ZoneState {
    pub fn elapsed_absence(&self) -> Duration {
        self.elapsed_absence
    }

    pub fn alerted(&self) -> bool {
        self.alerted
    }

    pub fn last_observed_at(&self) -> Option<u64> {
        self.last_observed_at
    }

    pub fn phase(&self) -> ZonePhase {
        if self.alerted {
            ZonePhase::Alerting
        } else {
            ZonePhase::Normal
        }
    }

    /// Move the zone clock forward, returning the delta in ms.
    /// Duplicate or out-of-order observations yield 0 and never rewind the clock.
    fn advance_clock(&mut self, observed_at: u64) -> u64 {
        match self.last_observed_at {
            Some(last) => {
                self.last_observed_at = Some(last.max(observed_at));
                observed_at.saturating_sub(last)
            }
            None => {
                self.last_observed_at = Some(observed_at);
                0
            }
        }
    }

    fn observe_presence(&mut self, observed_at: u64) {
        self.advance_clock(observed_at);
        self.elapsed_absence = Duration::ZERO;
        self.alerted = false;
        self.absent = false;
    }

    /// Accumulate absence; the first absent observation of an episode opens it at zero
    fn observe_absence(&mut self, observed_at: u64) {
        let delta_ms = self.advance_clock(observed_at);
        if self.absent {
            self.elapsed_absence += Duration::from_millis(delta_ms);
        }
        self.absent = true;
    }
}

/// Absence-detection state machine for all configured zones
pub struct AbsenceTracker {
    /// Immutable zone configuration (thresholds, destinations)
    pub(crate) registry: Arc<ZoneRegistry>,
    /// Runtime state by zone id
    pub(crate) states: FxHashMap<ZoneId, ZoneState>,
    /// Number of zones currently in the Alerting phase
    pub(crate) alerting: usize,
    /// Metrics collector
    pub(crate) metrics: Arc<Metrics>,
}

impl AbsenceTracker {
    /// Create a tracker with fresh state for every registered zone
    pub fn new(registry: Arc<ZoneRegistry>, metrics: Arc<Metrics>) -> Self {
        let zone_ids: Vec<ZoneId> = registry.zone_ids().cloned().collect();
        let mut tracker =
            Self { registry, states: FxHashMap::default(), alerting: 0, metrics };
        tracker.initialize(zone_ids);
        tracker
    }

    /// Reset the given zones to `{elapsed_absence: 0, alerted: false}`
    ///
    /// Ids the registry does not know are ignored: without a threshold they
    /// could never be evaluated.
    pub fn initialize<I: IntoIterator<Item = ZoneId>>(&mut self, zone_ids: I) {
        for zone_id in zone_ids {
            if self.registry.get(&zone_id).is_none() {
                warn!(zone_id = %zone_id, "initialize_unregistered_zone_ignored");
                continue;
            }
            if let Some(previous) = self.states.insert(zone_id, ZoneState::default()) {
                if previous.alerted {
                    self.alerting = self.alerting.saturating_sub(1);
                }
            }
        }
        self.metrics.set_zones_alerting(self.alerting as u64);
    }

    /// Read-only view of a zone's state
    pub fn state(&self, zone_id: &ZoneId) -> Option<&ZoneState> {
        self.states.get(zone_id)
    }

    pub fn zone_count(&self) -> usize {
        self.states.len()
    }

    pub fn zones_alerting(&self) -> usize {
        self.alerting
    }

    /// Consume detection events until the channel closes or shutdown is signalled
    pub async fn run(
        &mut self,
        mut event_rx: mpsc::Receiver<DetectionEvent>,
        alert_tx: mpsc::Sender<AlertEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(zones = %self.states.len(), "absence_tracker_started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("absence_tracker_shutdown");
                        break;
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(e) => self.process_event(e, &alert_tx),
                        None => break, // Channel closed
                    }
                }
            }
        }
    }

    /// Apply one event and hand off any resulting alert
    pub fn process_event(&mut self, event: DetectionEvent, alert_tx: &mpsc::Sender<AlertEvent>) {
        let process_start = Instant::now();

        match self.record(&event) {
            Ok(Some(alert)) => self.hand_off(alert, alert_tx),
            Ok(None) => {}
            Err(e) => {
                self.metrics.record_unknown_zone();
                error!(zone_id = %event.zone_id, error = %e, "unknown_zone_event");
            }
        }

        self.metrics.set_zones_alerting(self.alerting as u64);
        let latency_us = process_start.elapsed().as_micros() as u64;
        self.metrics.record_event_processed(latency_us);
    }

    fn hand_off(&self, alert: AlertEvent, alert_tx: &mpsc::Sender<AlertEvent>) {
        self.metrics.record_alert_raised();
        info!(
            alert_id = %alert.alert_id,
            zone_id = %alert.zone_id,
            camera_serial = %alert.camera_serial,
            threshold_secs = %alert.threshold.as_secs_f64(),
            triggered_at = %alert.triggered_at,
            "zone_alert_raised"
        );

        if let Err(e) = alert_tx.try_send(alert) {
            self.metrics.record_alert_dropped();
            match e {
                TrySendError::Full(alert) => {
                    warn!(alert_id = %alert.alert_id, zone_id = %alert.zone_id, "alert_dropped: dispatch queue full");
                }
                TrySendError::Closed(alert) => {
                    warn!(alert_id = %alert.alert_id, zone_id = %alert.zone_id, "alert_dropped: dispatch channel closed");
                }
            }
        }
    }
}
