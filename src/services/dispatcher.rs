//! Notification dispatcher - delivers alerts off the tracker path
//!
//! The tracker enqueues `AlertEvent`s; the `DispatchWorker` spawns one delivery
//! task per alert so a slow snapshot or SMTP server never holds up the next
//! alert. Snapshot retrieval and message delivery sit behind the
//! `SnapshotSource` and `AlertSender` traits.

use crate::domain::error::DeliveryError;
use crate::domain::types::{AlertEvent, CameraSerial, ZoneConfig};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const NOTE_NOT_REQUESTED: &str = " (snapshot unsuccessfully requested)";
const NOTE_NOT_RETRIEVED: &str = " (snapshot unsuccessfully retrieved)";

/// Camera image attached to an alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Source of camera snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch an image from `camera`, at `at` (epoch ms) or the latest frame
    async fn fetch(&self, camera: &CameraSerial, at: Option<u64>) -> Result<Snapshot, DeliveryError>;
}

/// Delivery channel for alert messages
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        snapshot: Option<&Snapshot>,
    ) -> Result<(), DeliveryError>;
}

/// Result of one alert delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub snapshot_attached: bool,
    pub sent: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    /// Zone registry and carrier gateway table
    config: Config,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    use_trigger_timestamp: bool,
    sender: Arc<dyn AlertSender>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    /// `snapshots` is `None` when snapshot retrieval is disabled
    pub fn new(
        config: &Config,
        snapshots: Option<Arc<dyn SnapshotSource>>,
        sender: Arc<dyn AlertSender>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config: config.clone(),
            snapshots,
            use_trigger_timestamp: config.snapshot().use_trigger_timestamp,
            sender,
            metrics,
        }
    }

    /// Email addresses first, then SMS gateway addresses
    ///
    /// Recipients on a carrier missing from the gateway table are skipped.
    pub fn destinations(&self, zone: &ZoneConfig) -> Vec<String> {
        let mut out = zone.email_recipients.clone();
        for sms in &zone.sms_recipients {
            match self.config.carrier(&sms.carrier) {
                Some(gateway) => out.push(gateway.address_for(&sms.number)),
                None => {
                    let err = DeliveryError::UnsupportedCarrier(sms.carrier.clone());
                    warn!(zone_id = %zone.zone_id, number = %sms.number, error = %err, "sms_recipient_skipped");
                }
            }
        }
        out
    }

    /// Fetch a snapshot and send the alert to every destination of its zone
    pub async fn dispatch(&self, alert: &AlertEvent) -> DispatchReport {
        let start = Instant::now();
        let mut report = DispatchReport::default();

        let Some(zone) = self.config.zones().get(&alert.zone_id) else {
            warn!(alert_id = %alert.alert_id, zone_id = %alert.zone_id, "dispatch_zone_not_configured");
            return report;
        };

        let destinations = self.destinations(zone);
        if destinations.is_empty() {
            warn!(alert_id = %alert.alert_id, zone_id = %alert.zone_id, "alert_has_no_destinations");
            return report;
        }

        let mut body = alert.message_text.clone();
        let snapshot = match &self.snapshots {
            Some(source) => {
                let at = self.use_trigger_timestamp.then_some(alert.triggered_at);
                match source.fetch(&alert.camera_serial, at).await {
                    Ok(snapshot) => Some(snapshot),
                    Err(e) => {
                        self.metrics.record_snapshot_failure();
                        warn!(
                            alert_id = %alert.alert_id,
                            camera_serial = %alert.camera_serial,
                            error = %e,
                            "snapshot_failed"
                        );
                        body.push_str(snapshot_note(&e));
                        None
                    }
                }
            }
            None => None,
        };
        report.snapshot_attached = snapshot.is_some();

        let subject = alert_subject(alert);
        for recipient in &destinations {
            match self.sender.send(recipient, &subject, &body, snapshot.as_ref()).await {
                Ok(()) => {
                    report.sent += 1;
                    self.metrics.record_delivery_sent();
                    debug!(alert_id = %alert.alert_id, recipient = %recipient, "alert_delivered");
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.record_delivery_failed();
                    warn!(
                        alert_id = %alert.alert_id,
                        recipient = %recipient,
                        error = %e,
                        "alert_delivery_failed"
                    );
                }
            }
        }

        info!(
            alert_id = %alert.alert_id,
            zone_id = %alert.zone_id,
            sent = %report.sent,
            failed = %report.failed,
            snapshot = %report.snapshot_attached,
            elapsed_ms = %start.elapsed().as_millis(),
            "alert_dispatched"
        );
        report
    }
}

pub fn alert_subject(alert: &AlertEvent) -> String {
    format!("Absence alert - {} ({})", alert.zone_id, alert.camera_serial)
}

/// Suffix appended to the message body when no snapshot could be attached
fn snapshot_note(err: &DeliveryError) -> &'static str {
    match err {
        DeliveryError::SnapshotDownload { .. } => NOTE_NOT_RETRIEVED,
        _ => NOTE_NOT_REQUESTED,
    }
}

/// Worker that receives alerts and spawns a delivery task for each
pub struct DispatchWorker {
    dispatcher: Arc<Dispatcher>,
    alert_rx: mpsc::Receiver<AlertEvent>,
}

impl DispatchWorker {
    pub fn new(dispatcher: Arc<Dispatcher>, alert_rx: mpsc::Receiver<AlertEvent>) -> Self {
        Self { dispatcher, alert_rx }
    }

    /// Run until the alert channel closes
    pub async fn run(mut self) {
        info!("dispatch_worker_started");

        while let Some(alert) = self.alert_rx.recv().await {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(&alert).await;
            });
        }

        info!("dispatch_worker_stopped");
    }
}

/// Create the alert channel and its worker
pub fn create_dispatch_worker(
    dispatcher: Arc<Dispatcher>,
    buffer: usize,
) -> (mpsc::Sender<AlertEvent>, DispatchWorker) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (tx, DispatchWorker::new(dispatcher, rx))
}
