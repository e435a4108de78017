//! MQTT client for receiving camera zone detection counts
//!
//! Cameras publish `{"ts": <epoch ms>, "counts": {"person": N, ...}}` on
//! `<prefix>/<camera_serial>/<zone_id>`. Every message is normalized into a
//! `DetectionEvent` and forwarded to the tracker with `try_send`.

use crate::domain::error::ParseError;
use crate::domain::types::{epoch_ms, CameraSerial, DetectionEvent, DetectionMessage, ZoneId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::zone_registry::ZoneRegistry;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, SubscribeFilter};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Detection class counted as presence
const PERSON_CLASS: &str = "person";

/// Skips absence messages that arrive faster than a per-zone minimum interval.
/// Presence messages always pass so a reset is never delayed, and the first
/// absence after a presence always passes so the episode opens on time.
pub struct IngressThrottle {
    min_interval_ms: u64,
    /// Observation time and presence of the last forwarded event per zone
    last_forwarded: FxHashMap<ZoneId, (u64, bool)>,
}

impl IngressThrottle {
    pub fn new(min_interval_ms: u64) -> Self {
        Self { min_interval_ms, last_forwarded: FxHashMap::default() }
    }

    /// Returns true if the event should be forwarded
    pub fn admit(&mut self, event: &DetectionEvent) -> bool {
        if self.min_interval_ms == 0 {
            return true;
        }

        let present = event.person_present();
        if !present {
            if let Some(&(last_at, false)) = self.last_forwarded.get(&event.zone_id) {
                if event.observed_at.saturating_sub(last_at) < self.min_interval_ms {
                    return false;
                }
            }
        }

        self.last_forwarded.insert(event.zone_id.clone(), (event.observed_at, present));
        true
    }
}

/// Time base for one zone's observations, fixed by the zone's first message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZoneClock {
    /// Camera `ts`. Messages without one are placed on the camera clock using
    /// the offset seen on the last stamped message.
    Camera { offset_ms: i64 },
    /// Receive time; any later camera `ts` is ignored
    Receive,
}

/// Signed difference `ts - received_at_ms`, saturating at the i64 range
fn clock_offset(ts: u64, received_at_ms: u64) -> i64 {
    if ts >= received_at_ms {
        i64::try_from(ts - received_at_ms).unwrap_or(i64::MAX)
    } else {
        i64::try_from(received_at_ms - ts).map(|d| -d).unwrap_or(i64::MIN)
    }
}

/// Extract camera serial and zone id from the last two topic segments
pub fn parse_topic(topic: &str) -> Result<(CameraSerial, ZoneId), ParseError> {
    let mut segments = topic.rsplit('/');
    match (segments.next(), segments.next()) {
        (Some(zone), Some(serial)) if !zone.is_empty() && !serial.is_empty() => {
            Ok((CameraSerial::new(serial), ZoneId::new(zone)))
        }
        _ => Err(ParseError::Topic(topic.to_string())),
    }
}

/// Parse a detection payload into (person_count, camera timestamp)
///
/// A missing `person` key means nobody was detected; a missing `counts`
/// object means the message is malformed.
pub fn parse_detection_payload(payload: &[u8]) -> Result<(u64, Option<u64>), ParseError> {
    let json_str = std::str::from_utf8(payload)?;
    let message: DetectionMessage = serde_json::from_str(json_str)?;
    let counts = message.counts.ok_or(ParseError::MissingCounts)?;

    let person_count = match counts.get(PERSON_CLASS) {
        None | Some(serde_json::Value::Null) => 0,
        Some(value) => value.as_u64().ok_or_else(|| ParseError::InvalidCount(value.to_string()))?,
    };

    Ok((person_count, message.ts))
}

/// Turns raw MQTT publishes into detection events for registered zones
pub struct DetectionIngress {
    registry: Arc<ZoneRegistry>,
    throttle: IngressThrottle,
    clocks: FxHashMap<ZoneId, ZoneClock>,
    metrics: Arc<Metrics>,
}

impl DetectionIngress {
    pub fn new(registry: Arc<ZoneRegistry>, min_event_interval_ms: u64, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            throttle: IngressThrottle::new(min_event_interval_ms),
            clocks: FxHashMap::default(),
            metrics,
        }
    }

    /// Observation time on the zone's clock, so deltas never mix camera and host time
    fn observed_at(&mut self, zone_id: &ZoneId, ts: Option<u64>, received_at_ms: u64) -> u64 {
        let clock = self.clocks.entry(zone_id.clone()).or_insert_with(|| match ts {
            Some(ts) => ZoneClock::Camera { offset_ms: clock_offset(ts, received_at_ms) },
            None => ZoneClock::Receive,
        });

        match (clock, ts) {
            (ZoneClock::Camera { offset_ms }, Some(ts)) => {
                *offset_ms = clock_offset(ts, received_at_ms);
                ts
            }
            (ZoneClock::Camera { offset_ms }, None) => {
                debug!(zone_id = %zone_id, offset_ms = %offset_ms, "detection_ts_missing_using_camera_offset");
                received_at_ms.saturating_add_signed(*offset_ms)
            }
            (ZoneClock::Receive, _) => received_at_ms,
        }
    }

    /// Normalize one publish; `None` means the message was dropped (and logged)
    pub fn handle_publish(&mut self, topic: &str, payload: &[u8], received_at_ms: u64) -> Option<DetectionEvent> {
        let (camera_serial, zone_id) = match parse_topic(topic) {
            Ok(ids) => ids,
            Err(e) => {
                self.metrics.record_parse_error();
                warn!(topic = %topic, error = %e, "detection_topic_invalid");
                return None;
            }
        };

        match self.registry.get(&zone_id) {
            Some(zone) if zone.camera_serial == camera_serial => {}
            _ => {
                self.metrics.record_unknown_zone();
                warn!(topic = %topic, zone_id = %zone_id, camera_serial = %camera_serial, "detection_for_unregistered_zone");
                return None;
            }
        }

        let (person_count, ts) = match parse_detection_payload(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.metrics.record_parse_error();
                warn!(topic = %topic, error = %e, "detection_payload_invalid");
                return None;
            }
        };

        let observed_at = self.observed_at(&zone_id, ts, received_at_ms);
        let event = DetectionEvent::new(zone_id, person_count, observed_at);
        if !self.throttle.admit(&event) {
            self.metrics.record_event_throttled();
            return None;
        }

        self.metrics.record_event_received();
        debug!(zone_id = %event.zone_id, person_count = %event.person_count, observed_at = %event.observed_at, "detection_parsed");
        Some(event)
    }
}

/// Subscribe to every zone topic (called on each ConnAck so reconnects resubscribe)
async fn subscribe_all(client: &AsyncClient, topics: &[String]) {
    let filters = topics.iter().map(|t| SubscribeFilter::new(t.clone(), QoS::AtMostOnce));
    match client.subscribe_many(filters).await {
        Ok(()) => info!(topics = ?topics, "mqtt_subscribed"),
        Err(e) => error!(error = %e, "mqtt_subscribe_failed"),
    }
}

/// Start the MQTT client and send detection events to the tracker channel
///
/// Events are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped events are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_client(
    config: &Config,
    event_tx: mpsc::Sender<DetectionEvent>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut mqttoptions =
        MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    // Set credentials if configured
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    let topics = config.zones().topics(config.mqtt_topic_prefix());
    let mut ingress =
        DetectionIngress::new(config.zones().clone(), config.mqtt_min_event_interval_ms(), metrics.clone());

    info!(host = %config.mqtt_host(), port = %config.mqtt_port(), zones = %topics.len(), "mqtt_client_starting");

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn =
        Instant::now().checked_sub(Duration::from_secs(2)).unwrap_or_else(Instant::now);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    let _ = client.disconnect().await;
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(event) = ingress.handle_publish(&publish.topic, &publish.payload, epoch_ms()) {
                            if let Err(e) = event_tx.try_send(event) {
                                match e {
                                    TrySendError::Full(_) => {
                                        metrics.record_event_dropped();
                                        if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                            warn!("mqtt_event_dropped: channel full");
                                            last_drop_warn = Instant::now();
                                        }
                                    }
                                    TrySendError::Closed(_) => {
                                        warn!("mqtt_event_channel_closed");
                                        return Ok(());
                                    }
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                        subscribe_all(&client, &topics).await;
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        debug!(pkid = %ack.pkid, "mqtt_suback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::absence_tracker::AbsenceTracker;
    use crate::services::zone_registry::{IdValue, ZoneEntry};

    fn zone_entry(threshold_secs: f64) -> ZoneEntry {
        ZoneEntry {
            camera_serial: Some(IdValue::Text("Q2GV-AAAA-BBBB".to_string())),
            zone_id: Some(IdValue::Number(582794355)),
            age_threshold_seconds: Some(threshold_secs),
            ..Default::default()
        }
    }

    fn registry() -> Arc<ZoneRegistry> {
        Arc::new(ZoneRegistry::load(vec![zone_entry(60.0)]).unwrap())
    }

    fn ingress(min_interval_ms: u64) -> DetectionIngress {
        DetectionIngress::new(registry(), min_interval_ms, Arc::new(Metrics::new()))
    }

    const TOPIC: &str = "/merakimv/Q2GV-AAAA-BBBB/582794355";

    #[test]
    fn test_parse_topic() {
        let (serial, zone) = parse_topic(TOPIC).unwrap();
        assert_eq!(serial.as_str(), "Q2GV-AAAA-BBBB");
        assert_eq!(zone.as_str(), "582794355");

        assert!(parse_topic("zone-only").is_err());
        assert!(parse_topic("/merakimv/serial/").is_err());
    }

    #[test]
    fn test_parse_payload_with_person() {
        let (count, ts) =
            parse_detection_payload(br#"{"ts": 1767630090048, "counts": {"person": 3}}"#).unwrap();
        assert_eq!(count, 3);
        assert_eq!(ts, Some(1767630090048));
    }

    #[test]
    fn test_parse_payload_defaults_to_zero() {
        assert_eq!(parse_detection_payload(br#"{"counts": {}}"#).unwrap(), (0, None));
        assert_eq!(parse_detection_payload(br#"{"counts": {"vehicle": 2}}"#).unwrap(), (0, None));
        assert_eq!(parse_detection_payload(br#"{"counts": {"person": null}}"#).unwrap().0, 0);
    }

    #[test]
    fn test_parse_payload_errors() {
        assert!(matches!(parse_detection_payload(b"not json"), Err(ParseError::Json(_))));
        assert!(matches!(parse_detection_payload(br#"{"ts": 1}"#), Err(ParseError::MissingCounts)));
        assert!(matches!(
            parse_detection_payload(br#"{"counts": {"person": -1}}"#),
            Err(ParseError::InvalidCount(_))
        ));
        assert!(matches!(parse_detection_payload(&[0xff, 0xfe]), Err(ParseError::Utf8(_))));
    }

    #[test]
    fn test_handle_publish_normalizes_event() {
        let mut ingress = ingress(0);
        let event = ingress
            .handle_publish(TOPIC, br#"{"ts": 5000, "counts": {"person": 0}}"#, 9999)
            .unwrap();
        assert_eq!(event, DetectionEvent::new(ZoneId::new("582794355"), 0, 5000));

        assert_eq!(ingress.metrics.snapshot().events_received, 1);
    }

    #[test]
    fn test_zone_without_ts_uses_receive_time() {
        let mut ingress = ingress(0);
        let event = ingress.handle_publish(TOPIC, br#"{"counts": {"person": 1}}"#, 9_999).unwrap();
        assert_eq!(event.observed_at, 9_999);

        // The zone stays on the receive clock even if the camera starts sending ts
        let event = ingress
            .handle_publish(TOPIC, br#"{"ts": 3600000, "counts": {"person": 0}}"#, 10_999)
            .unwrap();
        assert_eq!(event.observed_at, 10_999);
    }

    #[test]
    fn test_camera_clock_kept_when_ts_missing() {
        // Camera clock runs an hour ahead of the host
        let mut ingress = ingress(0);
        let skew = 3_600_000;
        let event = ingress
            .handle_publish(TOPIC, format!(r#"{{"ts": {}, "counts": {{}}}}"#, skew + 1_000).as_bytes(), 1_000)
            .unwrap();
        assert_eq!(event.observed_at, skew + 1_000);

        // No ts: placed on the camera clock, not the host clock
        let event = ingress.handle_publish(TOPIC, br#"{"counts": {}}"#, 1_500).unwrap();
        assert_eq!(event.observed_at, skew + 1_500);
    }

    #[test]
    fn test_mixed_timestamps_do_not_inflate_absence() {
        // Camera behind the host by 10 minutes; one message loses its ts
        let config = Config::default()
            .with_zones(ZoneRegistry::load(vec![zone_entry(60.0)]).unwrap());
        let metrics = Arc::new(Metrics::new());
        let mut ingress =
            DetectionIngress::new(config.zones().clone(), config.mqtt_min_event_interval_ms(), metrics.clone());
        let mut tracker = AbsenceTracker::new(config.zones().clone(), metrics);
        let host = 1_000_000_000;
        let camera = host - 600_000;

        let first = ingress
            .handle_publish(TOPIC, format!(r#"{{"ts": {}, "counts": {{}}}}"#, camera).as_bytes(), host)
            .unwrap();
        assert!(tracker.record(&first).unwrap().is_none());

        let second = ingress.handle_publish(TOPIC, br#"{"counts": {}}"#, host + 1_000).unwrap();
        assert!(tracker.record(&second).unwrap().is_none());

        let elapsed = tracker.state(&ZoneId::new("582794355")).unwrap().elapsed_absence();
        assert_eq!(elapsed, Duration::from_secs(1));
    }

    #[test]
    fn test_handle_publish_drops_bad_messages() {
        let mut ingress = ingress(0);

        assert!(ingress.handle_publish(TOPIC, b"{", 0).is_none());
        assert!(ingress.handle_publish("/merakimv/Q2GV-AAAA-BBBB/999", br#"{"counts": {}}"#, 0).is_none());
        // Right zone, wrong camera
        assert!(ingress.handle_publish("/merakimv/OTHER/582794355", br#"{"counts": {}}"#, 0).is_none());

        let summary = ingress.metrics.snapshot();
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.unknown_zone_events, 2);

        // Subsequent good messages still flow
        assert!(ingress.handle_publish(TOPIC, br#"{"counts": {}}"#, 1).is_some());
    }

    #[test]
    fn test_throttle_skips_fast_absence_only() {
        let mut throttle = IngressThrottle::new(1_000);
        let zone = ZoneId::new("Z1");

        assert!(throttle.admit(&DetectionEvent::new(zone.clone(), 0, 0)));
        assert!(!throttle.admit(&DetectionEvent::new(zone.clone(), 0, 200)));
        assert!(throttle.admit(&DetectionEvent::new(zone.clone(), 2, 400)));
        // First absence after a presence always passes
        assert!(throttle.admit(&DetectionEvent::new(zone.clone(), 0, 900)));
        assert!(!throttle.admit(&DetectionEvent::new(zone.clone(), 0, 1_400)));
        assert!(throttle.admit(&DetectionEvent::new(zone.clone(), 0, 1_900)));

        // Other zones are independent
        assert!(throttle.admit(&DetectionEvent::new(ZoneId::new("Z2"), 0, 1_500)));
    }

    #[test]
    fn test_throttle_disabled() {
        let mut throttle = IngressThrottle::new(0);
        let zone = ZoneId::new("Z1");
        for t in 0..5 {
            assert!(throttle.admit(&DetectionEvent::new(zone.clone(), 0, t)));
        }
    }

    #[test]
    fn test_handle_publish_counts_throttled() {
        let mut ingress = ingress(1_000);
        assert!(ingress.handle_publish(TOPIC, br#"{"ts": 0, "counts": {}}"#, 0).is_some());
        assert!(ingress.handle_publish(TOPIC, br#"{"ts": 10, "counts": {}}"#, 0).is_none());
        assert_eq!(ingress.metrics.snapshot().events_throttled, 1);
    }

    #[test]
    fn test_throttled_ingress_alerts_on_time() {
        // Presence at t=0, then absence every 100 ms; threshold 2 s, throttle 1 s
        let config = Config::default()
            .with_zones(ZoneRegistry::load(vec![zone_entry(2.0)]).unwrap())
            .with_min_event_interval_ms(1_000);
        let metrics = Arc::new(Metrics::new());
        let mut ingress =
            DetectionIngress::new(config.zones().clone(), config.mqtt_min_event_interval_ms(), metrics.clone());
        let mut tracker = AbsenceTracker::new(config.zones().clone(), metrics.clone());

        let messages = std::iter::once((0u64, 1u64)).chain((1..=30).map(|i| (i * 100, 0)));
        let mut alerts = Vec::new();
        for (t, person) in messages {
            let payload = format!(r#"{{"ts": {}, "counts": {{"person": {}}}}}"#, t, person);
            if let Some(event) = ingress.handle_publish(TOPIC, payload.as_bytes(), t) {
                if let Some(alert) = tracker.record(&event).unwrap() {
                    alerts.push(alert);
                }
            }
        }

        // Same instant as an unthrottled stream: episode opens at 100, crosses at 2100
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].triggered_at, 2_100);
        assert!(metrics.snapshot().events_throttled > 0);
    }
}
