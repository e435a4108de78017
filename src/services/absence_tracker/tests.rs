//! Tests for the AbsenceTracker module

use super::*;
use crate::domain::error::UnknownZoneError;
use crate::services::zone_registry::{IdValue, ZoneEntry};

const SEC: u64 = 1_000;

fn zone_entry(zone: &str, threshold_secs: f64) -> ZoneEntry {
    ZoneEntry {
        camera_serial: Some(IdValue::Text(format!("Q2-{}", zone))),
        zone_id: Some(IdValue::Text(zone.to_string())),
        age_threshold_seconds: Some(threshold_secs),
        email: vec!["ops@example.com".to_string()],
        text: vec![],
    }
}

fn create_tracker(zones: &[(&str, f64)]) -> AbsenceTracker {
    let entries = zones.iter().map(|(z, t)| zone_entry(z, *t)).collect();
    let registry = Arc::new(ZoneRegistry::load(entries).unwrap());
    AbsenceTracker::new(registry, Arc::new(Metrics::new()))
}

fn zone(id: &str) -> ZoneId {
    ZoneId::new(id)
}

fn absent(id: &str, at_secs: u64) -> DetectionEvent {
    DetectionEvent::new(zone(id), 0, at_secs * SEC)
}

fn present(id: &str, at_secs: u64) -> DetectionEvent {
    DetectionEvent::new(zone(id), 1, at_secs * SEC)
}

#[test]
fn test_initialize_leaves_zones_clean() {
    let tracker = create_tracker(&[("Z1", 10.0), ("Z2", 5.0)]);

    assert_eq!(tracker.zone_count(), 2);
    for id in ["Z1", "Z2"] {
        let state = tracker.state(&zone(id)).unwrap();
        assert_eq!(state.elapsed_absence(), Duration::ZERO);
        assert!(!state.alerted());
        assert_eq!(state.phase(), ZonePhase::Normal);
    }
    assert_eq!(tracker.zones_alerting(), 0);
}

#[test]
fn test_initialize_resets_alerting_zone() {
    let mut tracker = create_tracker(&[("Z1", 1.0)]);
    tracker.record(&absent("Z1", 0)).unwrap();
    assert!(tracker.record(&absent("Z1", 2)).unwrap().is_some());
    assert_eq!(tracker.zones_alerting(), 1);

    tracker.initialize([zone("Z1"), zone("unregistered")]);

    assert_eq!(tracker.state(&zone("Z1")), Some(&ZoneState::default()));
    assert!(tracker.state(&zone("unregistered")).is_none());
    assert_eq!(tracker.zones_alerting(), 0);
}

#[test]
fn test_scenario_reset_baseline() {
    // threshold 10s: absence at t=0 and t=12 alerts, presence at t=13 resets,
    // absence at t=25 opens a new episode rather than continuing from t=0
    let mut tracker = create_tracker(&[("Z1", 10.0)]);

    assert_eq!(tracker.record(&absent("Z1", 0)).unwrap(), None);

    let alert = tracker.record(&absent("Z1", 12)).unwrap().expect("alert at t=12");
    assert_eq!(alert.zone_id, zone("Z1"));
    assert_eq!(alert.triggered_at, 12 * SEC);
    assert_eq!(alert.threshold, Duration::from_secs(10));
    assert!(alert.message_text.contains("more than 10 seconds"));
    assert_eq!(tracker.state(&zone("Z1")).unwrap().phase(), ZonePhase::Alerting);

    assert_eq!(tracker.record(&present("Z1", 13)).unwrap(), None);
    let state = tracker.state(&zone("Z1")).unwrap();
    assert_eq!(state.elapsed_absence(), Duration::ZERO);
    assert!(!state.alerted());

    assert_eq!(tracker.record(&absent("Z1", 25)).unwrap(), None);
    assert_eq!(tracker.state(&zone("Z1")).unwrap().elapsed_absence(), Duration::ZERO);
}

#[test]
fn test_alert_fires_on_threshold_crossing_only_once() {
    let mut tracker = create_tracker(&[("Z1", 5.0)]);
    let mut fired_at = Vec::new();

    for t in 0..=20 {
        if let Some(alert) = tracker.record(&absent("Z1", t)).unwrap() {
            fired_at.push(alert.triggered_at);
        }
    }

    // Episode opens at t=0, cumulative absence reaches 5s at t=5
    assert_eq!(fired_at, vec![5 * SEC]);
    assert_eq!(tracker.state(&zone("Z1")).unwrap().elapsed_absence(), Duration::from_secs(20));
}

#[test]
fn test_presence_resets_from_any_state() {
    let mut tracker = create_tracker(&[("Z1", 3.0)]);

    // Mid-episode, below threshold
    tracker.record(&absent("Z1", 0)).unwrap();
    tracker.record(&absent("Z1", 2)).unwrap();
    tracker.record(&present("Z1", 3)).unwrap();
    assert_eq!(tracker.state(&zone("Z1")), Some(&ZoneState {
        elapsed_absence: Duration::ZERO,
        alerted: false,
        last_observed_at: Some(3 * SEC),
        absent: false,
    }));

    // Alerting
    tracker.record(&absent("Z1", 4)).unwrap();
    assert!(tracker.record(&absent("Z1", 8)).unwrap().is_some());
    tracker.record(&present("Z1", 9)).unwrap();
    let state = tracker.state(&zone("Z1")).unwrap();
    assert_eq!(state.elapsed_absence(), Duration::ZERO);
    assert!(!state.alerted());
    assert_eq!(tracker.zones_alerting(), 0);

    // Presence while already normal stays normal
    tracker.record(&present("Z1", 10)).unwrap();
    assert_eq!(tracker.state(&zone("Z1")).unwrap().phase(), ZonePhase::Normal);
}

#[test]
fn test_one_alert_per_episode() {
    let mut tracker = create_tracker(&[("Z1", 2.0)]);
    let mut alerts = 0;

    // Three absence episodes separated by presence
    for episode in 0..3u64 {
        let base = episode * 100;
        for t in 0..10 {
            if tracker.record(&absent("Z1", base + t)).unwrap().is_some() {
                alerts += 1;
            }
        }
        tracker.record(&present("Z1", base + 50)).unwrap();
    }

    assert_eq!(alerts, 3);
}

#[test]
fn test_duplicate_event_does_not_double_count() {
    let mut tracker = create_tracker(&[("Z1", 10.0)]);

    tracker.record(&absent("Z1", 0)).unwrap();
    tracker.record(&absent("Z1", 4)).unwrap();
    tracker.record(&absent("Z1", 4)).unwrap();

    assert_eq!(tracker.state(&zone("Z1")).unwrap().elapsed_absence(), Duration::from_secs(4));
}

#[test]
fn test_out_of_order_event_does_not_rewind_clock() {
    let mut tracker = create_tracker(&[("Z1", 10.0)]);

    tracker.record(&absent("Z1", 0)).unwrap();
    tracker.record(&absent("Z1", 6)).unwrap();
    tracker.record(&absent("Z1", 3)).unwrap();
    tracker.record(&absent("Z1", 8)).unwrap();

    let state = tracker.state(&zone("Z1")).unwrap();
    assert_eq!(state.elapsed_absence(), Duration::from_secs(8));
    assert_eq!(state.last_observed_at(), Some(8 * SEC));
}

#[test]
fn test_elapsed_uses_real_deltas() {
    // Irregular cadence: the threshold is crossed by wall time, not message count
    let mut tracker = create_tracker(&[("Z1", 60.0)]);

    assert!(tracker.record(&absent("Z1", 0)).unwrap().is_none());
    assert!(tracker.record(&absent("Z1", 1)).unwrap().is_none());
    let alert = tracker.record(&absent("Z1", 90)).unwrap();
    assert!(alert.is_some());
}

#[test]
fn test_sub_second_thresholds() {
    let mut tracker = create_tracker(&[("Z1", 0.5)]);

    tracker.record(&DetectionEvent::new(zone("Z1"), 0, 1_000)).unwrap();
    assert!(tracker.record(&DetectionEvent::new(zone("Z1"), 0, 1_400)).unwrap().is_none());
    assert!(tracker.record(&DetectionEvent::new(zone("Z1"), 0, 1_500)).unwrap().is_some());
}

#[test]
fn test_unknown_zone_rejected_without_mutation() {
    let mut tracker = create_tracker(&[("Z1", 10.0)]);
    tracker.record(&absent("Z1", 0)).unwrap();
    let before = tracker.state(&zone("Z1")).cloned();

    let err = tracker.record(&absent("nope", 5)).unwrap_err();

    assert_eq!(err, UnknownZoneError(zone("nope")));
    assert_eq!(tracker.state(&zone("Z1")).cloned(), before);
    assert!(tracker.state(&zone("nope")).is_none());
}

#[test]
fn test_zones_are_independent() {
    let mut tracker = create_tracker(&[("Z1", 5.0), ("Z2", 5.0)]);

    tracker.record(&absent("Z1", 0)).unwrap();
    tracker.record(&absent("Z2", 0)).unwrap();
    tracker.record(&present("Z2", 3)).unwrap();

    assert!(tracker.record(&absent("Z1", 6)).unwrap().is_some());
    assert!(tracker.record(&absent("Z2", 6)).unwrap().is_none());
    assert_eq!(tracker.zones_alerting(), 1);
}

#[tokio::test]
async fn test_process_event_hands_off_alert() {
    let mut tracker = create_tracker(&[("Z1", 1.0)]);
    let (alert_tx, mut alert_rx) = mpsc::channel(4);

    tracker.process_event(absent("Z1", 0), &alert_tx);
    tracker.process_event(absent("Z1", 1), &alert_tx);
    tracker.process_event(absent("Z1", 2), &alert_tx);

    let alert = alert_rx.try_recv().expect("one alert queued");
    assert_eq!(alert.camera_serial.as_str(), "Q2-Z1");
    assert!(alert_rx.try_recv().is_err());
    assert_eq!(tracker.metrics.alerts_raised(), 1);
    assert_eq!(tracker.metrics.events_processed(), 3);
}

#[tokio::test]
async fn test_full_dispatch_queue_never_blocks() {
    let mut tracker = create_tracker(&[("Z1", 1.0), ("Z2", 1.0)]);
    let (alert_tx, mut alert_rx) = mpsc::channel(1);

    for id in ["Z1", "Z2"] {
        tracker.process_event(absent(id, 0), &alert_tx);
        tracker.process_event(absent(id, 5), &alert_tx);
    }

    // Second alert is dropped, state still records the alert
    assert!(alert_rx.try_recv().is_ok());
    assert!(alert_rx.try_recv().is_err());
    assert!(tracker.state(&zone("Z2")).unwrap().alerted());
    assert_eq!(tracker.metrics.snapshot().alerts_dropped, 1);
}

#[tokio::test]
async fn test_process_event_unknown_zone_counted() {
    let mut tracker = create_tracker(&[("Z1", 1.0)]);
    let (alert_tx, _alert_rx) = mpsc::channel(1);

    tracker.process_event(absent("ghost", 0), &alert_tx);

    assert_eq!(tracker.metrics.snapshot().unknown_zone_events, 1);
}

#[tokio::test]
async fn test_run_until_channel_closes() {
    let mut tracker = create_tracker(&[("Z1", 2.0)]);
    let (event_tx, event_rx) = mpsc::channel(16);
    let (alert_tx, mut alert_rx) = mpsc::channel(4);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    for t in [0, 1, 2, 3] {
        event_tx.send(absent("Z1", t)).await.unwrap();
    }
    drop(event_tx);

    tracker.run(event_rx, alert_tx, shutdown_rx).await;

    let alert = alert_rx.recv().await.expect("alert delivered");
    assert_eq!(alert.triggered_at, 2 * SEC);
    assert!(alert_rx.recv().await.is_none());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let mut tracker = create_tracker(&[("Z1", 2.0)]);
    let (_event_tx, event_rx) = mpsc::channel::<DetectionEvent>(16);
    let (alert_tx, _alert_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), tracker.run(event_rx, alert_tx, shutdown_rx))
        .await
        .expect("tracker stops on shutdown");
}
