//! End-to-end ingress through the embedded broker

use absence_watch::domain::types::{DetectionEvent, ZoneId};
use absence_watch::infra::broker::start_embedded_broker;
use absence_watch::infra::{Config, Metrics};
use absence_watch::io::start_mqtt_client;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config_with_broker(port: u16) -> (NamedTempFile, Config) {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[mqtt]
host = "127.0.0.1"
port = {port}
client_id = "absence-watch-test"

[broker]
enabled = true
bind_address = "127.0.0.1"
port = {port}

[[zones]]
camera_serial = "Q2AA"
zone_id = "Z1"
age_threshold_seconds = 5
"#
    )
    .unwrap();
    file.flush().unwrap();
    let config = Config::from_file(file.path()).unwrap();
    (file, config)
}

fn camera(port: u16) -> AsyncClient {
    let options = MqttOptions::new("camera-Q2AA", "127.0.0.1", port);
    let (client, mut eventloop) = AsyncClient::new(options, 100);
    tokio::spawn(async move {
        loop {
            if eventloop.poll().await.is_err() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    });
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detection_flows_through_embedded_broker() {
    let port = free_port();
    let (_file, config) = config_with_broker(port);

    let (event_tx, mut event_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Ingress starts before the broker: the first connect fails and is retried,
    // and the subscription is made on the ConnAck that follows.
    let ingress_config = config.clone();
    let ingress_metrics = metrics.clone();
    let ingress = tokio::spawn(async move {
        start_mqtt_client(&ingress_config, event_tx, ingress_metrics, shutdown_rx).await.is_ok()
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let listen = start_embedded_broker(&config).unwrap();
    assert_eq!(listen.port(), port);

    let camera = camera(port);
    let event = timeout(Duration::from_secs(15), async {
        loop {
            camera
                .publish("/merakimv/Q2AA/Z1", QoS::AtMostOnce, false, r#"{"ts": 42000, "counts": {"person": 0}}"#)
                .await
                .unwrap();
            if let Ok(Some(event)) = timeout(Duration::from_millis(250), event_rx.recv()).await {
                break event;
            }
        }
    })
    .await
    .expect("no detection event arrived through the broker");

    assert_eq!(event, DetectionEvent::new(ZoneId::new("Z1"), 0, 42_000));
    assert!(metrics.snapshot().events_received >= 1);

    shutdown_tx.send(true).unwrap();
    assert!(timeout(Duration::from_secs(5), ingress).await.unwrap().unwrap());
}
