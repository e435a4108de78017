//! Camera detection simulator
//!
//! Publishes person counts for one camera zone the way an MV camera does,
//! alternating between an occupied and an empty period so a running
//! absence-watch raises and clears alerts.
//!
//! Usage:
//!   cargo run --bin absence-sim -- --serial Q2GV-AAAA-BBBB --zone 582794355 --absent-secs 20

use absence_watch::domain::types::epoch_ms;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "absence-sim")]
#[command(about = "Publish simulated camera person counts over MQTT")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Topic prefix
    #[arg(long, default_value = "/merakimv")]
    prefix: String,

    /// Camera serial
    #[arg(long)]
    serial: String,

    /// Zone id
    #[arg(long)]
    zone: String,

    /// Milliseconds between messages
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Seconds a person is present per cycle
    #[arg(long, default_value = "10")]
    present_secs: u64,

    /// Seconds the zone is empty per cycle
    #[arg(long, default_value = "30")]
    absent_secs: u64,

    /// Number of present/absent cycles (0 = run forever)
    #[arg(long, default_value = "0")]
    cycles: u64,
}

/// Person count at `elapsed` into a repeating present-then-absent cycle
fn person_count_at(elapsed: Duration, present: Duration, absent: Duration) -> u64 {
    let cycle = (present + absent).as_millis().max(1);
    let offset = elapsed.as_millis() % cycle;
    if offset < present.as_millis() {
        1
    } else {
        0
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_timer(UtcTime::rfc_3339()).with_target(false).init();

    let args = Args::parse();
    let topic = format!("{}/{}/{}", args.prefix, args.serial, args.zone);
    let present = Duration::from_secs(args.present_secs);
    let absent = Duration::from_secs(args.absent_secs);

    let mut mqtt_options = MqttOptions::new(format!("absence-sim-{}", args.zone), &args.mqtt_host, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("sim_mqtt_connected"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "sim_mqtt_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!(topic = %topic, present_secs = %args.present_secs, absent_secs = %args.absent_secs, "sim_started");

    let start = tokio::time::Instant::now();
    let total = (present + absent)
        .checked_mul(u32::try_from(args.cycles).unwrap_or(u32::MAX))
        .unwrap_or(Duration::MAX);
    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut last_count = None;

    loop {
        interval.tick().await;
        let elapsed = start.elapsed();
        if args.cycles > 0 && elapsed >= total {
            break;
        }

        let count = person_count_at(elapsed, present, absent);
        let payload = json!({ "ts": epoch_ms(), "counts": { "person": count } }).to_string();
        client.publish(topic.as_str(), QoS::AtMostOnce, false, payload).await?;

        if last_count != Some(count) {
            info!(person_count = %count, "sim_phase_changed");
            last_count = Some(count);
        }
    }

    client.disconnect().await?;
    info!("sim_finished");
    Ok(())
}
