//! Embedded MQTT broker using rumqttd
//!
//! Cameras can publish straight to this host when no site broker exists.
//! The broker runs on its own OS thread; `start_embedded_broker` returns once
//! the listener accepts connections so the ingress client connects first try.

use crate::domain::error::ConfigError;
use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Detection payloads are a few hundred bytes
const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// How long startup waits for the listener to come up
const LISTEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Parse `[broker] bind_address` and `port` into a socket address
pub fn listen_address(app_config: &AppConfig) -> Result<SocketAddr, ConfigError> {
    let address = app_config.broker_bind_address();
    let ip: IpAddr = address
        .parse()
        .map_err(|source| ConfigError::BrokerAddress { address: address.to_string(), source })?;
    Ok(SocketAddr::new(ip, app_config.broker_port()))
}

/// MQTT v4 broker listening on `listen`, sized for a site's cameras
pub fn broker_config(listen: SocketAddr) -> Config {
    let connections = ConnectionSettings {
        connection_timeout_ms: 5_000,
        max_payload_size: MAX_PAYLOAD_SIZE,
        max_inflight_count: 100,
        auth: None,
        dynamic_filters: true,
        external_auth: None,
    };

    let server = ServerSettings {
        name: "cameras".to_string(),
        listen,
        tls: None,
        next_connection_delay_ms: 1,
        connections,
    };

    Config {
        id: 0,
        router: RouterConfig {
            max_segment_size: 1_048_576,
            max_segment_count: 4,
            max_connections: 256,
            max_outgoing_packet_count: 200,
            initialized_filters: None,
            ..Default::default()
        },
        v4: Some(HashMap::from([("cameras".to_string(), server)])),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Address to dial when checking a listener bound to `addr`
fn dial_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}

fn wait_until_listening(addr: SocketAddr, timeout: Duration) -> bool {
    let target = dial_address(addr);
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if TcpStream::connect_timeout(&target, Duration::from_millis(100)).is_ok() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Start the embedded broker on a background thread and return its address
pub fn start_embedded_broker(app_config: &AppConfig) -> Result<SocketAddr, ConfigError> {
    let listen = listen_address(app_config)?;
    let config = broker_config(listen);

    thread::spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the lifetime of the broker
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    if wait_until_listening(listen, LISTEN_TIMEOUT) {
        info!(listen = %listen, "broker_started");
    } else {
        warn!(listen = %listen, timeout_ms = %LISTEN_TIMEOUT.as_millis(), "broker_not_listening_yet");
    }
    Ok(listen)
}
