//! Prometheus metrics HTTP endpoint
//!
//! Exposes absence-watch metrics in Prometheus text format at /metrics,
//! plus a liveness check at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(2048);

    write_ingress_metrics(&mut output, site, summary);
    write_tracker_metrics(&mut output, site, summary);
    write_delivery_metrics(&mut output, site, summary);

    output
}

fn write_ingress_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    use MetricType::Counter;
    write_metric(output, "absence_events_received_total", "Detection messages received", Counter, site, s.events_received);
    write_metric(output, "absence_events_dropped_total", "Events dropped on a full tracker queue", Counter, site, s.events_dropped);
    write_metric(output, "absence_events_throttled_total", "Events skipped by the ingress throttle", Counter, site, s.events_throttled);
    write_metric(output, "absence_parse_errors_total", "Malformed detection messages", Counter, site, s.parse_errors);
    write_metric(output, "absence_unknown_zone_events_total", "Events for unconfigured zones", Counter, site, s.unknown_zone_events);
}

fn write_tracker_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    write_metric(output, "absence_events_processed_total", "Events applied by the tracker", MetricType::Counter, site, s.events_processed);
    write_metric(output, "absence_zones_alerting", "Zones currently in the alerting phase", MetricType::Gauge, site, s.zones_alerting);
}

fn write_delivery_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    use MetricType::Counter;
    write_metric(output, "absence_alerts_raised_total", "Alerts raised by the tracker", Counter, site, s.alerts_raised);
    write_metric(output, "absence_alerts_dropped_total", "Alerts dropped on a full dispatch queue", Counter, site, s.alerts_dropped);
    write_metric(output, "absence_snapshot_failures_total", "Alerts sent without a snapshot", Counter, site, s.snapshot_failures);
    write_metric(output, "absence_deliveries_sent_total", "Alert messages delivered", Counter, site, s.deliveries_sent);
    write_metric(output, "absence_deliveries_failed_total", "Alert messages that failed to send", Counter, site, s.deliveries_failed);
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &metrics, &site_id))
}

fn route(method: &Method, path: &str, metrics: &Metrics, site_id: &str) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics.snapshot(), site_id);
            response(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, body)
        }
        (&Method::GET, "/health") => response(StatusCode::OK, "text/plain", "ok"),
        _ => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), site_id.clone())
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
