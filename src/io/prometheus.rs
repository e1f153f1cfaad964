//! Prometheus metrics HTTP endpoint
//!
//! Exposes metrics in Prometheus text format at /metrics on its own port.
//! Uses hyper directly; the public API lives on a separate axum server.

use crate::domain::types::SpotStatus;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::status_store::StatusStore;
use bytes::Bytes;
use http_body_util::Full;
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

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format.
///
/// Reads the cumulative snapshot; the periodic log reporter owns `report()`.
fn format_prometheus_metrics(metrics: &Metrics, store: &StatusStore, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_camera_metrics(&mut output, site_id, &summary);
    write_status_metrics(&mut output, site_id, &summary, store);
    write_bus_metrics(&mut output, site_id, &summary);
    write_request_metrics(&mut output, site_id, &summary);

    output
}

fn write_camera_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "cloudpark_cameras_active",
        "Camera workers started",
        MetricType::Gauge,
        site,
        summary.cameras_active,
    );
    write_metric(
        output,
        "cloudpark_frames_read_total",
        "Frames read from camera sources",
        MetricType::Counter,
        site,
        summary.frames_read_total,
    );
    write_metric(
        output,
        "cloudpark_frames_processed_total",
        "Frames sent to the detector",
        MetricType::Counter,
        site,
        summary.frames_processed_total,
    );
    write_histogram(
        output,
        "cloudpark_detection_latency_ms",
        "Detector call latency in milliseconds",
        site,
        &summary.detection_lat_buckets,
        summary.detection_lat_sum_ms,
    );
    write_metric(
        output,
        "cloudpark_detection_failures_total",
        "Frames skipped after a detector error",
        MetricType::Counter,
        site,
        summary.detection_failures_total,
    );
    write_metric(
        output,
        "cloudpark_source_failures_total",
        "Camera source open or read failures",
        MetricType::Counter,
        site,
        summary.source_failures_total,
    );
}

fn write_status_metrics(
    output: &mut String,
    site: &str,
    summary: &MetricsSummary,
    store: &StatusStore,
) {
    write_metric(
        output,
        "cloudpark_status_changes_total",
        "Spot status transitions",
        MetricType::Counter,
        site,
        summary.status_changes_total,
    );

    let snapshot = store.snapshot();
    let _ = writeln!(output, "# HELP cloudpark_spots Spots by live status");
    let _ = writeln!(output, "# TYPE cloudpark_spots gauge");
    for status in [SpotStatus::Free, SpotStatus::Occupied, SpotStatus::Reserved] {
        let count = snapshot.values().filter(|s| **s == status).count();
        let _ = writeln!(output, "cloudpark_spots{{site=\"{site}\",status=\"{status}\"}} {count}");
    }
}

fn write_bus_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "cloudpark_events_published_total",
        "Status change events published",
        MetricType::Counter,
        site,
        summary.events_published_total,
    );
    write_metric(
        output,
        "cloudpark_subscribers_active",
        "Registered bus subscribers",
        MetricType::Gauge,
        site,
        summary.subscribers_active,
    );
    write_metric(
        output,
        "cloudpark_subscribers_dropped_total",
        "Subscribers dropped for lagging or disconnecting",
        MetricType::Counter,
        site,
        summary.subscribers_dropped_total,
    );
}

fn write_request_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "cloudpark_route_requests_total",
        "Route requests served",
        MetricType::Counter,
        site,
        summary.route_requests_total,
    );
    write_metric(
        output,
        "cloudpark_route_no_path_total",
        "Route requests with no path",
        MetricType::Counter,
        site,
        summary.route_no_path_total,
    );
    write_metric(
        output,
        "cloudpark_assignments_total",
        "Spots handed out",
        MetricType::Counter,
        site,
        summary.assignments_total,
    );
    write_metric(
        output,
        "cloudpark_assignments_exhausted_total",
        "Assignment requests with no free spot",
        MetricType::Counter,
        site,
        summary.assignments_exhausted_total,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    store: Arc<StatusStore>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &store, &site_id);
            let mut resp = text_response(StatusCode::OK, body);
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(resp)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Serve /metrics until shutdown
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    store: Arc<StatusStore>,
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
                        let store = store.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), store.clone(), site_id.clone())
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
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
