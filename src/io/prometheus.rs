//! Prometheus metrics HTTP endpoint
//!
//! Exposes monitor metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const CONTENT_TYPE_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

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
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write one metric family split by a single extra label
fn write_labeled(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    label: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",{label}=\"{value}\"}} {count}");
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
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
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_feed_metrics(&mut output, site_id, &summary);
    write_estimate_metrics(&mut output, site_id, &summary);
    write_zone_metrics(&mut output, site_id, &summary);
    write_alert_metrics(&mut output, site_id, &summary);

    write_labeled(
        &mut output,
        "zone_guard_acquisitions_total",
        "Measurement acquisitions by outcome",
        site_id,
        "outcome",
        &[
            ("completed", summary.acquisitions_completed),
            ("timed_out", summary.acquisitions_timed_out),
            ("cancelled", summary.acquisitions_cancelled),
            ("failed", summary.acquisitions_failed),
        ],
    );

    output
}

fn write_feed_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "zone_guard_feed_records_total",
        "Feed records processed by the monitor",
        MetricType::Counter,
        site,
        summary.feed_records_total,
    );
    let _ = writeln!(output, "# HELP zone_guard_feed_records_per_sec Feed records per second");
    let _ = writeln!(output, "# TYPE zone_guard_feed_records_per_sec gauge");
    let _ = writeln!(
        output,
        "zone_guard_feed_records_per_sec{{site=\"{site}\"}} {:.2}",
        summary.records_per_sec
    );
    write_metric(
        output,
        "zone_guard_readings_dropped_total",
        "Beacon readings discarded as no-detection",
        MetricType::Counter,
        site,
        summary.readings_dropped_total,
    );
    write_metric(
        output,
        "zone_guard_feed_records_dropped_total",
        "Feed records dropped because the monitor queue was full",
        MetricType::Counter,
        site,
        summary.feed_records_dropped,
    );
    write_metric(
        output,
        "zone_guard_uplinks_invalid_total",
        "Uplinks rejected by the decoder",
        MetricType::Counter,
        site,
        summary.uplinks_invalid_total,
    );
    write_metric(
        output,
        "zone_guard_uplinks_duplicate_total",
        "Uplinks ignored as redeliveries",
        MetricType::Counter,
        site,
        summary.uplinks_duplicate_total,
    );
    write_metric(
        output,
        "zone_guard_feed_queue_depth",
        "Current monitor queue depth",
        MetricType::Gauge,
        site,
        summary.feed_queue_depth,
    );
}

fn write_estimate_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_labeled(
        output,
        "zone_guard_estimates_total",
        "Position estimates by method",
        site,
        "method",
        &[
            ("fingerprint", summary.estimates_fingerprint_total),
            ("trilateration", summary.estimates_trilateration_total),
        ],
    );
    write_metric(
        output,
        "zone_guard_cycles_skipped_total",
        "Cycles with neither an estimate nor a signal override",
        MetricType::Counter,
        site,
        summary.cycles_skipped_total,
    );
    write_histogram(
        output,
        "zone_guard_estimate_latency_us",
        "Position estimation latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_estimate_latency_us,
    );
    write_metric(
        output,
        "zone_guard_estimate_latency_p50_us",
        "50th percentile estimation latency",
        MetricType::Gauge,
        site,
        summary.lat_p50_us,
    );
    write_metric(
        output,
        "zone_guard_estimate_latency_p99_us",
        "99th percentile estimation latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
    write_metric(
        output,
        "zone_guard_estimate_latency_max_us",
        "Maximum estimation latency",
        MetricType::Gauge,
        site,
        summary.max_estimate_latency_us,
    );
}

fn write_zone_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "zone_guard_exits_total",
        "Devices that left their room",
        MetricType::Counter,
        site,
        summary.exits_total,
    );
    write_metric(
        output,
        "zone_guard_reentries_total",
        "Devices that came back inside",
        MetricType::Counter,
        site,
        summary.reentries_total,
    );
    write_metric(
        output,
        "zone_guard_exited_devices",
        "Devices currently outside their room",
        MetricType::Gauge,
        site,
        summary.exited_devices,
    );
}

fn write_alert_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "zone_guard_alerts_raised_total",
        "Alerts raised",
        MetricType::Counter,
        site,
        summary.alerts_raised_total,
    );
    write_metric(
        output,
        "zone_guard_alerts_dismissed_total",
        "Alerts dismissed",
        MetricType::Counter,
        site,
        summary.alerts_dismissed_total,
    );
    write_metric(
        output,
        "zone_guard_alerts_expired_total",
        "Alerts auto-dismissed after their display window",
        MetricType::Counter,
        site,
        summary.alerts_expired_total,
    );
    write_metric(
        output,
        "zone_guard_active_alerts",
        "Currently active alerts",
        MetricType::Gauge,
        site,
        summary.active_alerts,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = header::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            CONTENT_TYPE_TEXT,
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => {
            text_response(StatusCode::OK, "text/plain", "ok".to_string())
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
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
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::EstimateMethod;
    use crate::infra::metrics::AcquisitionOutcome;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_feed_record(1);
        metrics.record_estimate(EstimateMethod::Fingerprint, 150);
        metrics.record_estimate(EstimateMethod::Trilateration, 250);
        metrics.record_exit();
        metrics.record_acquisition(AcquisitionOutcome::TimedOut);
        metrics.set_active_alerts(2);
        metrics.set_exited_devices(1);

        let output = format_prometheus_metrics(&metrics, "home");

        assert!(output.contains("zone_guard_feed_records_total{site=\"home\"} 1"));
        assert!(output.contains("zone_guard_estimate_latency_us_bucket{site=\"home\""));
        assert!(output
            .contains("zone_guard_estimates_total{site=\"home\",method=\"fingerprint\"} 1"));
        assert!(output.contains("zone_guard_exits_total{site=\"home\"} 1"));
        assert!(output
            .contains("zone_guard_acquisitions_total{site=\"home\",outcome=\"timed_out\"} 1"));
        assert!(output.contains("zone_guard_active_alerts{site=\"home\"} 2"));
        assert!(output.contains("zone_guard_exited_devices{site=\"home\"} 1"));
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let metrics = Metrics::new();
        metrics.record_estimate(EstimateMethod::Fingerprint, 50);
        metrics.record_estimate(EstimateMethod::Fingerprint, 300);

        let output = format_prometheus_metrics(&metrics, "home");

        assert!(output.contains("zone_guard_estimate_latency_us_bucket{site=\"home\",le=\"100\"} 1"));
        assert!(output.contains("zone_guard_estimate_latency_us_bucket{site=\"home\",le=\"400\"} 2"));
        assert!(output.contains("zone_guard_estimate_latency_us_count{site=\"home\"} 2"));
    }
}
