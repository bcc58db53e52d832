use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::info;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and stash the render handle. Must run
/// before any metric is touched; everything recorded earlier goes to the
/// no-op recorder and is lost. HTTP latency gets explicit buckets so the
/// ingest SLO (summary under a second) is visible on a dashboard.
pub fn init_metrics_recorder() {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("http_request_duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .expect("failed to set buckets for http_request_duration_seconds")
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    METRICS_HANDLE
        .set(handle)
        .expect("Metrics recorder already initialized");
}

/// Background task updating process-level gauges every 5 seconds.
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb_str) = line.split_whitespace().nth(1)
                            && let Ok(kb) = kb_str.parse::<f64>()
                        {
                            metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
                        }
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Initialize pipeline metrics to zero so they appear in Prometheus queries
/// before the first event occurs.
pub fn initialize_pipeline_metrics() {
    for queue in ["live_points", "upload_points", "flymaster_points", "scoring_points"] {
        metrics::counter!(format!("queue.{}.enqueued", queue)).absolute(0);
        metrics::counter!(format!("queue.{}.dequeued", queue)).absolute(0);
        metrics::counter!(format!("queue.{}.requeued", queue)).absolute(0);
        metrics::gauge!(format!("queue.{}.pending", queue)).set(0.0);
    }

    for writer in ["live_points", "upload_points", "flymaster_points"] {
        metrics::counter!(format!("writer.{}.points_written", writer)).absolute(0);
        metrics::counter!(format!("writer.{}.items_committed", writer)).absolute(0);
        metrics::counter!(format!("writer.{}.max_retries", writer)).absolute(0);
        metrics::counter!(format!("writer.{}.queue_errors", writer)).absolute(0);
    }

    metrics::counter!("validator.foreign_key_missing").absolute(0);
    metrics::counter!("validator.invalid_shape").absolute(0);

    metrics::counter!("flight_tracker.flights_opened").absolute(0);
    metrics::counter!("flight_tracker.landings_detected").absolute(0);
    metrics::counter!("flight_tracker.out_of_order_points").absolute(0);

    metrics::gauge!("gps.connections.active").set(0.0);
    metrics::counter!("gps.connections.accepted").absolute(0);
    metrics::counter!("gps.connections.refused").absolute(0);
    metrics::counter!("gps.frames.malformed").absolute(0);
    metrics::counter!("gps.frames.rate_limited").absolute(0);
    metrics::counter!("gps.points.enqueued").absolute(0);
    metrics::counter!("gps.abuse.blacklisted").absolute(0);

    metrics::gauge!("fanout.clients").set(0.0);
    metrics::counter!("fanout.ticks").absolute(0);
    metrics::counter!("fanout.tiles_sent").absolute(0);
    metrics::counter!("fanout.client_buffer_overflows").absolute(0);

    metrics::counter!("retention.flights_deleted").absolute(0);
}

/// Standalone metrics listener, separate from the public web surface.
/// Requires `init_metrics_recorder` to have run.
pub async fn start_metrics_server(port: u16) {
    assert!(
        METRICS_HANDLE.get().is_some(),
        "init_metrics_recorder must run before the metrics server starts"
    );

    tokio::spawn(process_metrics_task());

    let app = Router::new().route(
        "/metrics",
        get(|| async {
            let handle = METRICS_HANDLE
                .get()
                .expect("Metrics handle not initialized");
            handle.render()
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind metrics server");

    axum::serve(listener, app)
        .await
        .expect("Metrics server failed");
}
