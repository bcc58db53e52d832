use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use tower_http::cors::CorsLayer;

use crate::actions;
use crate::config::Settings;
use crate::flight_tracker::FlightTracker;
use crate::live_hub::HubRegistry;
use crate::point_queue::PointQueue;
use crate::point_writer::RetentionGate;
use crate::tracker_server::DeviceRateLimiter;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Build an r2d2 pool against one endpoint. Connections are checked before
/// handout so a recycled TLS session never reaches a query.
pub fn create_pool(database_url: &str, max_size: u32) -> Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_secs(10))
        .test_on_check_out(true)
        .build(manager)?;
    Ok(pool)
}

/// Progress record for an asynchronous deletion.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionStatus {
    pub deletion_id: Uuid,
    pub status: String,
    pub deleted_flights: Option<usize>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Process-wide runtime threaded through every handler. Writers always get
/// the primary pool; the fan-out tier reads from `read_pool`, which is the
/// replica when one is configured.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub read_pool: PgPool,
    pub queue: PointQueue,
    pub flight_tracker: Arc<FlightTracker>,
    pub hub_registry: Arc<HubRegistry>,
    pub deletions: Arc<DashMap<Uuid, DeletionStatus>>,
    /// Per-producer request throttle for the HTTP ingest surface.
    pub ingest_limiter: Arc<DeviceRateLimiter>,
    pub settings: Arc<Settings>,
    pub gate: RetentionGate,
    pub shutdown: CancellationToken,
}

// Request logging with a short correlation id, mirrored on completion.
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start_time = Instant::now();

    info!("Started {} {} [{}]", method, path, request_id);

    let response = next.run(request).await;
    let duration = start_time.elapsed();

    info!(
        "Completed {} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        response.status().as_u16(),
        duration.as_secs_f64() * 1000.0
    );
    metrics::histogram!("http_request_duration_seconds").record(duration.as_secs_f64());

    response
}

pub fn build_router(state: AppState) -> Router {
    let tracking = Router::new()
        .route("/live", post(actions::ingest_live))
        .route("/upload", post(actions::ingest_upload))
        .route("/flymaster/{device_id}", post(actions::ingest_flymaster))
        .route("/live/summary", get(actions::live_summary))
        .route(
            "/live/pilot/{pilot_id}/flights",
            get(actions::pilot_flights),
        )
        .route(
            "/admin/delete-pilot-flights-async/{pilot_id}",
            delete(actions::delete_pilot_flights_async),
        )
        .route(
            "/tracks/fuuid-async/{flight_uuid}",
            delete(actions::delete_flight_async),
        )
        .route(
            "/deletion-status/{deletion_id}",
            get(actions::deletion_status),
        )
        .route("/admin/devices", post(actions::register_device))
        .route("/admin/devices", get(actions::list_devices));

    let admin_queue = Router::new()
        .route("/dlq/{queue}", get(actions::dlq_peek))
        .route("/dlq/{queue}", delete(actions::dlq_purge))
        .route("/dlq/{queue}/requeue", post(actions::dlq_requeue));

    Router::new()
        .nest("/tracking", tracking)
        .nest("/admin/queue", admin_queue)
        .route("/queue/status", get(actions::queue_status))
        .route("/health", get(actions::health))
        .route("/ws/live/{race_id}", get(actions::live_race_websocket))
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(CorsLayer::permissive())
}

pub async fn start_web_server(
    interface: String,
    port: u16,
    state: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", interface, port)).await?;
    info!("Web server listening on http://{}:{}", interface, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    Ok(())
}
