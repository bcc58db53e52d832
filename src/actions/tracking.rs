// HTTP ingest adapters and the tracking query/admin surface.
//
// Adapters are thin: parse, shape-check, make sure the flight row exists,
// enqueue. When the queue is unreachable they fall back to one direct bulk
// insert through the same routine the writer uses, so a Redis outage
// degrades to slower ingestion instead of data loss.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::devices::TrackerDevice;
use crate::devices_repo::DevicesRepository;
use crate::flight_tracker::IncomingPoint;
use crate::flights::{FixSummary, Flight, FlightSource};
use crate::flights_repo::FlightsRepository;
use crate::point_queue::{QueueError, QueueItem, QueuePoint};
use crate::queue_config::QueueKind;
use crate::races_repo::RacesRepository;
use crate::track_points::NewLivePoint;
use crate::track_points_repo::TrackPointsRepository;
use crate::validator::check_point_shape;
use crate::web::{AppState, DeletionStatus};

use super::json_error;

#[derive(Debug, Deserialize)]
pub struct IngestPointBody {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}

impl From<&IngestPointBody> for QueuePoint {
    fn from(p: &IngestPointBody) -> Self {
        QueuePoint {
            lat: p.lat,
            lon: p.lon,
            elevation: p.elevation,
            datetime: p.datetime,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub flight_id: String,
    pub race_id: Option<Uuid>,
    pub pilot_id: Option<String>,
    pub pilot_name: Option<String>,
    pub points: Vec<IngestPointBody>,
}

#[derive(Debug, Deserialize)]
pub struct BulkPointsRequest {
    pub points: Vec<IngestPointBody>,
}

fn shape_check_all(points: &[IngestPointBody]) -> Result<Vec<QueuePoint>, Response> {
    if points.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "No points supplied").into_response());
    }
    let mut out = Vec::with_capacity(points.len());
    for p in points {
        let point = QueuePoint::from(p);
        if let Err(detail) = check_point_shape(&point) {
            return Err(
                json_error(StatusCode::UNPROCESSABLE_ENTITY, &detail).into_response()
            );
        }
        out.push(point);
    }
    Ok(out)
}

/// Mobile and upload producers supply opaque flight identifiers; the row is
/// created on the first point we see for one.
async fn ensure_flight(
    state: &AppState,
    req: &IngestRequest,
    source: FlightSource,
) -> Result<Flight, Response> {
    let flights_repo = FlightsRepository::new(state.pool.clone());

    match flights_repo.get_by_flight_id(&req.flight_id).await {
        Ok(Some(flight)) => return Ok(flight),
        Ok(None) => {}
        Err(e) => {
            error!("Flight lookup failed: {:#}", e);
            return Err(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Flight lookup failed",
            )
            .into_response());
        }
    }

    let (Some(race_id), Some(pilot_id)) = (req.race_id, req.pilot_id.as_ref()) else {
        return Err(json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "race_id and pilot_id are required for the first point of a new flight",
        )
        .into_response());
    };

    let flight = Flight::new(
        req.flight_id.clone(),
        race_id,
        pilot_id.clone(),
        req.pilot_name.clone().unwrap_or_else(|| pilot_id.clone()),
        source,
        None,
    );

    flights_repo.create_if_absent(flight).await.map_err(|e| {
        warn!("Flight creation failed for {}: {:#}", req.flight_id, e);
        json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Flight creation failed; is the race registered?",
        )
        .into_response()
    })
}

/// The writer's insert routine, invoked inline when the queue is down:
/// bulk insert with conflicts ignored, then advance the fix summary.
async fn direct_write(
    state: &AppState,
    flight: &Flight,
    points: &[QueuePoint],
    kind: QueueKind,
) -> anyhow::Result<usize> {
    let points_repo = TrackPointsRepository::new(state.pool.clone());
    let flights_repo = FlightsRepository::new(state.pool.clone());

    let rows: Vec<NewLivePoint> = points
        .iter()
        .map(|p| NewLivePoint {
            flight_id: flight.flight_id.clone(),
            flight_uuid: flight.id,
            lat: p.lat,
            lon: p.lon,
            elevation: p.elevation,
            datetime: p.datetime,
        })
        .collect();

    let inserted = match kind {
        QueueKind::UploadPoints => {
            points_repo
                .bulk_insert_uploaded(rows.into_iter().map(Into::into).collect())
                .await?
        }
        _ => points_repo.bulk_insert_live(rows).await?,
    };

    let first = points
        .iter()
        .min_by_key(|p| p.datetime)
        .expect("non-empty batch");
    let last = points
        .iter()
        .max_by_key(|p| p.datetime)
        .expect("non-empty batch");
    flights_repo
        .apply_batch_summary(
            flight.id,
            FixSummary {
                lat: first.lat,
                lon: first.lon,
                elevation: first.elevation,
                timestamp: first.datetime,
            },
            FixSummary {
                lat: last.lat,
                lon: last.lon,
                elevation: last.elevation,
                timestamp: last.datetime,
            },
            points.len(),
        )
        .await?;

    Ok(inserted)
}

async fn ingest(state: AppState, req: IngestRequest, kind: QueueKind, source: FlightSource) -> Response {
    // Per-producer throttle, generous enough for every sane reporting
    // cadence; misbehaving clients get a 429 instead of a queue flood.
    if state
        .ingest_limiter
        .admit_frame(&req.flight_id, std::time::Instant::now())
        == crate::tracker_server::FrameAdmission::DropSilently
    {
        metrics::counter!("ingest.rate_limited").increment(1);
        return json_error(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }

    let points = match shape_check_all(&req.points) {
        Ok(points) => points,
        Err(response) => return response,
    };

    let flight = match ensure_flight(&state, &req, source).await {
        Ok(flight) => flight,
        Err(response) => return response,
    };

    let item = QueueItem::new(kind, flight.flight_id.clone(), points.clone());

    match state.queue.enqueue(kind, &item).await {
        Ok(()) => {
            metrics::counter!("ingest.queued", "queue" => kind.name()).increment(1);
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "queued",
                    "flight_id": flight.flight_id,
                    "count": points.len(),
                })),
            )
                .into_response()
        }
        Err(QueueError::Unavailable(reason)) => {
            warn!("Queue unavailable ({}), direct write for {}", reason, flight.flight_id);
            metrics::counter!("ingest.queue_unavailable").increment(1);
            match direct_write(&state, &flight, &points, kind).await {
                Ok(inserted) => {
                    metrics::counter!("ingest.fallback_direct").increment(1);
                    (
                        StatusCode::CREATED,
                        Json(json!({
                            "status": "written",
                            "flight_id": flight.flight_id,
                            "count": inserted,
                        })),
                    )
                        .into_response()
                }
                Err(e) => {
                    error!("Direct-write fallback failed: {:#}", e);
                    json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Queue and direct write both unavailable",
                    )
                    .into_response()
                }
            }
        }
        Err(e) => {
            error!("Enqueue failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Enqueue failed").into_response()
        }
    }
}

/// POST /tracking/live
pub async fn ingest_live(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Response {
    ingest(state, req, QueueKind::LivePoints, FlightSource::Live).await
}

/// POST /tracking/upload
pub async fn ingest_upload(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Response {
    ingest(state, req, QueueKind::UploadPoints, FlightSource::Upload).await
}

/// POST /tracking/flymaster/{device_id}
///
/// Bulk device upload: points run through the flight separator in timestamp
/// order and land on the bulk queue grouped by assigned flight.
pub async fn ingest_flymaster(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<BulkPointsRequest>,
) -> Response {
    let points = match shape_check_all(&req.points) {
        Ok(points) => points,
        Err(response) => return response,
    };

    let devices_repo = DevicesRepository::new(state.pool.clone());
    let races_repo = RacesRepository::new(state.pool.clone());

    let device = match devices_repo.get_by_device_id(&device_id).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            return json_error(StatusCode::NOT_FOUND, "Unknown device").into_response();
        }
        Err(e) => {
            error!("Device lookup failed: {:#}", e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Device lookup failed")
                .into_response();
        }
    };
    let race = match races_repo.get_by_id(device.race_uuid).await {
        Ok(Some(race)) => race,
        _ => {
            return json_error(StatusCode::UNPROCESSABLE_ENTITY, "Device race not found")
                .into_response();
        }
    };

    let mut sorted = points;
    sorted.sort_by_key(|p| p.datetime);

    // Assign each point, grouping runs that share a flight into one item.
    let mut groups: Vec<(String, Vec<QueuePoint>)> = Vec::new();
    for point in sorted {
        let incoming = IncomingPoint {
            lat: point.lat,
            lon: point.lon,
            elevation: point.elevation,
            timestamp: point.datetime,
        };
        let assigned = match state
            .flight_tracker
            .assign_point(&device, &race, FlightSource::FlymasterLive, &incoming)
            .await
        {
            Ok(assigned) => assigned,
            Err(e) => {
                error!("Flight assignment failed: {:#}", e);
                return json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Flight assignment failed",
                )
                .into_response();
            }
        };

        match groups.last_mut() {
            Some((flight_id, group)) if *flight_id == assigned.flight_id => group.push(point),
            _ => groups.push((assigned.flight_id, vec![point])),
        }
    }

    let items: Vec<QueueItem> = groups
        .into_iter()
        .map(|(flight_id, group)| QueueItem::new(QueueKind::FlymasterPoints, flight_id, group))
        .collect();
    let total: usize = items.iter().map(|i| i.count).sum();

    match state
        .queue
        .enqueue_batch(QueueKind::FlymasterPoints, &items)
        .await
    {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "queued",
                "device_id": device_id,
                "flights": items.len(),
                "count": total,
            })),
        )
            .into_response(),
        Err(QueueError::Unavailable(reason)) => {
            warn!("Queue unavailable ({}), direct write for device {}", reason, device_id);
            let flights_repo = FlightsRepository::new(state.pool.clone());
            for item in &items {
                let Ok(Some(flight)) = flights_repo.get_by_flight_id(&item.flight_id).await
                else {
                    continue;
                };
                if let Err(e) =
                    direct_write(&state, &flight, &item.points, QueueKind::FlymasterPoints).await
                {
                    error!("Direct-write fallback failed: {:#}", e);
                    return json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Queue and direct write both unavailable",
                    )
                    .into_response();
                }
            }
            (
                StatusCode::CREATED,
                Json(json!({ "status": "written", "count": total })),
            )
                .into_response()
        }
        Err(e) => {
            error!("Enqueue failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Enqueue failed").into_response()
        }
    }
}

// ============================================================================
// Live summary and per-pilot queries
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PilotSummary {
    pub pilot_id: String,
    pub pilot_name: String,
    pub flight_count: usize,
    pub last_activity: DateTime<Utc>,
}

/// GET /tracking/live/summary
///
/// Aggregated over the live retention window; capped at 100 pilots.
pub async fn live_summary(State(state): State<AppState>) -> Response {
    let flights_repo = FlightsRepository::new(state.read_pool.clone());

    let flights = match flights_repo.live_flights().await {
        Ok(flights) => flights,
        Err(e) => {
            error!("Live summary query failed: {:#}", e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Summary query failed")
                .into_response();
        }
    };

    let mut pilots: HashMap<String, PilotSummary> = HashMap::new();
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut latest: Option<DateTime<Utc>> = None;

    for flight in &flights {
        let first_ts = flight.first_fix().map(|f| f.timestamp);
        let last_ts = flight
            .last_fix()
            .map(|f| f.timestamp)
            .unwrap_or(flight.created_at);

        earliest = match (earliest, first_ts) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        latest = Some(latest.map_or(last_ts, |l: DateTime<Utc>| l.max(last_ts)));

        pilots
            .entry(flight.pilot_id.clone())
            .and_modify(|entry| {
                entry.flight_count += 1;
                if last_ts > entry.last_activity {
                    entry.last_activity = last_ts;
                }
            })
            .or_insert_with(|| PilotSummary {
                pilot_id: flight.pilot_id.clone(),
                pilot_name: flight.pilot_name.clone(),
                flight_count: 1,
                last_activity: last_ts,
            });
    }

    let total_pilots = pilots.len();
    let mut pilots: Vec<PilotSummary> = pilots.into_values().collect();
    pilots.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    pilots.truncate(100);

    Json(json!({
        "summary": {
            "total_flights": flights.len(),
            "total_pilots": total_pilots,
            "time_range": { "start": earliest, "end": latest },
            "earliest_activity": earliest,
            "latest_activity": latest,
        },
        "pilots": pilots,
    }))
    .into_response()
}

#[derive(Debug, Serialize)]
pub struct PilotFlightView {
    pub flight_uuid: Uuid,
    pub flight_id: String,
    pub source: String,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub first_fix: Option<serde_json::Value>,
    pub last_fix: Option<serde_json::Value>,
    pub duration_seconds: Option<i64>,
    pub total_points: i32,
}

/// GET /tracking/live/pilot/{pilot_id}/flights
pub async fn pilot_flights(
    State(state): State<AppState>,
    Path(pilot_id): Path<String>,
) -> Response {
    let flights_repo = FlightsRepository::new(state.read_pool.clone());

    match flights_repo.recent_flights_for_pilot(&pilot_id, 20).await {
        Ok(flights) => {
            let views: Vec<PilotFlightView> = flights
                .into_iter()
                .map(|f| PilotFlightView {
                    flight_uuid: f.id,
                    flight_id: f.flight_id.clone(),
                    source: f.source.clone(),
                    device_id: f.device_id.clone(),
                    created_at: f.created_at,
                    duration_seconds: f.duration_seconds(),
                    first_fix: f.first_fix.clone(),
                    last_fix: f.last_fix.clone(),
                    total_points: f.total_points,
                })
                .collect();
            Json(views).into_response()
        }
        Err(e) => {
            error!("Pilot flights query failed: {:#}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Query failed").into_response()
        }
    }
}

// ============================================================================
// Asynchronous deletion
// ============================================================================

fn accept_deletion(state: &AppState) -> (Uuid, Response) {
    let deletion_id = Uuid::new_v4();
    state.deletions.insert(
        deletion_id,
        DeletionStatus {
            deletion_id,
            status: "pending".to_string(),
            deleted_flights: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        },
    );
    let response = (
        StatusCode::ACCEPTED,
        Json(json!({
            "deletion_id": deletion_id,
            "status_url": format!("/tracking/deletion-status/{}", deletion_id),
        })),
    )
        .into_response();
    (deletion_id, response)
}

fn finish_deletion(state: &AppState, deletion_id: Uuid, result: anyhow::Result<usize>) {
    if let Some(mut entry) = state.deletions.get_mut(&deletion_id) {
        entry.finished_at = Some(Utc::now());
        match result {
            Ok(deleted) => {
                entry.status = "completed".to_string();
                entry.deleted_flights = Some(deleted);
            }
            Err(e) => {
                entry.status = "failed".to_string();
                entry.error = Some(format!("{:#}", e));
            }
        }
    }
}

/// DELETE /tracking/admin/delete-pilot-flights-async/{pilot_id}
pub async fn delete_pilot_flights_async(
    State(state): State<AppState>,
    Path(pilot_id): Path<String>,
) -> Response {
    let (deletion_id, response) = accept_deletion(&state);

    tokio::spawn(async move {
        if let Some(mut entry) = state.deletions.get_mut(&deletion_id) {
            entry.status = "running".to_string();
        }
        // Deletion waits for writers to drain in-flight batches.
        let _gate = state.gate.write().await;
        let flights_repo = FlightsRepository::new(state.pool.clone());
        let result = flights_repo.delete_flights_for_pilot(&pilot_id).await;
        info!("Async deletion {} for pilot {} finished", deletion_id, pilot_id);
        finish_deletion(&state, deletion_id, result);
    });

    response
}

#[derive(Debug, Deserialize)]
pub struct DeleteFlightParams {
    pub source: Option<String>,
}

/// DELETE /tracking/tracks/fuuid-async/{flight_uuid}?source=…
pub async fn delete_flight_async(
    State(state): State<AppState>,
    Path(flight_uuid): Path<Uuid>,
    Query(params): Query<DeleteFlightParams>,
) -> Response {
    let source_filter = match params.source.as_deref() {
        None => None,
        Some(raw) => match FlightSource::parse(raw) {
            Some(source) => Some(source),
            None => {
                return json_error(StatusCode::BAD_REQUEST, "Unknown source").into_response();
            }
        },
    };

    let (deletion_id, response) = accept_deletion(&state);

    tokio::spawn(async move {
        if let Some(mut entry) = state.deletions.get_mut(&deletion_id) {
            entry.status = "running".to_string();
        }
        let _gate = state.gate.write().await;
        let flights_repo = FlightsRepository::new(state.pool.clone());
        let result = flights_repo
            .delete_flight_by_uuid(flight_uuid, source_filter)
            .await;
        finish_deletion(&state, deletion_id, result);
    });

    response
}

/// GET /tracking/deletion-status/{deletion_id}
pub async fn deletion_status(
    State(state): State<AppState>,
    Path(deletion_id): Path<Uuid>,
) -> Response {
    match state.deletions.get(&deletion_id) {
        Some(entry) => Json(entry.clone()).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "Unknown deletion").into_response(),
    }
}

// ============================================================================
// Device registry
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub race_id: Uuid,
    pub pilot_id: String,
    pub pilot_name: Option<String>,
    pub source: Option<String>,
}

/// POST /tracking/admin/devices
pub async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Response {
    let source = match req.source.as_deref() {
        None => FlightSource::Tk905bLive,
        Some(raw) => match FlightSource::parse(raw) {
            Some(source) if source.is_tracker() => source,
            _ => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "Source must be a tracker source",
                )
                .into_response();
            }
        },
    };

    if req.device_id.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "device_id is required").into_response();
    }

    let device = TrackerDevice::new(
        req.device_id.trim().to_string(),
        req.race_id,
        req.pilot_id.clone(),
        req.pilot_name.unwrap_or_else(|| req.pilot_id.clone()),
        source,
    );

    let devices_repo = DevicesRepository::new(state.pool.clone());
    match devices_repo.upsert(device.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(device)).into_response(),
        Err(e) => {
            warn!("Device registration failed: {:#}", e);
            json_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Device registration failed; is the race registered?",
            )
            .into_response()
        }
    }
}

/// GET /tracking/admin/devices
pub async fn list_devices(State(state): State<AppState>) -> Response {
    let devices_repo = DevicesRepository::new(state.pool.clone());
    match devices_repo.list().await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => {
            error!("Device list failed: {:#}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Query failed").into_response()
        }
    }
}
