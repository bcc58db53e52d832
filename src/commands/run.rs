// Process wiring: pools, queue, writer pool, GPS front-end, fan-out hubs,
// web surface and background sweeps, all sharing one shutdown token.
//
// The `run` subcommand starts everything; `web` and `gps` start subsets for
// split deployments. The code paths are identical either way, only the
// process boundary moves.

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::devices_repo::DevicesRepository;
use crate::flight_tracker::FlightTracker;
use crate::flights_repo::FlightsRepository;
use crate::live_hub::HubRegistry;
use crate::point_queue::PointQueue;
use crate::point_writer::{PointWriter, RetentionGate};
use crate::queue_config::QueueKind;
use crate::races_repo::RacesRepository;
use crate::retention::{RetentionSweeper, dlq_reaper};
use crate::track_points_repo::TrackPointsRepository;
use crate::tracker_server::{DeviceRateLimiter, GpsContext, GpsServer};
use crate::validator::Validator;
use crate::web::{AppState, create_pool, start_web_server};

/// In-flight connection grace on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Store connection ceiling per pool; Redis stays on one pipelined
/// connection regardless.
const STORE_POOL_SIZE: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct Components {
    pub web: bool,
    pub gps: bool,
    pub writers: bool,
}

impl Components {
    pub fn all() -> Self {
        Self {
            web: true,
            gps: true,
            writers: true,
        }
    }

    pub fn web_only() -> Self {
        Self {
            web: true,
            gps: false,
            writers: false,
        }
    }

    pub fn gps_only() -> Self {
        Self {
            web: false,
            gps: true,
            writers: false,
        }
    }
}

pub async fn handle_run(settings: Settings, components: Components) -> Result<()> {
    // Recorder first so nothing increments into the void, zero-init second
    // so every series exists before its first event, scrape endpoint last.
    if let Some(port) = settings.metrics_port {
        crate::metrics::init_metrics_recorder();
        crate::metrics::initialize_pipeline_metrics();
        tokio::spawn(crate::metrics::start_metrics_server(port));
    }

    let pool = create_pool(&settings.database_url, STORE_POOL_SIZE)
        .context("Failed to connect to primary store")?;
    let read_pool = match &settings.replica_database_url {
        Some(replica_url) => {
            info!("Using read replica for the fan-out tier");
            create_pool(replica_url, STORE_POOL_SIZE)
                .context("Failed to connect to replica store")?
        }
        None => pool.clone(),
    };

    let queue = PointQueue::connect(&settings.redis_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to queue backing store: {}", e))?;

    let flights_repo = FlightsRepository::new(pool.clone());
    let points_repo = TrackPointsRepository::new(pool.clone());
    let read_points_repo = TrackPointsRepository::new(read_pool.clone());
    let devices_repo = DevicesRepository::new(pool.clone());
    let races_repo = RacesRepository::new(pool.clone());

    let flight_tracker = FlightTracker::new(flights_repo.clone(), settings.landing.clone());
    let gate: RetentionGate = Arc::new(RwLock::new(()));
    let cancel = CancellationToken::new();

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Writer pool: one worker per queue family this process owns. The
    // scoring queue is drained by the scoring service, not here.
    if components.writers {
        for kind in [
            QueueKind::LivePoints,
            QueueKind::UploadPoints,
            QueueKind::FlymasterPoints,
        ] {
            let writer = PointWriter::new(
                kind,
                queue.clone(),
                Validator::new(flights_repo.clone()),
                flights_repo.clone(),
                points_repo.clone(),
                Some(flight_tracker.clone()),
                gate.clone(),
                cancel.clone(),
            );
            tasks.push(tokio::spawn(writer.run()));
        }

        let sweeper = RetentionSweeper::new(
            flights_repo.clone(),
            gate.clone(),
            settings.retention_hours,
            cancel.clone(),
        );
        tasks.push(tokio::spawn(sweeper.run()));
        tasks.push(tokio::spawn(dlq_reaper(
            queue.clone(),
            settings.dlq_max_len,
            cancel.clone(),
        )));
    }

    if components.gps && settings.gps_enabled {
        let server = GpsServer::new(
            settings.gps.clone(),
            GpsContext {
                queue: queue.clone(),
                flight_tracker: flight_tracker.clone(),
                devices_repo: devices_repo.clone(),
                races_repo: races_repo.clone(),
            },
            cancel.clone(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!("GPS server exited with error: {:#}", e);
            }
        }));
    }

    let hub_registry = HubRegistry::new(
        read_points_repo,
        settings.fanout.clone(),
        cancel.clone(),
    );

    // Shutdown signal: close accept sockets immediately, let per-connection
    // tasks and writers drain.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining");
        signal_cancel.cancel();
    });

    if components.web {
        let state = AppState {
            pool,
            read_pool,
            queue,
            flight_tracker,
            hub_registry,
            deletions: Arc::new(DashMap::new()),
            // 120 requests per producer per minute, no hard spacing; mobile
            // apps batch points and post every few seconds at worst.
            ingest_limiter: Arc::new(DeviceRateLimiter::new(Duration::ZERO, 120, usize::MAX)),
            settings: Arc::new(settings.clone()),
            gate,
            shutdown: cancel.clone(),
        };

        start_web_server(
            settings.web_interface.clone(),
            settings.web_port,
            state,
            cancel.clone(),
        )
        .await?;
    } else {
        cancel.cancelled().await;
    }

    info!(
        "Waiting up to {}s for {} background tasks",
        SHUTDOWN_GRACE.as_secs(),
        tasks.len()
    );
    let drain = futures_util::future::join_all(tasks);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Shutdown grace period elapsed with tasks still running");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
