// Live fan-out: one hub per active race pushing delayed positions to
// viewport-subscribed WebSocket clients on a fixed cadence.
//
// The hub wakes every update interval, reads positions older than the
// broadcast delay from the read pool, and sends each client a compressed
// delta scoped to its subscribed tiles (plus the client's own pilot). Ticks
// that would overlap are skipped, never coalesced: viewers see a gap, not a
// burst. Per-client buffers are bounded and drop the oldest unsent delta on
// overflow; demand-driven tile data is never dropped.

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mercator::{TileCoord, mercator_x, mercator_y, tile_at, tiles_covering_bbox};
use crate::races::Race;
use crate::track_points::PilotPosition;
use crate::track_points_repo::TrackPointsRepository;
use crate::vector_tile::encode_pilot_tile;

pub const PROTOCOL_VERSION: &str = "2.0";

/// Bounded per-client send buffer.
const CLIENT_BUFFER: usize = 64;

/// Viewer-count and heartbeat cadence, in ticks (3 * 10 s = 30 s).
const VIEWER_COUNT_EVERY_TICKS: u64 = 3;

/// Cap on tiles served per request_initial_data.
const MAX_INITIAL_TILES: usize = 16;

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub delay_seconds: i64,
    pub update_interval_seconds: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            delay_seconds: 60,
            update_interval_seconds: 10,
        }
    }
}

// ============================================================================
// Message catalogue
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RaceConfig {
        race_id: String,
        name: String,
        timezone: String,
        delay_seconds: i64,
        update_interval: u64,
        interpolation_rate: u64,
        protocol_version: String,
        features: Vec<String>,
    },
    ViewerCount {
        count: usize,
        timestamp: DateTime<Utc>,
    },
    TileData {
        tile: [u32; 3],
        format: String,
        compression: String,
        data: String,
        timestamp: DateTime<Utc>,
    },
    DeltaUpdate {
        race_id: String,
        data: String,
        timestamp: DateTime<Utc>,
        compression: String,
        update_count: usize,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Stats {
        race_id: String,
        viewer_count: usize,
        subscribed_tiles: usize,
        delay_seconds: i64,
        update_interval: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ViewportUpdate { tiles: Vec<[u32; 3]> },
    RequestInitialData { zoom: u8, bbox: [f64; 4] },
    Ping,
    GetStats,
}

/// One pilot entry inside a decoded delta payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub pilot_id: String,
    pub pilot_name: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub x_mercator: f64,
    pub y_mercator: f64,
}

/// The JSON document inside a `delta_update`'s gzip envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub updates: Vec<DeltaEntry>,
}

pub fn gzip_base64(data: &[u8]) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(BASE64.encode(encoder.finish()?))
}

#[cfg(test)]
pub fn gunzip_base64(data: &str) -> Result<Vec<u8>> {
    use std::io::Read;
    let compressed = BASE64.decode(data)?;
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// The positions a client should see: pilots inside any subscribed tile,
/// plus the client's own pilot regardless of viewport.
pub fn visible_updates<'a>(
    positions: &'a [PilotPosition],
    tiles: &HashSet<TileCoord>,
    own_pilot: Option<&str>,
) -> Vec<&'a PilotPosition> {
    positions
        .iter()
        .filter(|p| {
            if own_pilot == Some(p.pilot_id.as_str()) {
                return true;
            }
            tiles
                .iter()
                .any(|tile| tile_at(p.lat, p.lon, tile.z) == *tile)
        })
        .collect()
}

fn delta_entries(updates: &[&PilotPosition], tick_ts: DateTime<Utc>) -> DeltaPayload {
    DeltaPayload {
        kind: "delta".to_string(),
        timestamp: tick_ts,
        updates: updates
            .iter()
            .map(|p| DeltaEntry {
                pilot_id: p.pilot_id.clone(),
                pilot_name: p.pilot_name.clone(),
                lat: p.lat,
                lon: p.lon,
                elevation: p.elevation,
                timestamp: p.datetime,
                x_mercator: mercator_x(p.lon),
                y_mercator: mercator_y(p.lat),
            })
            .collect(),
    }
}

// ============================================================================
// Clients
// ============================================================================

pub struct ClientHandle {
    pub pilot_id: Option<String>,
    tiles: RwLock<HashSet<TileCoord>>,
    tx: flume::Sender<ServerMessage>,
    /// Second receiver on the same channel, used only to evict the oldest
    /// queued message when the buffer is full.
    rx: flume::Receiver<ServerMessage>,
}

impl ClientHandle {
    fn subscribed_tiles(&self) -> HashSet<TileCoord> {
        self.tiles.read().expect("tiles lock poisoned").clone()
    }

    /// Lossy send for tick-driven traffic: when the buffer is full the
    /// oldest unsent message is dropped and the client resynchronises from
    /// the next tick. Demand-driven tile data is requeued, not dropped;
    /// when the evicted message turns out to be a tile, it takes the freed
    /// slot back and the new lossy message is the one that gets dropped.
    fn send_lossy(&self, msg: ServerMessage) {
        if let Err(flume::TrySendError::Full(msg)) = self.tx.try_send(msg) {
            metrics::counter!("fanout.client_buffer_overflows").increment(1);
            match self.rx.try_recv() {
                Ok(old @ ServerMessage::TileData { .. }) => {
                    let _ = self.tx.try_send(old);
                    let _ = self.tx.try_send(msg);
                }
                _ => {
                    let _ = self.tx.try_send(msg);
                }
            }
        }
    }

    pub async fn send_reliable(&self, msg: ServerMessage) {
        let _ = self.tx.send_async(msg).await;
    }
}

// ============================================================================
// Per-race hub
// ============================================================================

pub struct RaceHub {
    pub race: Race,
    cfg: FanoutConfig,
    clients: DashMap<String, Arc<ClientHandle>>,
    points_repo: TrackPointsRepository,
    cancel: CancellationToken,
}

impl RaceHub {
    pub fn new(
        race: Race,
        cfg: FanoutConfig,
        points_repo: TrackPointsRepository,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            race,
            cfg,
            clients: DashMap::new(),
            points_repo,
            cancel,
        })
    }

    pub fn race_config_message(&self) -> ServerMessage {
        ServerMessage::RaceConfig {
            race_id: self.race.id.to_string(),
            name: self.race.name.clone(),
            timezone: self
                .race
                .timezone
                .clone()
                .unwrap_or_else(|| "UTC".to_string()),
            delay_seconds: self.cfg.delay_seconds,
            update_interval: self.cfg.update_interval_seconds,
            interpolation_rate: 1,
            protocol_version: PROTOCOL_VERSION.to_string(),
            features: vec!["viewport_tiles".to_string(), "delta_updates".to_string()],
        }
    }

    /// Register a client; returns its handle and the receiver the socket
    /// writer drains.
    pub fn register(
        &self,
        client_id: &str,
        pilot_id: Option<String>,
    ) -> (Arc<ClientHandle>, flume::Receiver<ServerMessage>) {
        let (tx, rx) = flume::bounded(CLIENT_BUFFER);
        let handle = Arc::new(ClientHandle {
            pilot_id,
            tiles: RwLock::new(HashSet::new()),
            tx,
            rx: rx.clone(),
        });
        self.clients.insert(client_id.to_string(), handle.clone());
        metrics::gauge!("fanout.clients").increment(1.0);
        info!(race_id = %self.race.id, client_id, "Live client connected");
        (handle, rx)
    }

    pub fn unregister(&self, client_id: &str) {
        if self.clients.remove(client_id).is_some() {
            metrics::gauge!("fanout.clients").decrement(1.0);
            info!(race_id = %self.race.id, client_id, "Live client disconnected");
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.clients.len()
    }

    /// Atomically replace a client's subscription set. Invalid tile
    /// coordinates are discarded.
    pub fn update_viewport(&self, client_id: &str, raw_tiles: &[[u32; 3]]) -> usize {
        let tiles: HashSet<TileCoord> = raw_tiles
            .iter()
            .filter_map(|&t| TileCoord::from_zxy(t))
            .collect();
        let count = tiles.len();

        if let Some(handle) = self.clients.get(client_id) {
            *handle.tiles.write().expect("tiles lock poisoned") = tiles;
            debug!(client_id, tiles = count, "Viewport updated");
        }
        count
    }

    /// Positions the current tick may broadcast: everything at or before
    /// now minus the broadcast delay.
    pub async fn delayed_positions(&self) -> Result<Vec<PilotPosition>> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.cfg.delay_seconds);
        self.points_repo
            .latest_positions_for_race(self.race.id, cutoff)
            .await
    }

    fn delta_message(&self, updates: &[&PilotPosition], tick_ts: DateTime<Utc>) -> Result<ServerMessage> {
        let payload = delta_entries(updates, tick_ts);
        let json = serde_json::to_vec(&payload)?;
        Ok(ServerMessage::DeltaUpdate {
            race_id: self.race.id.to_string(),
            data: gzip_base64(&json)?,
            timestamp: tick_ts,
            compression: "gzip".to_string(),
            update_count: payload.updates.len(),
        })
    }

    /// Catch-up push after a viewport change: everything in the new tile
    /// set, without waiting for the next tick.
    pub async fn send_catchup(&self, client_id: &str) {
        let Some(handle) = self.clients.get(client_id).map(|h| h.clone()) else {
            return;
        };
        let positions = match self.delayed_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Catch-up read failed: {:#}", e);
                return;
            }
        };

        let tiles = handle.subscribed_tiles();
        let updates = visible_updates(&positions, &tiles, handle.pilot_id.as_deref());
        if updates.is_empty() {
            return;
        }
        match self.delta_message(&updates, Utc::now()) {
            Ok(msg) => handle.send_reliable(msg).await,
            Err(e) => warn!("Failed to encode catch-up delta: {:#}", e),
        }
    }

    /// Demand-driven vector tiles for a bbox prime. Never dropped.
    pub async fn send_tiles(&self, client_id: &str, zoom: u8, bbox: [f64; 4]) {
        let Some(handle) = self.clients.get(client_id).map(|h| h.clone()) else {
            return;
        };
        let positions = match self.delayed_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Tile read failed: {:#}", e);
                return;
            }
        };

        let now = Utc::now();
        for tile in tiles_covering_bbox(bbox, zoom.min(18), MAX_INITIAL_TILES) {
            let mvt = encode_pilot_tile(tile, &positions);
            let data = match gzip_base64(&mvt) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Failed to compress tile: {:#}", e);
                    continue;
                }
            };
            handle
                .send_reliable(ServerMessage::TileData {
                    tile: tile.to_zxy(),
                    format: "mvt".to_string(),
                    compression: "gzip".to_string(),
                    data,
                    timestamp: now,
                })
                .await;
            metrics::counter!("fanout.tiles_sent").increment(1);
        }
    }

    pub fn stats_message(&self, client_id: &str) -> ServerMessage {
        let subscribed_tiles = self
            .clients
            .get(client_id)
            .map(|h| h.subscribed_tiles().len())
            .unwrap_or(0);
        ServerMessage::Stats {
            race_id: self.race.id.to_string(),
            viewer_count: self.viewer_count(),
            subscribed_tiles,
            delay_seconds: self.cfg.delay_seconds,
            update_interval: self.cfg.update_interval_seconds,
        }
    }

    /// The tick loop. Strictly serial per race; a slow broadcast causes the
    /// next tick to be skipped by the interval's missed-tick policy.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.update_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick_index = 0u64;

        info!(race_id = %self.race.id, "Fan-out hub started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tick_index += 1;

            let tick_ts = Utc::now();
            let positions = match self.delayed_positions().await {
                Ok(p) => p,
                Err(e) => {
                    // Clients see a missed tick, never the error.
                    warn!(race_id = %self.race.id, "Tick read failed: {:#}", e);
                    metrics::counter!("fanout.tick_read_errors").increment(1);
                    continue;
                }
            };
            metrics::gauge!("fanout.tick_positions").set(positions.len() as f64);

            for entry in self.clients.iter() {
                let handle = entry.value();
                let tiles = handle.subscribed_tiles();
                let updates = visible_updates(&positions, &tiles, handle.pilot_id.as_deref());
                if updates.is_empty() {
                    continue;
                }
                match self.delta_message(&updates, tick_ts) {
                    Ok(msg) => handle.send_lossy(msg),
                    Err(e) => warn!("Failed to encode delta: {:#}", e),
                }
            }
            metrics::counter!("fanout.ticks").increment(1);

            if tick_index % VIEWER_COUNT_EVERY_TICKS == 0 {
                let count = self.viewer_count();
                for entry in self.clients.iter() {
                    entry.value().send_lossy(ServerMessage::ViewerCount {
                        count,
                        timestamp: tick_ts,
                    });
                    entry
                        .value()
                        .send_lossy(ServerMessage::Heartbeat { timestamp: tick_ts });
                }
            }
        }

        info!(race_id = %self.race.id, "Fan-out hub stopped");
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide map of race id to running hub. Hubs are created on first
/// client and all share the shutdown token.
pub struct HubRegistry {
    hubs: DashMap<Uuid, Arc<RaceHub>>,
    points_repo: TrackPointsRepository,
    cfg: FanoutConfig,
    cancel: CancellationToken,
}

impl HubRegistry {
    pub fn new(
        points_repo: TrackPointsRepository,
        cfg: FanoutConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            hubs: DashMap::new(),
            points_repo,
            cfg,
            cancel,
        })
    }

    pub fn hub_for(&self, race: Race) -> Arc<RaceHub> {
        self.hubs
            .entry(race.id)
            .or_insert_with(|| {
                let hub = RaceHub::new(
                    race,
                    self.cfg.clone(),
                    self.points_repo.clone(),
                    self.cancel.clone(),
                );
                tokio::spawn(hub.clone().run());
                hub
            })
            .clone()
    }

    pub fn get(&self, race_id: Uuid) -> Option<Arc<RaceHub>> {
        self.hubs.get(&race_id).map(|h| h.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pos(pilot: &str, lat: f64, lon: f64) -> PilotPosition {
        PilotPosition {
            pilot_id: pilot.to_string(),
            pilot_name: format!("Pilot {}", pilot),
            lat,
            lon,
            elevation: Some(1500.0),
            datetime: Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_delta_payload_gzip_base64_round_trip() {
        let positions = vec![pos("p1", 46.5, 8.2)];
        let refs: Vec<&PilotPosition> = positions.iter().collect();
        let tick_ts = Utc.with_ymd_and_hms(2025, 6, 3, 12, 1, 0).unwrap();

        let payload = delta_entries(&refs, tick_ts);
        let json = serde_json::to_vec(&payload).unwrap();
        let encoded = gzip_base64(&json).unwrap();
        let decoded = gunzip_base64(&encoded).unwrap();
        let back: DeltaPayload = serde_json::from_slice(&decoded).unwrap();

        assert_eq!(back.kind, "delta");
        assert_eq!(back.timestamp, tick_ts);
        assert_eq!(back.updates.len(), 1);
        let entry = &back.updates[0];
        assert_eq!(entry.pilot_id, "p1");
        assert!((entry.x_mercator - mercator_x(8.2)).abs() < 1e-6);
        assert!((entry.y_mercator - mercator_y(46.5)).abs() < 1e-6);
    }

    #[test]
    fn test_visible_updates_scoped_to_tiles() {
        let positions = vec![pos("inside", 46.5, 8.2), pos("outside", 44.0, 3.0)];
        let tiles: HashSet<TileCoord> = [tile_at(46.5, 8.2, 10)].into_iter().collect();

        let visible = visible_updates(&positions, &tiles, None);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].pilot_id, "inside");
    }

    #[test]
    fn test_own_pilot_always_visible() {
        let positions = vec![pos("me", 44.0, 3.0)];
        let tiles: HashSet<TileCoord> = [tile_at(46.5, 8.2, 10)].into_iter().collect();

        assert!(visible_updates(&positions, &tiles, None).is_empty());
        let visible = visible_updates(&positions, &tiles, Some("me"));
        assert_eq!(visible.len(), 1);
    }

    #[test]
    fn test_zero_tiles_zero_updates() {
        let positions = vec![pos("p1", 46.5, 8.2)];
        let tiles = HashSet::new();
        assert!(visible_updates(&positions, &tiles, None).is_empty());
    }

    #[test]
    fn test_lossy_send_drops_oldest_delta_keeps_tiles() {
        let (tx, rx) = flume::bounded(2);
        let handle = ClientHandle {
            pilot_id: None,
            tiles: RwLock::new(HashSet::new()),
            tx,
            rx: rx.clone(),
        };

        let delta = |n: usize| ServerMessage::DeltaUpdate {
            race_id: "r".to_string(),
            data: format!("payload-{}", n),
            timestamp: Utc::now(),
            compression: "gzip".to_string(),
            update_count: n,
        };

        handle.send_lossy(delta(1));
        handle.send_lossy(delta(2));
        // Buffer full: the oldest delta gives way to the newest.
        handle.send_lossy(delta(3));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());

        let counts: Vec<usize> = [first, second]
            .into_iter()
            .map(|m| match m {
                ServerMessage::DeltaUpdate { update_count, .. } => update_count,
                _ => panic!("unexpected message"),
            })
            .collect();
        assert_eq!(counts, vec![2, 3]);
    }

    #[test]
    fn test_lossy_send_never_drops_tile_data() {
        let (tx, rx) = flume::bounded(2);
        let handle = ClientHandle {
            pilot_id: None,
            tiles: RwLock::new(HashSet::new()),
            tx,
            rx: rx.clone(),
        };

        let tile = ServerMessage::TileData {
            tile: [10, 534, 361],
            format: "mvt".to_string(),
            compression: "gzip".to_string(),
            data: "tile-bytes".to_string(),
            timestamp: Utc::now(),
        };
        let delta = ServerMessage::DeltaUpdate {
            race_id: "r".to_string(),
            data: "payload".to_string(),
            timestamp: Utc::now(),
            compression: "gzip".to_string(),
            update_count: 1,
        };

        handle.send_lossy(tile.clone());
        handle.send_lossy(delta.clone());
        // Buffer full and the oldest queued message is the tile: the new
        // delta is the one sacrificed, never the demand-driven tile.
        handle.send_lossy(delta.clone());

        let mut tiles_seen = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, ServerMessage::TileData { .. }) {
                tiles_seen += 1;
            }
        }
        assert_eq!(tiles_seen, 1, "tile data must survive buffer overflow");
    }

    #[test]
    fn test_message_wire_tags() {
        let msg = ServerMessage::Heartbeat {
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "heartbeat");

        let client: ClientMessage = serde_json::from_str(
            r#"{"type":"viewport_update","tiles":[[10,534,361],[10,535,361]]}"#,
        )
        .unwrap();
        let ClientMessage::ViewportUpdate { tiles } = client else {
            panic!("expected viewport update");
        };
        assert_eq!(tiles.len(), 2);

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));
    }
}
