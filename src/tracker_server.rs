// GPS tracker TCP front-end.
//
// One listener, two protocols auto-detected from the first byte of the
// connection. Each connection runs a small state machine
// (awaiting_login -> active <-> idle -> closing) and produces normalized
// positions into the live queue via the flight separator. Rate limits are
// shaped for flaky cellular coverage: frames are throttled hard, but
// reconnections are deliberately cheap.

use anyhow::Result;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::devices::TrackerDevice;
use crate::devices_repo::DevicesRepository;
use crate::flight_tracker::{FlightTracker, IncomingPoint};
use crate::flights::FlightSource;
use crate::point_queue::{PointQueue, QueueItem, QueuePoint};
use crate::queue_config::QueueKind;
use crate::races::Race;
use crate::races_repo::RacesRepository;
use crate::tracker_protocol::{FrameSplitter, GpsFrame, GpsProtocol, parse_frame};

#[derive(Debug, Clone)]
pub struct GpsServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub max_per_ip: usize,
    /// Minimum spacing between frames from one device; faster frames are
    /// dropped silently.
    pub min_message_interval: Duration,
    /// Frames per device per rolling minute.
    pub window_limit: usize,
    /// Reconnections per device per five minutes. Deliberately generous:
    /// cellular trackers reconnect constantly.
    pub reconnect_limit: usize,
    pub blacklist_secs: u64,
    pub idle_close: Duration,
    pub max_consecutive_malformed: u32,
}

impl Default for GpsServerConfig {
    fn default() -> Self {
        Self {
            port: 5002,
            max_connections: 1_000,
            max_per_ip: 50,
            min_message_interval: Duration::from_secs(2),
            window_limit: 20,
            reconnect_limit: 100,
            blacklist_secs: 60,
            idle_close: Duration::from_secs(300),
            max_consecutive_malformed: 5,
        }
    }
}

// ============================================================================
// Per-device rate policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAdmission {
    Accept,
    /// Token dropped without any protocol-level response.
    DropSilently,
}

#[derive(Default)]
struct DeviceRate {
    last_frame: Option<Instant>,
    frames: VecDeque<Instant>,
    reconnects: VecDeque<Instant>,
}

pub struct DeviceRateLimiter {
    min_interval: Duration,
    window_limit: usize,
    reconnect_limit: usize,
    devices: DashMap<String, DeviceRate>,
}

const FRAME_WINDOW: Duration = Duration::from_secs(60);
const RECONNECT_WINDOW: Duration = Duration::from_secs(300);

impl DeviceRateLimiter {
    pub fn new(min_interval: Duration, window_limit: usize, reconnect_limit: usize) -> Self {
        Self {
            min_interval,
            window_limit,
            reconnect_limit,
            devices: DashMap::new(),
        }
    }

    pub fn admit_frame(&self, device_id: &str, now: Instant) -> FrameAdmission {
        let mut entry = self.devices.entry(device_id.to_string()).or_default();

        if let Some(last) = entry.last_frame
            && now.duration_since(last) < self.min_interval
        {
            return FrameAdmission::DropSilently;
        }

        while let Some(&front) = entry.frames.front() {
            if now.duration_since(front) >= FRAME_WINDOW {
                entry.frames.pop_front();
            } else {
                break;
            }
        }
        if entry.frames.len() >= self.window_limit {
            return FrameAdmission::DropSilently;
        }

        entry.last_frame = Some(now);
        entry.frames.push_back(now);
        FrameAdmission::Accept
    }

    /// Reconnections are admitted up to the cap; beyond it the connection is
    /// refused outright.
    pub fn admit_reconnect(&self, device_id: &str, now: Instant) -> bool {
        let mut entry = self.devices.entry(device_id.to_string()).or_default();

        while let Some(&front) = entry.reconnects.front() {
            if now.duration_since(front) >= RECONNECT_WINDOW {
                entry.reconnects.pop_front();
            } else {
                break;
            }
        }
        if entry.reconnects.len() >= self.reconnect_limit {
            return false;
        }
        entry.reconnects.push_back(now);
        true
    }
}

// ============================================================================
// Per-IP abuse detection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAdmission {
    Accept,
    Blacklisted,
    TooManyFromIp,
    ServerFull,
}

#[derive(Default)]
struct IpState {
    recent: VecDeque<Instant>,
    blacklisted_until: Option<Instant>,
    active: usize,
}

pub struct IpAbuseGuard {
    max_new_per_sec: usize,
    max_per_ip: usize,
    max_connections: usize,
    blacklist: Duration,
    active_total: AtomicUsize,
    ips: DashMap<IpAddr, IpState>,
}

impl IpAbuseGuard {
    pub fn new(max_per_ip: usize, max_connections: usize, blacklist_secs: u64) -> Self {
        Self {
            max_new_per_sec: 10,
            max_per_ip,
            max_connections,
            blacklist: Duration::from_secs(blacklist_secs),
            active_total: AtomicUsize::new(0),
            ips: DashMap::new(),
        }
    }

    pub fn admit(&self, ip: IpAddr, now: Instant) -> ConnAdmission {
        if self.active_total.load(Ordering::Relaxed) >= self.max_connections {
            return ConnAdmission::ServerFull;
        }

        // Loopback is exempt from blacklisting and per-IP caps.
        if ip.is_loopback() {
            self.active_total.fetch_add(1, Ordering::Relaxed);
            return ConnAdmission::Accept;
        }

        let mut state = self.ips.entry(ip).or_default();

        if let Some(until) = state.blacklisted_until {
            if now < until {
                return ConnAdmission::Blacklisted;
            }
            state.blacklisted_until = None;
        }

        while let Some(&front) = state.recent.front() {
            if now.duration_since(front) >= Duration::from_secs(1) {
                state.recent.pop_front();
            } else {
                break;
            }
        }
        state.recent.push_back(now);
        if state.recent.len() > self.max_new_per_sec {
            state.blacklisted_until = Some(now + self.blacklist);
            metrics::counter!("gps.abuse.blacklisted").increment(1);
            warn!("Blacklisting {} for {}s: connection flood", ip, self.blacklist.as_secs());
            return ConnAdmission::Blacklisted;
        }

        if state.active >= self.max_per_ip {
            return ConnAdmission::TooManyFromIp;
        }

        state.active += 1;
        self.active_total.fetch_add(1, Ordering::Relaxed);
        ConnAdmission::Accept
    }

    pub fn release(&self, ip: IpAddr) {
        self.active_total.fetch_sub(1, Ordering::Relaxed);
        if !ip.is_loopback()
            && let Some(mut state) = self.ips.get_mut(&ip)
            && state.active > 0
        {
            state.active -= 1;
        }
    }
}

// ============================================================================
// Connection handling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    AwaitingLogin,
    Active,
    Idle,
    Closing,
}

/// Everything a connection task needs, cheap to clone.
#[derive(Clone)]
pub struct GpsContext {
    pub queue: PointQueue,
    pub flight_tracker: Arc<FlightTracker>,
    pub devices_repo: DevicesRepository,
    pub races_repo: RacesRepository,
}

pub struct GpsServer {
    config: GpsServerConfig,
    ctx: GpsContext,
    limiter: Arc<DeviceRateLimiter>,
    guard: Arc<IpAbuseGuard>,
    cancel: CancellationToken,
}

impl GpsServer {
    pub fn new(config: GpsServerConfig, ctx: GpsContext, cancel: CancellationToken) -> Self {
        let limiter = Arc::new(DeviceRateLimiter::new(
            config.min_message_interval,
            config.window_limit,
            config.reconnect_limit,
        ));
        let guard = Arc::new(IpAbuseGuard::new(
            config.max_per_ip,
            config.max_connections,
            config.blacklist_secs,
        ));
        Self {
            config,
            ctx,
            limiter,
            guard,
            cancel,
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        info!("GPS tracker server listening on {}", addr);

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("GPS tracker server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("GPS accept error: {}", e);
                        metrics::counter!("gps.errors.accept").increment(1);
                        continue;
                    }
                },
            };

            match self.guard.admit(peer.ip(), Instant::now()) {
                ConnAdmission::Accept => {}
                verdict => {
                    debug!("Refused GPS connection from {}: {:?}", peer, verdict);
                    metrics::counter!("gps.connections.refused").increment(1);
                    continue;
                }
            }

            metrics::gauge!("gps.connections.active").increment(1.0);
            metrics::counter!("gps.connections.accepted").increment(1);

            let config = self.config.clone();
            let ctx = self.ctx.clone();
            let limiter = self.limiter.clone();
            let guard = self.guard.clone();
            let cancel = self.cancel.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer, config, ctx, limiter, cancel).await
                {
                    debug!("GPS connection from {} ended: {}", peer, e);
                }
                guard.release(peer.ip());
                metrics::gauge!("gps.connections.active").decrement(1.0);
                metrics::counter!("gps.connections.closed").increment(1);
            });
        }

        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: GpsServerConfig,
    ctx: GpsContext,
    limiter: Arc<DeviceRateLimiter>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; 1024];

    // The first byte routes the connection; unknown protocols get a short
    // leash of three malformed reads before the drop.
    let mut protocol: Option<GpsProtocol> = None;
    let mut unknown_reads = 0u32;
    let mut first_chunk: Vec<u8> = Vec::new();

    while protocol.is_none() {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = tokio::time::timeout(config.idle_close, stream.read(&mut buf)) => match read {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(()), // idle before ever speaking
            },
        };

        match GpsProtocol::detect(buf[0]) {
            Some(p) => {
                protocol = Some(p);
                first_chunk.extend_from_slice(&buf[..n]);
            }
            None => {
                unknown_reads += 1;
                metrics::counter!("gps.frames.malformed").increment(1);
                if unknown_reads >= 3 {
                    debug!("Dropping {}: undetectable protocol", peer);
                    return Ok(());
                }
            }
        }
    }

    let Some(protocol) = protocol else {
        return Ok(());
    };
    let mut splitter = FrameSplitter::new(protocol);
    let mut state = ConnState::AwaitingLogin;
    let mut consecutive_malformed = 0u32;
    let mut session: Option<(TrackerDevice, Race, FlightSource)> = None;
    let mut last_frame_at = Instant::now();

    let (mut frames, mut junk) = splitter.push(&first_chunk);

    loop {
        consecutive_malformed += junk as u32;

        for body in frames.drain(..) {
            match parse_frame(protocol, &body) {
                Ok(frame) => {
                    consecutive_malformed = 0;
                    last_frame_at = Instant::now();
                    if state == ConnState::Idle {
                        state = ConnState::Active;
                    }
                    handle_frame(
                        frame,
                        &mut state,
                        &mut session,
                        &mut stream,
                        &ctx,
                        &limiter,
                    )
                    .await?;
                }
                Err(e) => {
                    consecutive_malformed += 1;
                    metrics::counter!("gps.frames.malformed").increment(1);
                    debug!("Malformed {:?} frame from {}: {}", protocol, peer, e);
                }
            }
        }

        if consecutive_malformed >= config.max_consecutive_malformed {
            debug!("Closing {}: {} consecutive malformed frames", peer, consecutive_malformed);
            state = ConnState::Closing;
        }
        if last_frame_at.elapsed() > config.idle_close {
            debug!("Closing {}: idle for {:?}", peer, last_frame_at.elapsed());
            state = ConnState::Closing;
        }
        if state == ConnState::Closing {
            break;
        }

        let n = tokio::select! {
            _ = cancel.cancelled() => {
                state = ConnState::Closing;
                break;
            }
            read = tokio::time::timeout(config.min_message_interval, stream.read(&mut buf)) => match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    // No frame within the message interval: the device is
                    // between reports, not gone.
                    if state == ConnState::Active {
                        state = ConnState::Idle;
                    }
                    continue;
                }
            },
        };

        (frames, junk) = splitter.push(&buf[..n]);
    }

    let _ = state;
    Ok(())
}

async fn handle_frame(
    frame: GpsFrame,
    state: &mut ConnState,
    session: &mut Option<(TrackerDevice, Race, FlightSource)>,
    stream: &mut TcpStream,
    ctx: &GpsContext,
    limiter: &DeviceRateLimiter,
) -> Result<()> {
    match frame {
        GpsFrame::Login { device_id, ack } => {
            if !limiter.admit_reconnect(&device_id, Instant::now()) {
                debug!("Reconnect cap hit for device {}", device_id);
                metrics::counter!("gps.logins.rate_limited").increment(1);
                *state = ConnState::Closing;
                return Ok(());
            }

            let Some(device) = ctx.devices_repo.get_by_device_id(&device_id).await? else {
                debug!("Login from unregistered device {}", device_id);
                metrics::counter!("gps.logins.unknown_device").increment(1);
                return Ok(());
            };
            let Some(race) = ctx.races_repo.get_by_id(device.race_uuid).await? else {
                warn!("Device {} registered to missing race {}", device_id, device.race_uuid);
                return Ok(());
            };
            let source = FlightSource::parse(&device.source).unwrap_or(FlightSource::Tk905bLive);

            if let Some(ack) = ack {
                stream.write_all(ack.as_bytes()).await?;
            }

            info!("Device {} logged in (pilot {})", device_id, device.pilot_id);
            metrics::counter!("gps.logins.accepted").increment(1);
            *session = Some((device, race, source));
            *state = ConnState::Active;
        }
        GpsFrame::Heartbeat { device_id, ack } => {
            metrics::counter!("gps.frames.heartbeat").increment(1);
            if let Some(ack) = ack {
                stream.write_all(ack.as_bytes()).await?;
            }
            let _ = device_id;
        }
        GpsFrame::Location(position) | GpsFrame::Alarm(position) => {
            let Some((device, race, source)) = session.as_ref() else {
                // Positions before login carry no pilot identity; drop them.
                metrics::counter!("gps.frames.before_login").increment(1);
                return Ok(());
            };

            if limiter.admit_frame(&position.device_id, Instant::now())
                == FrameAdmission::DropSilently
            {
                metrics::counter!("gps.frames.rate_limited").increment(1);
                return Ok(());
            }

            let point = IncomingPoint {
                lat: position.lat,
                lon: position.lon,
                elevation: position.elevation,
                timestamp: position.timestamp,
            };

            let assigned = ctx
                .flight_tracker
                .assign_point(device, race, *source, &point)
                .await?;

            let item = QueueItem::new(
                QueueKind::LivePoints,
                assigned.flight_id,
                vec![QueuePoint {
                    lat: position.lat,
                    lon: position.lon,
                    elevation: position.elevation,
                    datetime: position.timestamp,
                }],
            );

            if let Err(e) = ctx.queue.enqueue(QueueKind::LivePoints, &item).await {
                // No direct-write fallback on this path; the tracker will
                // resend and the queue usually comes back first.
                warn!("Failed to enqueue tracker point: {}", e);
                metrics::counter!("gps.enqueue_failures").increment(1);
            } else {
                metrics::counter!("gps.points.enqueued").increment(1);
            }
        }
        GpsFrame::NoFix { device_id } => {
            metrics::counter!("gps.frames.no_fix").increment(1);
            let _ = device_id;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_interval_drops_fast_frames() {
        let limiter = DeviceRateLimiter::new(Duration::from_secs(2), 20, 100);
        let t0 = Instant::now();

        assert_eq!(limiter.admit_frame("dev", t0), FrameAdmission::Accept);
        assert_eq!(
            limiter.admit_frame("dev", t0 + Duration::from_millis(500)),
            FrameAdmission::DropSilently
        );
        assert_eq!(
            limiter.admit_frame("dev", t0 + Duration::from_secs(2)),
            FrameAdmission::Accept
        );
    }

    #[test]
    fn test_rolling_window_limit() {
        let limiter = DeviceRateLimiter::new(Duration::from_millis(0), 20, 100);
        let t0 = Instant::now();

        // 20 frames spaced well apart inside one minute all pass.
        for i in 0..20 {
            assert_eq!(
                limiter.admit_frame("dev", t0 + Duration::from_millis(i * 2_500)),
                FrameAdmission::Accept,
                "frame {} should pass",
                i
            );
        }
        // The 21st inside the window is dropped.
        assert_eq!(
            limiter.admit_frame("dev", t0 + Duration::from_millis(52_000)),
            FrameAdmission::DropSilently
        );
        // Once the window slides, frames flow again.
        assert_eq!(
            limiter.admit_frame("dev", t0 + Duration::from_secs(61)),
            FrameAdmission::Accept
        );
    }

    #[test]
    fn test_window_is_per_device() {
        let limiter = DeviceRateLimiter::new(Duration::from_secs(2), 20, 100);
        let t0 = Instant::now();
        assert_eq!(limiter.admit_frame("a", t0), FrameAdmission::Accept);
        assert_eq!(limiter.admit_frame("b", t0), FrameAdmission::Accept);
    }

    #[test]
    fn test_reconnects_tolerated_up_to_cap() {
        let limiter = DeviceRateLimiter::new(Duration::from_secs(2), 20, 100);
        let t0 = Instant::now();

        for i in 0..100 {
            assert!(
                limiter.admit_reconnect("dev", t0 + Duration::from_millis(i * 10)),
                "reconnect {} should be tolerated",
                i
            );
        }
        assert!(!limiter.admit_reconnect("dev", t0 + Duration::from_secs(2)));
        // The five-minute window slides the cap away.
        assert!(limiter.admit_reconnect("dev", t0 + Duration::from_secs(301)));
    }

    #[test]
    fn test_connection_flood_blacklists_ip() {
        let guard = IpAbuseGuard::new(50, 1_000, 60);
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let t0 = Instant::now();

        for i in 0..10 {
            assert_eq!(
                guard.admit(ip, t0 + Duration::from_millis(i * 10)),
                ConnAdmission::Accept
            );
        }
        // The 11th connection within a second trips the blacklist.
        assert_eq!(
            guard.admit(ip, t0 + Duration::from_millis(150)),
            ConnAdmission::Blacklisted
        );
        // Still blacklisted just before expiry, clear after.
        assert_eq!(
            guard.admit(ip, t0 + Duration::from_secs(59)),
            ConnAdmission::Blacklisted
        );
        assert_ne!(
            guard.admit(ip, t0 + Duration::from_secs(62)),
            ConnAdmission::Blacklisted
        );
    }

    #[test]
    fn test_loopback_exempt_from_blacklist() {
        let guard = IpAbuseGuard::new(50, 1_000, 60);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let t0 = Instant::now();

        for _ in 0..100 {
            assert_eq!(guard.admit(ip, t0), ConnAdmission::Accept);
        }
    }

    #[test]
    fn test_per_ip_connection_cap() {
        let guard = IpAbuseGuard::new(3, 1_000, 60);
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        let t0 = Instant::now();

        // Spaced out so the flood detector stays quiet.
        assert_eq!(guard.admit(ip, t0), ConnAdmission::Accept);
        assert_eq!(guard.admit(ip, t0 + Duration::from_secs(2)), ConnAdmission::Accept);
        assert_eq!(guard.admit(ip, t0 + Duration::from_secs(4)), ConnAdmission::Accept);
        assert_eq!(
            guard.admit(ip, t0 + Duration::from_secs(6)),
            ConnAdmission::TooManyFromIp
        );

        guard.release(ip);
        assert_eq!(guard.admit(ip, t0 + Duration::from_secs(8)), ConnAdmission::Accept);
    }

    #[test]
    fn test_server_capacity_cap() {
        let guard = IpAbuseGuard::new(50, 2, 60);
        let a: IpAddr = "198.51.100.1".parse().unwrap();
        let b: IpAddr = "198.51.100.2".parse().unwrap();
        let c: IpAddr = "198.51.100.3".parse().unwrap();
        let t0 = Instant::now();

        assert_eq!(guard.admit(a, t0), ConnAdmission::Accept);
        assert_eq!(guard.admit(b, t0), ConnAdmission::Accept);
        assert_eq!(guard.admit(c, t0), ConnAdmission::ServerFull);
    }
}
