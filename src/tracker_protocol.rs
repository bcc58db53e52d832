// Wire decoders for the two GPS tracker protocols the TCP front-end speaks.
//
// Watch/TK905B: bracket-framed `[DEVICE_ID*LENGTH*PAYLOAD]`, payload is a
// comma-delimited record whose leading token names the kind (UD2 location,
// LK login/keepalive, HEART heartbeat, AL alarm).
//
// TK103: parenthesised `(DEVICE_ID,CMD,FIELDS...)` with BR00 locations,
// BP04 heartbeats and BP05 logins.
//
// Cellular trackers concatenate frames into one TCP segment and split them
// across segments, so both decoders run behind a byte-level splitter that
// re-frames the stream first.

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

/// Upper bound on a single frame. Anything longer is junk and resets the
/// splitter.
const MAX_FRAME_BYTES: usize = 2_048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsProtocol {
    Watch,
    Tk103,
}

impl GpsProtocol {
    /// First byte of the connection decides the protocol.
    pub fn detect(first_byte: u8) -> Option<Self> {
        match first_byte {
            b'[' => Some(GpsProtocol::Watch),
            b'(' => Some(GpsProtocol::Tk103),
            _ => None,
        }
    }

    fn delimiters(&self) -> (u8, u8) {
        match self {
            GpsProtocol::Watch => (b'[', b']'),
            GpsProtocol::Tk103 => (b'(', b')'),
        }
    }
}

/// A location report normalized out of either protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerPosition {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub battery: Option<i32>,
    pub speed_kmh: Option<f64>,
    pub heading: Option<f64>,
}

/// A decoded frame, protocol differences erased.
#[derive(Debug, Clone, PartialEq)]
pub enum GpsFrame {
    Login {
        device_id: String,
        ack: Option<String>,
    },
    Heartbeat {
        device_id: String,
        ack: Option<String>,
    },
    Location(TrackerPosition),
    Alarm(TrackerPosition),
    /// Well-formed frame from a device without GPS lock; dropped silently.
    NoFix {
        device_id: String,
    },
}

impl GpsFrame {
    pub fn device_id(&self) -> &str {
        match self {
            GpsFrame::Login { device_id, .. }
            | GpsFrame::Heartbeat { device_id, .. }
            | GpsFrame::NoFix { device_id } => device_id,
            GpsFrame::Location(p) | GpsFrame::Alarm(p) => &p.device_id,
        }
    }
}

/// Re-frames a TCP byte stream into complete frame bodies (delimiters
/// stripped). Tolerates concatenated frames in one read and partial frames
/// split across reads; inter-frame garbage is counted so the connection
/// state machine can give up on noisy peers.
pub struct FrameSplitter {
    open: u8,
    close: u8,
    buf: Vec<u8>,
}

impl FrameSplitter {
    pub fn new(protocol: GpsProtocol) -> Self {
        let (open, close) = protocol.delimiters();
        Self {
            open,
            close,
            buf: Vec::new(),
        }
    }

    /// Feed bytes; returns (complete frame bodies, junk event count).
    pub fn push(&mut self, data: &[u8]) -> (Vec<String>, usize) {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut junk = 0;

        loop {
            // Drop anything before the next frame start.
            match self.buf.iter().position(|&b| b == self.open) {
                Some(0) => {}
                Some(start) => {
                    self.buf.drain(..start);
                    junk += 1;
                }
                None => {
                    if !self.buf.is_empty() {
                        junk += 1;
                        self.buf.clear();
                    }
                    break;
                }
            }

            match self.buf.iter().position(|&b| b == self.close) {
                Some(end) => {
                    let body = String::from_utf8_lossy(&self.buf[1..end]).into_owned();
                    self.buf.drain(..=end);
                    frames.push(body);
                }
                None => {
                    // Partial frame; wait for more bytes unless it has grown
                    // past any plausible frame size.
                    if self.buf.len() > MAX_FRAME_BYTES {
                        junk += 1;
                        self.buf.clear();
                    }
                    break;
                }
            }
        }

        (frames, junk)
    }
}

/// Parse one frame body for the given protocol.
pub fn parse_frame(protocol: GpsProtocol, body: &str) -> Result<GpsFrame> {
    match protocol {
        GpsProtocol::Watch => parse_watch_frame(body),
        GpsProtocol::Tk103 => parse_tk103_frame(body),
    }
}

// ============================================================================
// Watch / TK905B
// ============================================================================

fn parse_watch_frame(body: &str) -> Result<GpsFrame> {
    let mut parts = body.splitn(3, '*');
    let device_id = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("missing device id"))?
        .to_string();
    let _length = parts.next().ok_or_else(|| anyhow!("missing length field"))?;
    let payload = parts.next().ok_or_else(|| anyhow!("missing payload"))?;

    let fields: Vec<&str> = payload.split(',').collect();
    match fields[0] {
        "LK" => Ok(GpsFrame::Login {
            ack: Some(format!("[{}*2*LK]", device_id)),
            device_id,
        }),
        "HEART" => Ok(GpsFrame::Heartbeat {
            device_id,
            ack: None,
        }),
        "UD2" => {
            let position = parse_watch_location(device_id.clone(), &fields)?;
            Ok(match position {
                Some(position) => GpsFrame::Location(position),
                None => GpsFrame::NoFix { device_id },
            })
        }
        "AL" => {
            let position = parse_watch_location(device_id.clone(), &fields)?;
            Ok(match position {
                Some(position) => GpsFrame::Alarm(position),
                None => GpsFrame::NoFix { device_id },
            })
        }
        other => bail!("unknown watch payload kind: {}", other),
    }
}

/// UD2/AL body: kind, DDMMYY, HHMMSS, A|V, lat, N|S, lon, E|W, speed km/h,
/// heading, altitude, [sats, gsm, battery, ...]. A `V` validity flag means
/// the tracker has no satellite lock; the frame is well-formed but carries
/// no usable position.
fn parse_watch_location(device_id: String, fields: &[&str]) -> Result<Option<TrackerPosition>> {
    if fields.len() < 11 {
        bail!("watch location record too short: {} fields", fields.len());
    }

    match fields[3] {
        "A" => {}
        "V" => return Ok(None),
        other => bail!("bad validity flag: {}", other),
    }

    let timestamp = parse_ddmmyy_hhmmss(fields[1], fields[2])?;
    let lat = apply_hemisphere(parse_f64(fields[4], "latitude")?, fields[5])?;
    let lon = apply_hemisphere(parse_f64(fields[6], "longitude")?, fields[7])?;
    let speed_kmh = fields[8].parse::<f64>().ok();
    let heading = fields[9].parse::<f64>().ok();
    let elevation = fields[10].parse::<f64>().ok();
    let battery = fields.get(13).and_then(|s| s.parse::<i32>().ok());

    Ok(Some(TrackerPosition {
        device_id,
        lat,
        lon,
        elevation,
        timestamp,
        battery,
        speed_kmh,
        heading,
    }))
}

// ============================================================================
// TK103
// ============================================================================

fn parse_tk103_frame(body: &str) -> Result<GpsFrame> {
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 2 {
        bail!("tk103 frame too short");
    }
    let device_id = fields[0].to_string();
    if device_id.is_empty() {
        bail!("missing device id");
    }

    match fields[1] {
        "BP05" => Ok(GpsFrame::Login {
            ack: Some(format!("({},AP05)", device_id)),
            device_id,
        }),
        "BP04" => Ok(GpsFrame::Heartbeat {
            ack: Some(format!("({},AP04)", device_id)),
            device_id,
        }),
        "BR00" => parse_tk103_location(device_id, &fields),
        other => bail!("unknown tk103 command: {}", other),
    }
}

/// BR00 body: device, BR00, YYMMDD, A|V, lat ddmm.mmmm, N|S, lon dddmm.mmmm,
/// E|W, speed km/h, HHMMSS, heading. The protocol carries no altitude.
fn parse_tk103_location(device_id: String, fields: &[&str]) -> Result<GpsFrame> {
    if fields.len() < 11 {
        bail!("tk103 location record too short: {} fields", fields.len());
    }

    match fields[3] {
        "A" => {}
        "V" => return Ok(GpsFrame::NoFix { device_id }),
        other => bail!("bad validity flag: {}", other),
    }

    let date = fields[2];
    let time = fields[9];
    let timestamp = parse_yymmdd_hhmmss(date, time)?;
    let lat = apply_hemisphere(ddmm_to_degrees(parse_f64(fields[4], "latitude")?), fields[5])?;
    let lon = apply_hemisphere(ddmm_to_degrees(parse_f64(fields[6], "longitude")?), fields[7])?;
    let speed_kmh = fields[8].parse::<f64>().ok();
    let heading = fields[10].parse::<f64>().ok();

    Ok(GpsFrame::Location(TrackerPosition {
        device_id,
        lat,
        lon,
        elevation: None,
        timestamp,
        battery: None,
        speed_kmh,
        heading,
    }))
}

// ============================================================================
// Field helpers
// ============================================================================

fn parse_f64(s: &str, what: &str) -> Result<f64> {
    s.parse::<f64>()
        .map_err(|_| anyhow!("unparseable {}: {}", what, s))
}

fn apply_hemisphere(value: f64, hemisphere: &str) -> Result<f64> {
    match hemisphere {
        "N" | "E" => Ok(value),
        "S" | "W" => Ok(-value),
        other => bail!("bad hemisphere: {}", other),
    }
}

/// NMEA-style ddmm.mmmm to decimal degrees.
fn ddmm_to_degrees(value: f64) -> f64 {
    let degrees = (value / 100.0).trunc();
    let minutes = value - degrees * 100.0;
    degrees + minutes / 60.0
}

fn parse_ddmmyy_hhmmss(date: &str, time: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%d%m%y")
        .map_err(|_| anyhow!("unparseable date: {}", date))?;
    let time = NaiveTime::parse_from_str(time, "%H%M%S")
        .map_err(|_| anyhow!("unparseable time: {}", time))?;
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

fn parse_yymmdd_hhmmss(date: &str, time: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%y%m%d")
        .map_err(|_| anyhow!("unparseable date: {}", date))?;
    let time = NaiveTime::parse_from_str(time, "%H%M%S")
        .map_err(|_| anyhow!("unparseable time: {}", time))?;
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UD2: &str =
        "8800001234*0042*UD2,030625,093005,A,46.528392,N,8.123456,E,12.5,180.0,2104.0,8,85,72";

    #[test]
    fn test_protocol_detection() {
        assert_eq!(GpsProtocol::detect(b'['), Some(GpsProtocol::Watch));
        assert_eq!(GpsProtocol::detect(b'('), Some(GpsProtocol::Tk103));
        assert_eq!(GpsProtocol::detect(b'G'), None);
    }

    #[test]
    fn test_watch_location() {
        let frame = parse_frame(GpsProtocol::Watch, UD2).unwrap();
        let GpsFrame::Location(p) = frame else {
            panic!("expected location, got {:?}", frame);
        };
        assert_eq!(p.device_id, "8800001234");
        assert!((p.lat - 46.528392).abs() < 1e-9);
        assert!((p.lon - 8.123456).abs() < 1e-9);
        assert_eq!(p.elevation, Some(2104.0));
        assert_eq!(p.speed_kmh, Some(12.5));
        assert_eq!(p.heading, Some(180.0));
        assert_eq!(p.battery, Some(72));
        assert_eq!(
            p.timestamp,
            Utc.with_ymd_and_hms(2025, 6, 3, 9, 30, 5).unwrap()
        );
    }

    #[test]
    fn test_watch_southern_western_hemispheres() {
        let body = "881*0042*UD2,030625,093005,A,33.5,S,70.6,W,0.0,0.0,520.0";
        let GpsFrame::Location(p) = parse_frame(GpsProtocol::Watch, body).unwrap() else {
            panic!("expected location");
        };
        assert!(p.lat < 0.0);
        assert!(p.lon < 0.0);
    }

    #[test]
    fn test_watch_login_and_heartbeat() {
        let login = parse_frame(GpsProtocol::Watch, "8800001234*2*LK").unwrap();
        assert_eq!(
            login,
            GpsFrame::Login {
                device_id: "8800001234".to_string(),
                ack: Some("[8800001234*2*LK]".to_string()),
            }
        );

        let heart = parse_frame(GpsProtocol::Watch, "8800001234*5*HEART").unwrap();
        assert!(matches!(heart, GpsFrame::Heartbeat { ack: None, .. }));
    }

    #[test]
    fn test_watch_no_fix_dropped_not_malformed() {
        let body = "881*0042*UD2,030625,093005,V,0.0,N,0.0,E,0.0,0.0,0.0";
        assert!(matches!(
            parse_frame(GpsProtocol::Watch, body).unwrap(),
            GpsFrame::NoFix { .. }
        ));
    }

    #[test]
    fn test_watch_malformed() {
        assert!(parse_frame(GpsProtocol::Watch, "").is_err());
        assert!(parse_frame(GpsProtocol::Watch, "881*0042*WAT,1,2").is_err());
        assert!(parse_frame(GpsProtocol::Watch, "881*0042*UD2,030625").is_err());
        assert!(
            parse_frame(
                GpsProtocol::Watch,
                "881*0042*UD2,030625,093005,A,not-a-lat,N,8.1,E,0,0,0"
            )
            .is_err()
        );
    }

    #[test]
    fn test_tk103_location() {
        let body = "012345678901,BR00,250603,A,4631.7035,N,00807.4074,E,23.0,093005,270.5";
        let GpsFrame::Location(p) = parse_frame(GpsProtocol::Tk103, body).unwrap() else {
            panic!("expected location");
        };
        assert_eq!(p.device_id, "012345678901");
        // 4631.7035 -> 46 deg + 31.7035 min
        assert!((p.lat - (46.0 + 31.7035 / 60.0)).abs() < 1e-9);
        assert!((p.lon - (8.0 + 7.4074 / 60.0)).abs() < 1e-9);
        assert_eq!(p.elevation, None);
        assert_eq!(p.speed_kmh, Some(23.0));
        assert_eq!(
            p.timestamp,
            Utc.with_ymd_and_hms(2025, 6, 3, 9, 30, 5).unwrap()
        );
    }

    #[test]
    fn test_tk103_login_heartbeat_acks() {
        let login = parse_frame(GpsProtocol::Tk103, "012345678901,BP05,012345678901").unwrap();
        assert_eq!(
            login,
            GpsFrame::Login {
                device_id: "012345678901".to_string(),
                ack: Some("(012345678901,AP05)".to_string()),
            }
        );

        let heart = parse_frame(GpsProtocol::Tk103, "012345678901,BP04").unwrap();
        assert!(matches!(heart, GpsFrame::Heartbeat { ack: Some(_), .. }));
    }

    #[test]
    fn test_splitter_concatenated_frames() {
        let mut splitter = FrameSplitter::new(GpsProtocol::Watch);
        let (frames, junk) = splitter.push(b"[881*2*LK][881*5*HEART]");
        assert_eq!(frames, vec!["881*2*LK".to_string(), "881*5*HEART".to_string()]);
        assert_eq!(junk, 0);
    }

    #[test]
    fn test_splitter_partial_frames_across_reads() {
        let mut splitter = FrameSplitter::new(GpsProtocol::Watch);
        let (frames, _) = splitter.push(b"[881*2*L");
        assert!(frames.is_empty());
        let (frames, junk) = splitter.push(b"K][881*5*HEA");
        assert_eq!(frames, vec!["881*2*LK".to_string()]);
        assert_eq!(junk, 0);
        let (frames, _) = splitter.push(b"RT]");
        assert_eq!(frames, vec!["881*5*HEART".to_string()]);
    }

    #[test]
    fn test_splitter_counts_interframe_junk() {
        let mut splitter = FrameSplitter::new(GpsProtocol::Tk103);
        let (frames, junk) = splitter.push(b"garbage(881,BP04)");
        assert_eq!(frames, vec!["881,BP04".to_string()]);
        assert_eq!(junk, 1);

        let (frames, junk) = splitter.push(b"noise without any frame");
        assert!(frames.is_empty());
        assert_eq!(junk, 1);
    }

    #[test]
    fn test_splitter_resets_on_oversized_frame() {
        let mut splitter = FrameSplitter::new(GpsProtocol::Watch);
        let mut blob = vec![b'['];
        blob.extend(std::iter::repeat_n(b'x', MAX_FRAME_BYTES + 10));
        let (frames, junk) = splitter.push(&blob);
        assert!(frames.is_empty());
        assert_eq!(junk, 1);

        // Splitter recovers for the next well-formed frame.
        let (frames, _) = splitter.push(b"[881*2*LK]");
        assert_eq!(frames, vec!["881*2*LK".to_string()]);
    }
}
