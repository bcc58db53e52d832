// End-to-end exercises of the flight separation decision procedure: day
// rollover in the race timezone, inactivity gaps, and the full
// landing-and-relaunch sequence.

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use skylive::flight_tracker::{
    IncomingPoint, LandingConfig, OpenFlightState, Separation, advance_landing_state, decide,
};
use skylive::flights::FlightState;

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn point(lat: f64, lon: f64, elevation: f64, ts: DateTime<Utc>) -> IncomingPoint {
    IncomingPoint {
        lat,
        lon,
        elevation: Some(elevation),
        timestamp: ts,
    }
}

/// Drive a device's stream through the decision procedure, tracking which
/// flight every point lands on. Returns the ordered list of flight suffixes
/// that were opened.
struct DeviceStream {
    open: Option<OpenFlightState>,
    tz: chrono_tz::Tz,
    cfg: LandingConfig,
    opened: Vec<String>,
}

impl DeviceStream {
    fn new(tz: chrono_tz::Tz) -> Self {
        Self {
            open: None,
            tz,
            cfg: LandingConfig::default(),
            opened: Vec::new(),
        }
    }

    fn feed(&mut self, p: IncomingPoint) -> String {
        let decision = decide(self.open.as_ref(), &p, self.tz, &self.cfg);
        match decision {
            Separation::NewFlight { suffix } => {
                self.opened.push(suffix.clone());
                self.open = Some(OpenFlightState {
                    flight_uuid: Uuid::new_v4(),
                    flight_id: format!("tk905b_live-p1-race-dev-{}", suffix),
                    last_lat: p.lat,
                    last_lon: p.lon,
                    last_timestamp: p.timestamp,
                    state: FlightState::default(),
                });
                suffix
            }
            Separation::Attach => {
                let prev = self.open.as_mut().unwrap();
                let new_state = advance_landing_state(prev, &p, &self.cfg);
                prev.state = new_state;
                prev.last_lat = p.lat;
                prev.last_lon = p.lon;
                prev.last_timestamp = p.timestamp;
                self.opened.last().unwrap().clone()
            }
            Separation::AttachOutOfOrder => self.opened.last().unwrap().clone(),
        }
    }
}

#[test]
fn day_rollover_splits_on_local_date_not_utc() {
    // Race timezone Europe/Rome: 23:59 UTC on Jan 1 is local 00:59 on Jan 2,
    // and 00:01 UTC on Jan 2 is local 01:01, the same local day despite the
    // UTC rollover. Then a point at 23:30 UTC Jan 2 (local 00:30 Jan 3)
    // splits.
    let mut stream = DeviceStream::new(chrono_tz::Europe::Rome);

    let first = stream.feed(point(46.0, 11.0, 1200.0, utc(2025, 1, 1, 23, 59, 0)));
    assert_eq!(first, "20250102");

    let second = stream.feed(point(46.001, 11.0, 1210.0, utc(2025, 1, 2, 0, 1, 0)));
    assert_eq!(second, "20250102", "same local day must not split");

    let third = stream.feed(point(46.002, 11.0, 1220.0, utc(2025, 1, 2, 23, 30, 0)));
    assert_eq!(third, "20250103");
    assert_eq!(stream.opened, vec!["20250102", "20250103"]);
}

#[test]
fn inactivity_gap_splits_at_three_hours() {
    // Points at T, T+2h, T+5h: the first two share a flight, the third
    // opens a new one with an HHMM suffix of its own (local) time.
    let mut stream = DeviceStream::new(chrono_tz::Tz::UTC);
    let t = utc(2025, 6, 3, 8, 0, 0);

    let a = stream.feed(point(46.0, 11.0, 1500.0, t));
    let b = stream.feed(point(46.1, 11.1, 1800.0, t + Duration::hours(2)));
    let c = stream.feed(point(46.2, 11.2, 1600.0, t + Duration::hours(5)));

    assert_eq!(a, b, "a two-hour pause stays on the same flight");
    assert_eq!(c, "1300");
    assert_eq!(stream.opened.len(), 2);
}

#[test]
fn landing_then_relaunch_opens_l_suffixed_flight() {
    let mut stream = DeviceStream::new(chrono_tz::Tz::UTC);
    let t = utc(2025, 6, 3, 13, 40, 0);

    // Airborne leg: moving fast, descending.
    for i in 0..5 {
        stream.feed(point(
            46.0 + 0.01 * i as f64,
            11.0,
            2000.0 - 200.0 * i as f64,
            t + Duration::minutes(i),
        ));
    }

    // On the ground at 13:45: stationary, flat elevation, for 12 minutes.
    let touchdown = t + Duration::minutes(5);
    for i in 0..13 {
        stream.feed(point(46.04, 11.0, 560.0, touchdown + Duration::minutes(i)));
    }
    let landed_at = stream.open.as_ref().unwrap().state.landed_at;
    assert!(landed_at.is_some(), "ten quiet minutes must mark a landing");

    // Relaunch: the next airborne point opens a flight stamped with the
    // landing instant, not the relaunch time.
    let relaunch = stream.feed(point(
        46.06,
        11.0,
        600.0,
        touchdown + Duration::minutes(14),
    ));
    assert!(
        relaunch.starts_with('L'),
        "expected an L-suffix flight, got {}",
        relaunch
    );
    assert_eq!(relaunch, format!("L{}", landed_at.unwrap().format("%H%M")));
    assert_eq!(stream.opened.len(), 2);
}

#[test]
fn slow_ground_taxi_without_altitude_change_still_waits_full_window() {
    // Nine minutes on the ground is not a landing yet.
    let mut stream = DeviceStream::new(chrono_tz::Tz::UTC);
    let t = utc(2025, 6, 3, 13, 0, 0);

    stream.feed(point(46.0, 11.0, 800.0, t));
    for i in 1..=9 {
        stream.feed(point(46.0, 11.0, 800.0, t + Duration::minutes(i)));
    }
    assert!(stream.open.as_ref().unwrap().state.landed_at.is_none());
}

#[test]
fn out_of_order_points_do_not_move_the_gap_clock() {
    let mut stream = DeviceStream::new(chrono_tz::Tz::UTC);
    let t = utc(2025, 6, 3, 9, 0, 0);

    stream.feed(point(46.0, 11.0, 1500.0, t));
    stream.feed(point(46.01, 11.0, 1520.0, t + Duration::minutes(10)));

    // A stale point from before the last fix attaches without rewinding.
    stream.feed(point(46.005, 11.0, 1510.0, t + Duration::minutes(5)));
    assert_eq!(
        stream.open.as_ref().unwrap().last_timestamp,
        t + Duration::minutes(10)
    );

    // Two hours and fifty-nine minutes after the *newest* point: attach.
    let next = stream.feed(point(
        46.02,
        11.0,
        1550.0,
        t + Duration::minutes(10) + Duration::minutes(179),
    ));
    assert_eq!(next, stream.opened[0]);
    assert_eq!(stream.opened.len(), 1);
}

#[test]
fn sorted_batch_yields_monotonic_assignments() {
    // Walking a sorted day of points must never assign a later point to an
    // earlier flight.
    let mut stream = DeviceStream::new(chrono_tz::Europe::Rome);
    let t = utc(2025, 6, 3, 6, 0, 0);
    let mut assigned = Vec::new();

    for i in 0..30 {
        // Two big pauses inside the day.
        let offset = Duration::minutes(i * 5)
            + if i >= 10 { Duration::hours(3) } else { Duration::zero() }
            + if i >= 20 { Duration::hours(4) } else { Duration::zero() };
        assigned.push(stream.feed(point(46.0, 11.0 + 0.01 * i as f64, 1500.0, t + offset)));
    }

    assert_eq!(stream.opened.len(), 3);
    // Assignment sequence is a non-interleaved run per flight.
    let mut seen = Vec::new();
    for suffix in &assigned {
        if seen.last() != Some(suffix) {
            seen.push(suffix.clone());
        }
    }
    assert_eq!(seen, stream.opened);
}
