// Fan-out payload pipeline: viewport scoping, delta compression envelope,
// and vector-tile encoding, exercised together the way one tick uses them.

use chrono::{TimeZone, Utc};
use prost::Message;
use std::collections::HashSet;

use skylive::live_hub::{DeltaPayload, gzip_base64, visible_updates};
use skylive::mercator::{TileCoord, mercator_x, mercator_y, tile_at, tiles_covering_bbox};
use skylive::track_points::PilotPosition;
use skylive::vector_tile::{EXTENT, Tile, encode_pilot_tile};

fn pilot(id: &str, lat: f64, lon: f64) -> PilotPosition {
    PilotPosition {
        pilot_id: id.to_string(),
        pilot_name: format!("Pilot {}", id),
        lat,
        lon,
        elevation: Some(1800.0),
        datetime: Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap(),
    }
}

fn gunzip(data: &str) -> Vec<u8> {
    use base64::Engine;
    use std::io::Read;
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(data)
        .unwrap();
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn tick_delivers_exactly_the_subscribed_pilots_plus_self() {
    // Field spread across the Alps; viewer looking at one z10 tile near
    // Interlaken, authenticated as the pilot currently over France.
    let positions = vec![
        pilot("interlaken", 46.68, 7.86),
        pilot("lauterbrunnen", 46.59, 7.90),
        pilot("annecy", 45.90, 6.12),
        pilot("self", 45.0, 5.0),
    ];

    let view_tile = tile_at(46.68, 7.86, 10);
    let mut tiles = HashSet::new();
    tiles.insert(view_tile);

    let visible = visible_updates(&positions, &tiles, Some("self"));
    let ids: HashSet<&str> = visible.iter().map(|p| p.pilot_id.as_str()).collect();

    // Pilots in the subscribed tile are in; Annecy is out; self is always in.
    assert!(ids.contains("interlaken"));
    assert!(ids.contains("self"));
    assert!(!ids.contains("annecy"));

    // Whether Lauterbrunnen shows depends only on tile geometry.
    assert_eq!(ids.contains("lauterbrunnen"), tile_at(46.59, 7.90, 10) == view_tile);
}

#[test]
fn delta_envelope_round_trips_through_gzip_base64() {
    let positions = vec![pilot("p1", 46.68, 7.86), pilot("p2", 46.59, 7.90)];
    let tick_ts = Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 10).unwrap();

    let payload = DeltaPayload {
        kind: "delta".to_string(),
        timestamp: tick_ts,
        updates: positions
            .iter()
            .map(|p| skylive::live_hub::DeltaEntry {
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
    };

    let encoded = gzip_base64(&serde_json::to_vec(&payload).unwrap()).unwrap();
    let decoded: DeltaPayload = serde_json::from_slice(&gunzip(&encoded)).unwrap();

    assert_eq!(decoded.kind, "delta");
    // Every entry shares the tick boundary timestamp at the envelope level
    // while keeping its own fix timestamp.
    assert_eq!(decoded.timestamp, tick_ts);
    assert_eq!(decoded.updates.len(), 2);
    for (entry, original) in decoded.updates.iter().zip(&positions) {
        assert_eq!(entry.pilot_id, original.pilot_id);
        assert!((entry.x_mercator - mercator_x(original.lon)).abs() < 1e-6);
        assert!((entry.y_mercator - mercator_y(original.lat)).abs() < 1e-6);
    }
}

#[test]
fn bbox_prime_produces_decodable_tiles_with_only_local_pilots() {
    let positions = vec![
        pilot("local", 46.68, 7.86),
        pilot("remote", 43.0, 1.0),
    ];

    // A viewport around the Jungfrau region at z11.
    let tiles = tiles_covering_bbox([7.7, 46.5, 8.1, 46.8], 11, 16);
    assert!(!tiles.is_empty());

    let mut seen_local = false;
    for tile in &tiles {
        let bytes = encode_pilot_tile(*tile, &positions);
        let decoded = Tile::decode(bytes.as_slice()).unwrap();
        let layer = &decoded.layers[0];
        assert_eq!(layer.extent, Some(EXTENT));

        for feature in &layer.features {
            // Geometry stays inside the tile extent.
            assert_eq!(feature.geometry.len(), 3);
            let x = zigzag_decode(feature.geometry[1]);
            let y = zigzag_decode(feature.geometry[2]);
            assert!((0..EXTENT as i64).contains(&x));
            assert!((0..EXTENT as i64).contains(&y));

            let id_value_index = feature.tags[1] as usize;
            let pilot_id = layer.values[id_value_index].string_value.as_deref().unwrap();
            assert_ne!(pilot_id, "remote", "remote pilot leaked into local tile");
            if pilot_id == "local" {
                seen_local = true;
            }
        }
    }
    assert!(seen_local, "local pilot missing from every covering tile");
}

fn zigzag_decode(v: u32) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

#[test]
fn zero_subscription_means_zero_delta_entries() {
    let positions = vec![pilot("p1", 46.68, 7.86)];
    let tiles: HashSet<TileCoord> = HashSet::new();
    assert!(visible_updates(&positions, &tiles, None).is_empty());
}
