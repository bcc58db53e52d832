// Mapbox Vector Tile encoding for per-tile pilot layers.
//
// The wire format is protobuf (vector_tile.proto, MVT 2.1); the message
// structs below mirror the subset this service emits: one "pilots" layer of
// point features with id/name/elevation/timestamp attributes. Geometry is
// the MVT command stream: a single MoveTo per feature with zigzag-encoded
// deltas from the tile-local origin.

use prost::Message;

use crate::mercator::{TileCoord, position_in_tile};
use crate::track_points::PilotPosition;

pub const EXTENT: u32 = 4_096;
const LAYER_NAME: &str = "pilots";
const GEOM_TYPE_POINT: i32 = 1;

#[derive(Clone, PartialEq, Message)]
pub struct Tile {
    #[prost(message, repeated, tag = "3")]
    pub layers: Vec<Layer>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Layer {
    #[prost(uint32, tag = "15")]
    pub version: u32,
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub features: Vec<Feature>,
    #[prost(string, repeated, tag = "3")]
    pub keys: Vec<String>,
    #[prost(message, repeated, tag = "4")]
    pub values: Vec<Value>,
    #[prost(uint32, optional, tag = "5")]
    pub extent: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Feature {
    #[prost(uint64, optional, tag = "1")]
    pub id: Option<u64>,
    #[prost(uint32, repeated, tag = "2")]
    pub tags: Vec<u32>,
    #[prost(int32, optional, tag = "3")]
    pub r#type: Option<i32>,
    #[prost(uint32, repeated, tag = "4")]
    pub geometry: Vec<u32>,
}

/// MVT value variant; exactly one field is set per instance.
#[derive(Clone, PartialEq, Message)]
pub struct Value {
    #[prost(string, optional, tag = "1")]
    pub string_value: Option<String>,
    #[prost(double, optional, tag = "3")]
    pub double_value: Option<f64>,
    #[prost(int64, optional, tag = "4")]
    pub int_value: Option<i64>,
}

fn zigzag(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

fn string_value(s: &str) -> Value {
    Value {
        string_value: Some(s.to_string()),
        double_value: None,
        int_value: None,
    }
}

fn double_value(v: f64) -> Value {
    Value {
        string_value: None,
        double_value: Some(v),
        int_value: None,
    }
}

fn int_value(v: i64) -> Value {
    Value {
        string_value: None,
        double_value: None,
        int_value: Some(v),
    }
}

/// Encode the pilots inside one tile as an MVT point layer. Positions
/// outside the tile are skipped; an empty layer is still a valid tile.
pub fn encode_pilot_tile(tile: TileCoord, pilots: &[PilotPosition]) -> Vec<u8> {
    let keys = vec![
        "pilot_id".to_string(),
        "pilot_name".to_string(),
        "elevation".to_string(),
        "timestamp".to_string(),
    ];
    let mut values: Vec<Value> = Vec::new();
    let mut features: Vec<Feature> = Vec::new();

    for (index, pilot) in pilots.iter().enumerate() {
        let Some((px, py)) = position_in_tile(tile, pilot.lat, pilot.lon, EXTENT) else {
            continue;
        };

        let mut tags = Vec::with_capacity(8);
        for (key_index, value) in [
            (0u32, string_value(&pilot.pilot_id)),
            (1, string_value(&pilot.pilot_name)),
            (2, double_value(pilot.elevation.unwrap_or(0.0))),
            (3, int_value(pilot.datetime.timestamp())),
        ] {
            tags.push(key_index);
            tags.push(values.len() as u32);
            values.push(value);
        }

        features.push(Feature {
            id: Some(index as u64 + 1),
            tags,
            r#type: Some(GEOM_TYPE_POINT),
            // MoveTo (id 1), count 1, then one zigzag (dx, dy) pair.
            geometry: vec![(1 << 3) | 1, zigzag(px), zigzag(py)],
        });
    }

    let tile = Tile {
        layers: vec![Layer {
            version: 2,
            name: LAYER_NAME.to_string(),
            features,
            keys,
            values,
            extent: Some(EXTENT),
        }],
    };

    tile.encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mercator::tile_at;
    use chrono::Utc;

    fn pilot(id: &str, lat: f64, lon: f64) -> PilotPosition {
        PilotPosition {
            pilot_id: id.to_string(),
            pilot_name: format!("Pilot {}", id),
            lat,
            lon,
            elevation: Some(1850.0),
            datetime: Utc::now(),
        }
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(zigzag(2048), 4096);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let tile_coord = tile_at(46.5, 8.2, 10);
        let pilots = vec![pilot("p1", 46.5, 8.2), pilot("p2", 46.51, 8.21)];

        let bytes = encode_pilot_tile(tile_coord, &pilots);
        let decoded = Tile::decode(bytes.as_slice()).unwrap();

        assert_eq!(decoded.layers.len(), 1);
        let layer = &decoded.layers[0];
        assert_eq!(layer.version, 2);
        assert_eq!(layer.name, "pilots");
        assert_eq!(layer.extent, Some(EXTENT));
        assert_eq!(layer.features.len(), 2);
        assert_eq!(layer.keys.len(), 4);
        // Four values per feature.
        assert_eq!(layer.values.len(), 8);

        let feature = &layer.features[0];
        assert_eq!(feature.r#type, Some(GEOM_TYPE_POINT));
        assert_eq!(feature.geometry[0], 9); // MoveTo, count 1
        assert_eq!(feature.geometry.len(), 3);

        // First tag pair points at pilot_id.
        assert_eq!(layer.keys[feature.tags[0] as usize], "pilot_id");
        assert_eq!(
            layer.values[feature.tags[1] as usize].string_value.as_deref(),
            Some("p1")
        );
    }

    #[test]
    fn test_pilots_outside_tile_are_skipped() {
        let tile_coord = tile_at(46.5, 8.2, 12);
        let pilots = vec![pilot("inside", 46.5, 8.2), pilot("faraway", 47.9, 9.9)];

        let bytes = encode_pilot_tile(tile_coord, &pilots);
        let decoded = Tile::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.layers[0].features.len(), 1);
    }

    #[test]
    fn test_empty_tile_still_decodes() {
        let tile_coord = tile_at(46.5, 8.2, 12);
        let bytes = encode_pilot_tile(tile_coord, &[]);
        let decoded = Tile::decode(bytes.as_slice()).unwrap();
        assert!(decoded.layers[0].features.is_empty());
    }
}
