//! Web-Mercator projection and slippy-map tile arithmetic.
//!
//! The fan-out hub pre-computes EPSG:3857 coordinates server-side so map
//! clients can position markers without projecting themselves, and resolves
//! which `(z, x, y)` tile a pilot falls in to scope viewport subscriptions.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Web-Mercator is undefined at the poles; clamp like every map client does.
const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

pub fn mercator_x(lon: f64) -> f64 {
    EARTH_RADIUS_M * lon.to_radians()
}

pub fn mercator_y(lat: f64) -> f64 {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    EARTH_RADIUS_M * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln()
}

/// A slippy-map tile coordinate; the unit of viewport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn from_zxy(raw: [u32; 3]) -> Option<Self> {
        let z = u8::try_from(raw[0]).ok()?;
        if z > 22 {
            return None;
        }
        let n = 1u32 << z;
        if raw[1] >= n || raw[2] >= n {
            return None;
        }
        Some(Self {
            z,
            x: raw[1],
            y: raw[2],
        })
    }

    pub fn to_zxy(self) -> [u32; 3] {
        [self.z as u32, self.x, self.y]
    }
}

/// The tile containing a position at a zoom level.
pub fn tile_at(lat: f64, lon: f64, z: u8) -> TileCoord {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let n = (1u32 << z) as f64;

    let x = ((lon + 180.0) / 360.0 * n).floor();
    let lat_rad = lat.to_radians();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0
        * n)
        .floor();

    TileCoord {
        z,
        x: (x as i64).clamp(0, (1i64 << z) - 1) as u32,
        y: (y as i64).clamp(0, (1i64 << z) - 1) as u32,
    }
}

/// Position of a point inside a tile, scaled to the MVT extent.
/// Returns None when the point lies outside the tile.
pub fn position_in_tile(tile: TileCoord, lat: f64, lon: f64, extent: u32) -> Option<(i32, i32)> {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let n = (1u32 << tile.z) as f64;

    let fx = (lon + 180.0) / 360.0 * n;
    let lat_rad = lat.to_radians();
    let fy =
        (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n;

    let dx = fx - tile.x as f64;
    let dy = fy - tile.y as f64;
    if !(0.0..1.0).contains(&dx) || !(0.0..1.0).contains(&dy) {
        return None;
    }
    Some(((dx * extent as f64) as i32, (dy * extent as f64) as i32))
}

/// Tiles at one zoom level covering a (min_lon, min_lat, max_lon, max_lat)
/// bounding box, capped so a client cannot ask for the world at z18.
pub fn tiles_covering_bbox(bbox: [f64; 4], z: u8, cap: usize) -> Vec<TileCoord> {
    let [min_lon, min_lat, max_lon, max_lat] = bbox;
    let top_left = tile_at(max_lat, min_lon, z);
    let bottom_right = tile_at(min_lat, max_lon, z);

    let mut tiles = Vec::new();
    for x in top_left.x..=bottom_right.x {
        for y in top_left.y..=bottom_right.y {
            if tiles.len() >= cap {
                return tiles;
            }
            tiles.push(TileCoord { z, x, y });
        }
    }
    tiles
}
