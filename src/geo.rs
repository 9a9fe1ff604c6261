//! Distance math and grid-cell addressing.
//!
//! Pure functions, no state. Great-circle distance uses the Haversine
//! formula with a spherical Earth of radius 6371 km, which is accurate to
//! well under 1% at the scales this engine cares about.
//!
//! The real-time layer shards connected clients into coarse grid-cell
//! "rooms" at 0.1 degree resolution (about 11 km at the equator). Cells
//! are uniform in degrees regardless of latitude: near the poles this
//! over-counts rooms and at the equator the cell edge slightly
//! under-covers. That is a known, accepted approximation - room keys are
//! part of the client contract, so the threshold is deliberately not
//! latitude-corrected here.

use crate::model::Location;

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Grid cell edge in degrees.
const GRID_SIZE_DEG: f64 = 0.1;

/// Approximate kilometers per degree of latitude.
const KM_PER_DEGREE: f64 = 111.0;

/// Great-circle distance between two locations in kilometers.
///
/// Callers must validate coordinates at the boundary; non-finite input
/// propagates NaN rather than panicking.
pub fn distance_km(a: &Location, b: &Location) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Grid-cell room key for a location: `loc:{floor(lat/0.1)}:{floor(lon/0.1)}`.
pub fn location_room(loc: &Location) -> String {
    let grid_lat = (loc.latitude / GRID_SIZE_DEG).floor() as i64;
    let grid_lon = (loc.longitude / GRID_SIZE_DEG).floor() as i64;
    format!("loc:{grid_lat}:{grid_lon}")
}

/// Room key for a user's direct channel.
pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Room key for subscribers of a single disaster.
pub fn disaster_room(disaster_id: &str) -> String {
    format!("disaster:{disaster_id}")
}

/// Enumerate all grid-cell rooms whose cell could intersect a circle.
///
/// Iterates the bounding box of grid indices covering `radius_km` around
/// `center`, so targeted fan-out never scans the whole user base. The box
/// over-approximates the circle; that only costs a few empty rooms, never
/// a missed one. The room containing the center itself is always included.
pub fn affected_rooms(center: &Location, radius_km: f64) -> Vec<String> {
    let lat_range = radius_km / KM_PER_DEGREE;
    // Longitude degrees shrink with latitude. Bounded to a full band so a
    // near-polar center cannot degenerate into an unbounded index range.
    let lon_range =
        (radius_km / (KM_PER_DEGREE * center.latitude.to_radians().cos().abs())).min(180.0);

    let min_lat = ((center.latitude - lat_range) / GRID_SIZE_DEG).floor() as i64;
    let max_lat = ((center.latitude + lat_range) / GRID_SIZE_DEG).ceil() as i64;
    let min_lon = ((center.longitude - lon_range) / GRID_SIZE_DEG).floor() as i64;
    let max_lon = ((center.longitude + lon_range) / GRID_SIZE_DEG).ceil() as i64;

    let mut rooms = Vec::new();
    for lat in min_lat..=max_lat {
        for lon in min_lon..=max_lon {
            rooms.push(format!("loc:{lat}:{lon}"));
        }
    }
    rooms
}
