//! Great-circle helpers on top of `geo`.
//!
//! Distances are metres, bearings are compass degrees in [0, 360).

use geo::{HaversineBearing, HaversineDistance, Point};

pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    Point::new(lon1, lat1).haversine_distance(&Point::new(lon2, lat2))
}

/// Initial bearing from the first point towards the second
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    normalize_bearing(Point::new(lon1, lat1).haversine_bearing(Point::new(lon2, lat2)))
}

pub fn normalize_bearing(deg: f64) -> f64 {
    let wrapped = deg % 360.0;
    if wrapped < 0.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}

/// Distance to a target projected onto the direction of travel.
///
/// Positive while the target is ahead, zero abeam, negative once behind.
pub fn along_track_distance(distance: f64, bearing_to_target: f64, heading: f64) -> f64 {
    let diff = (bearing_to_target - heading).to_radians();
    distance * diff.cos()
}
