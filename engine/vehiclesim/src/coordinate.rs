//! Geographic coordinates and the navigation math used to move along a route.
//!
//! - Latitude: degrees north (-90 to 90)
//! - Longitude: degrees east (-180 to 180)
//! - Bearing: degrees true (0-360, 0=north, 90=east)
//! - Distance: kilometres on a spherical earth (haversine)

use std::f64::consts::PI;

use serde::Serialize;
use thiserror::Error;

/// Mean earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

const DEG_TO_RAD: f64 = PI / 180.0;
const RAD_TO_DEG: f64 = 180.0 / PI;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinateError {
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// Immutable WGS84 point. Construction validates the ranges, so every
/// `Coordinate` in the system is known to be on the globe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, CoordinateError> {
        // `contains` is false for NaN, so NaN is rejected here as well
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::LongitudeOutOfRange(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Sentinel position reported by a vehicle without any waypoints.
    pub const fn origin() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance to `other` in kilometres (haversine formula).
    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude * DEG_TO_RAD;
        let lat2 = other.latitude * DEG_TO_RAD;
        let dlat = (other.latitude - self.latitude) * DEG_TO_RAD;
        let dlon = (other.longitude - self.longitude) * DEG_TO_RAD;

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_KM * c
    }

    /// Initial great-circle bearing towards `other`, normalised to [0, 360).
    ///
    /// Identical points yield 0.
    pub fn bearing_to(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude * DEG_TO_RAD;
        let lat2 = other.latitude * DEG_TO_RAD;
        let dlon = (other.longitude - self.longitude) * DEG_TO_RAD;

        let y = dlon.sin() * lat2.cos();
        let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();

        let bearing = y.atan2(x) * RAD_TO_DEG;
        if bearing < 0.0 {
            bearing + 360.0
        } else {
            bearing
        }
    }

    /// Point at `fraction` of the way from `self` to `target`.
    ///
    /// Linear in degrees, which is accurate enough for the sub-kilometre
    /// steps of a single tick. `fraction` is clamped to [0, 1], so the result
    /// always stays inside the valid coordinate ranges.
    pub fn interpolate(&self, target: &Coordinate, fraction: f64) -> Coordinate {
        let f = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        Coordinate {
            latitude: self.latitude + (target.latitude - self.latitude) * f,
            longitude: self.longitude + (target.longitude - self.longitude) * f,
        }
    }
}

impl Default for Coordinate {
    fn default() -> Self {
        Self::origin()
    }
}
