//! Great-circle distance and station geofences.

use crate::error::SettlementError;
use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Geofence radius given to stations that do not configure one.
pub const DEFAULT_GEOFENCE_RADIUS_M: f64 = 100.0;

/// Validated WGS-84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    lat: f64,
    lng: f64,
}

impl GeoPoint {
    /// Rejects non-finite values and out-of-range degrees.
    pub fn new(lat: f64, lng: f64) -> Result<Self, SettlementError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(SettlementError::InvalidLocation(format!(
                "coordinates must be finite, got ({lat}, {lng})"
            )));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(SettlementError::InvalidLocation(format!(
                "latitude {lat} outside [-90, 90]"
            )));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(SettlementError::InvalidLocation(format!(
                "longitude {lng} outside [-180, 180]"
            )));
        }
        Ok(Self { lat, lng })
    }

    /// Latitude in degrees.
    pub fn lat(&self) -> f64 {
        self.lat
    }

    /// Longitude in degrees.
    pub fn lng(&self) -> f64 {
        self.lng
    }

    /// Haversine distance to `other`, in metres.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        haversine_distance_m(self, other)
    }
}

/// Great-circle distance between two points on a sphere of radius [`EARTH_RADIUS_M`].
pub fn haversine_distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lng - a.lng).to_radians();
    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push h a hair past 1 for antipodal points.
    let c = 2.0 * h.sqrt().min(1.0).atan2((1.0 - h).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

/// Circle around a station inside which redemption is plausible.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    /// Centre.
    pub center: GeoPoint,
    /// Radius in metres.
    pub radius_m: f64,
}

impl Geofence {
    /// Geofence with a positive radius.
    pub fn new(center: GeoPoint, radius_m: f64) -> Result<Self, SettlementError> {
        if !radius_m.is_finite() || radius_m <= 0.0 {
            return Err(SettlementError::InvalidLocation(format!(
                "geofence radius must be positive, got {radius_m}"
            )));
        }
        Ok(Self { center, radius_m })
    }

    /// Distance from the centre when `point` is inside (boundary included).
    pub fn check(&self, point: &GeoPoint) -> Result<f64, SettlementError> {
        let distance_m = self.center.distance_m(point);
        if distance_m <= self.radius_m {
            Ok(distance_m)
        } else {
            Err(SettlementError::OutOfGeofence {
                distance_m,
                radius_m: self.radius_m,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::f64::consts::PI;

    fn point(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint::new(lat, lng).unwrap()
    }

    #[test]
    fn identical_points_are_zero_apart() {
        let nairobi = point(-1.2921, 36.8219);
        assert_eq!(haversine_distance_m(&nairobi, &nairobi), 0.0);
    }

    #[test]
    fn antipodal_points_are_half_a_circumference_apart() {
        let d = haversine_distance_m(&point(10.0, 20.0), &point(-10.0, -160.0));
        assert!((d - PI * EARTH_RADIUS_M).abs() < 1.0, "got {d}");
    }

    #[test]
    fn geofence_admits_nearby_and_rejects_distant_drivers() {
        let station = point(-1.2921, 36.8219);
        let fence = Geofence::new(station, DEFAULT_GEOFENCE_RADIUS_M).unwrap();
        // Roughly 1 km north.
        let far = point(-1.2921 + 0.009, 36.8219);
        let err = fence.check(&far).unwrap_err();
        assert_eq!(err.code(), "OUT_OF_GEOFENCE");
        let near = point(-1.2921 + 0.0005, 36.8219);
        assert!(fence.check(&near).unwrap() < 100.0);
    }

    #[test]
    fn malformed_coordinates_are_validation_errors() {
        for (lat, lng) in [(91.0, 0.0), (0.0, -180.5), (f64::NAN, 0.0), (0.0, f64::INFINITY)] {
            assert_eq!(GeoPoint::new(lat, lng).unwrap_err().code(), "INVALID_LOCATION");
        }
        assert!(Geofence::new(point(0.0, 0.0), 0.0).is_err());
    }

    proptest! {
        #[test]
        fn distance_is_symmetric_and_bounded(
            lat1 in -90.0f64..=90.0, lng1 in -180.0f64..=180.0,
            lat2 in -90.0f64..=90.0, lng2 in -180.0f64..=180.0,
        ) {
            let a = point(lat1, lng1);
            let b = point(lat2, lng2);
            let ab = haversine_distance_m(&a, &b);
            let ba = haversine_distance_m(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-3);
            prop_assert!(ab >= 0.0);
            prop_assert!(ab <= PI * EARTH_RADIUS_M + 1e-6);
            prop_assert_eq!(haversine_distance_m(&a, &a), 0.0);
        }
    }
}
