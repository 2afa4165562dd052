//! Geographic primitives
//!
//! Points are WGS84 latitude/longitude pairs. Distance is great-circle
//! (haversine), which is accurate enough at city scale for ranking and
//! fare estimation.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius in kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Validate coordinate ranges
    pub fn validate(&self, field: &str) -> Result<()> {
        if !self.latitude.is_finite() || self.latitude.abs() > 90.0 {
            return Err(CoreError::invalid_input(
                field,
                format!("latitude {} out of range", self.latitude),
            ));
        }
        if !self.longitude.is_finite() || self.longitude.abs() > 180.0 {
            return Err(CoreError::invalid_input(
                field,
                format!("longitude {} out of range", self.longitude),
            ));
        }
        Ok(())
    }

    /// Great-circle distance to another point, in kilometers
    pub fn haversine_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lon1) = (self.latitude.to_radians(), self.longitude.to_radians());
        let (lat2, lon2) = (other.latitude.to_radians(), other.longitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let sin_dlat = (dlat * 0.5).sin();
        let sin_dlon = (dlon * 0.5).sin();
        let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
        let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
        EARTH_RADIUS_KM * c
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// A named place: street address plus coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub address: String,
    #[serde(flatten)]
    pub point: GeoPoint,
}

impl Location {
    pub fn new(address: impl Into<String>, point: GeoPoint) -> Self {
        Self {
            address: address.into(),
            point,
        }
    }
}
