//! Fare estimation
//!
//! Price = (base fare + per-km rate × distance + per-minute rate ×
//! duration) × category multiplier, rounded to currency precision.
//! Distance is great-circle; duration comes from an average urban speed.
//! Route-engine integration (polylines, live traffic) is out of scope,
//! so the estimate is deliberately simple and deterministic.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use corrida_types::{round_money, CoreError, GeoPoint, Result, RideCategory, RideQuote};

/// Fare parameters (BRL)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub base_fare: Decimal,
    pub per_km: Decimal,
    pub per_minute: Decimal,
    /// Average urban speed used to derive duration from distance
    pub average_speed_kmh: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_fare: Decimal::new(500, 2),
            per_km: Decimal::new(200, 2),
            per_minute: Decimal::new(50, 2),
            average_speed_kmh: 25.0,
        }
    }
}

impl PricingConfig {
    /// Produce the distance/duration/price preview for a trip.
    pub fn quote(
        &self,
        origin: &GeoPoint,
        destination: &GeoPoint,
        category: RideCategory,
    ) -> Result<RideQuote> {
        origin.validate("origin")?;
        destination.validate("destination")?;
        if origin == destination {
            return Err(CoreError::invalid_input(
                "destination",
                "origin and destination coordinates are identical",
            ));
        }

        let distance = origin.haversine_km(destination);
        let duration_min = ((distance / self.average_speed_kmh) * 60.0).ceil().max(1.0) as u32;

        let distance_km = Decimal::try_from(distance)
            .map_err(|e| CoreError::invalid_input("distance", e.to_string()))?
            .round_dp(2);
        let time_cost = self.per_minute * Decimal::from(duration_min);
        let base = self.base_fare + self.per_km * distance_km + time_cost;
        let estimated_price = round_money(base * category.multiplier());

        Ok(RideQuote {
            distance_km,
            duration_min,
            estimated_price,
        })
    }
}
