//! The ride record and its lifecycle vocabulary
//!
//! A ride is created when a passenger requests a trip and is mutated only
//! through the registry's conditional transitions. Rides are never
//! deleted; Completed and Cancelled are terminal.

use crate::{DriverId, Location, PassengerId, RideId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ride lifecycle status
///
/// Legal order: Requested → Accepted → DriverArriving → InProgress →
/// Completed, with Cancelled reachable from any state before InProgress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Requested,
    Accepted,
    DriverArriving,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "REQUESTED",
            Self::Accepted => "ACCEPTED",
            Self::DriverArriving => "DRIVER_ARRIVING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Why a ride ended in Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    PassengerRequest,
    NoDriversAvailable,
}

/// Service category requested by the passenger and served by a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideCategory {
    Standard,
    Comfort,
    Premium,
    Xl,
}

impl RideCategory {
    /// Fare multiplier applied on top of the standard estimate
    pub fn multiplier(&self) -> Decimal {
        match self {
            Self::Standard => Decimal::new(100, 2),
            Self::Comfort => Decimal::new(125, 2),
            Self::Premium => Decimal::new(160, 2),
            Self::Xl => Decimal::new(140, 2),
        }
    }
}

impl fmt::Display for RideCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Comfort => "comfort",
            Self::Premium => "premium",
            Self::Xl => "xl",
        };
        write!(f, "{s}")
    }
}

/// Distance/duration/price preview produced at estimation time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RideQuote {
    pub distance_km: Decimal,
    pub duration_min: u32,
    pub estimated_price: Decimal,
}

/// One passenger trip request and its lifecycle record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub passenger_id: PassengerId,
    /// Set by the binding conditional update; Some iff status is
    /// Accepted, DriverArriving, InProgress or Completed.
    pub driver_id: Option<DriverId>,
    pub origin: Location,
    pub destination: Location,
    pub category: RideCategory,
    pub distance_km: Decimal,
    pub duration_min: u32,
    pub estimated_price: Decimal,
    pub final_price: Option<Decimal>,
    pub status: RideStatus,
    pub cancel_reason: Option<CancelReason>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arriving_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Ride {
    /// The driver-binding invariant: driver id is present exactly in the
    /// bound statuses.
    pub fn driver_invariant_holds(&self) -> bool {
        match self.status {
            RideStatus::Requested => self.driver_id.is_none(),
            RideStatus::Accepted
            | RideStatus::DriverArriving
            | RideStatus::InProgress
            | RideStatus::Completed => self.driver_id.is_some(),
            // Cancelled rides keep whatever driver they had at cancel time,
            // except auto-cancel which never bound one.
            RideStatus::Cancelled => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&RideStatus::DriverArriving).unwrap();
        assert_eq!(json, "\"DRIVER_ARRIVING\"");
        let back: RideStatus = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(back, RideStatus::InProgress);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RideStatus::Completed.is_terminal());
        assert!(RideStatus::Cancelled.is_terminal());
        assert!(!RideStatus::Requested.is_terminal());
    }

    #[test]
    fn test_category_multipliers() {
        assert_eq!(RideCategory::Standard.multiplier(), dec!(1.00));
        assert_eq!(RideCategory::Premium.multiplier(), dec!(1.60));
    }
}
