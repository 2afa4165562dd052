//! Realtime event envelopes
//!
//! Every committed ride transition, dispatch offer, and location forward
//! is expressed as a `RideEvent`. The serialized form is the JSON
//! envelope delivered over the socket: `{"type": "...", ...payload}`,
//! with `type` values matching the router's event kinds 1:1.

use crate::{CancelReason, DriverId, PassengerId, RideCategory, RideId, Role, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event kinds routed by the realtime layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RideOffer,
    RideOfferRevoked,
    RideAccepted,
    DriverArriving,
    RideStarted,
    RideCompleted,
    RideCancelled,
    RideReopened,
    DriverLocation,
    ConnectionAck,
}

impl EventKind {
    /// All kinds, in a stable order (used to register catch-all observers)
    pub const ALL: [EventKind; 10] = [
        EventKind::RideOffer,
        EventKind::RideOfferRevoked,
        EventKind::RideAccepted,
        EventKind::DriverArriving,
        EventKind::RideStarted,
        EventKind::RideCompleted,
        EventKind::RideCancelled,
        EventKind::RideReopened,
        EventKind::DriverLocation,
        EventKind::ConnectionAck,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RideOffer => "ride_offer",
            Self::RideOfferRevoked => "ride_offer_revoked",
            Self::RideAccepted => "ride_accepted",
            Self::DriverArriving => "driver_arriving",
            Self::RideStarted => "ride_started",
            Self::RideCompleted => "ride_completed",
            Self::RideCancelled => "ride_cancelled",
            Self::RideReopened => "ride_reopened",
            Self::DriverLocation => "driver_location",
            Self::ConnectionAck => "connection_ack",
        };
        write!(f, "{s}")
    }
}

/// A routed realtime event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RideEvent {
    /// A dispatch offer for one candidate driver
    RideOffer {
        ride_id: RideId,
        driver_id: DriverId,
        origin_address: String,
        destination_address: String,
        category: RideCategory,
        estimated_price: Decimal,
        distance_km: Decimal,
        expires_at: DateTime<Utc>,
    },
    /// The offer is no longer available (won elsewhere, expired, cancelled)
    RideOfferRevoked {
        ride_id: RideId,
        driver_id: DriverId,
    },
    /// A driver was bound to the ride
    RideAccepted {
        ride_id: RideId,
        passenger_id: PassengerId,
        driver_id: DriverId,
    },
    /// The bound driver is on the way to pickup
    DriverArriving {
        ride_id: RideId,
        passenger_id: PassengerId,
        driver_id: DriverId,
    },
    /// The trip started
    RideStarted {
        ride_id: RideId,
        passenger_id: PassengerId,
        driver_id: DriverId,
    },
    /// The trip completed
    RideCompleted {
        ride_id: RideId,
        passenger_id: PassengerId,
        driver_id: DriverId,
        final_price: Decimal,
    },
    /// The ride reached the Cancelled terminal state
    RideCancelled {
        ride_id: RideId,
        passenger_id: PassengerId,
        driver_id: Option<DriverId>,
        reason: CancelReason,
    },
    /// A bound driver released the ride; it is back in dispatch
    RideReopened {
        ride_id: RideId,
        passenger_id: PassengerId,
    },
    /// Location ping forwarded to the passenger of an active ride
    DriverLocation {
        ride_id: RideId,
        passenger_id: PassengerId,
        driver_id: DriverId,
        latitude: f64,
        longitude: f64,
        heading: Option<f64>,
    },
    /// Sent once on subscription
    ConnectionAck { user_id: UserId, role: Role },
}

impl RideEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RideOffer { .. } => EventKind::RideOffer,
            Self::RideOfferRevoked { .. } => EventKind::RideOfferRevoked,
            Self::RideAccepted { .. } => EventKind::RideAccepted,
            Self::DriverArriving { .. } => EventKind::DriverArriving,
            Self::RideStarted { .. } => EventKind::RideStarted,
            Self::RideCompleted { .. } => EventKind::RideCompleted,
            Self::RideCancelled { .. } => EventKind::RideCancelled,
            Self::RideReopened { .. } => EventKind::RideReopened,
            Self::DriverLocation { .. } => EventKind::DriverLocation,
            Self::ConnectionAck { .. } => EventKind::ConnectionAck,
        }
    }

    /// The ride this event concerns, if any
    pub fn ride_id(&self) -> Option<RideId> {
        match self {
            Self::RideOffer { ride_id, .. }
            | Self::RideOfferRevoked { ride_id, .. }
            | Self::RideAccepted { ride_id, .. }
            | Self::DriverArriving { ride_id, .. }
            | Self::RideStarted { ride_id, .. }
            | Self::RideCompleted { ride_id, .. }
            | Self::RideCancelled { ride_id, .. }
            | Self::RideReopened { ride_id, .. }
            | Self::DriverLocation { ride_id, .. } => Some(*ride_id),
            Self::ConnectionAck { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_envelope_tag() {
        let event = RideEvent::RideCompleted {
            ride_id: RideId::new(),
            passenger_id: PassengerId::new(),
            driver_id: DriverId::new(),
            final_price: dec!(25.50),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ride_completed");
        assert_eq!(json["final_price"], "25.50");
    }

    #[test]
    fn test_kind_matches_tag() {
        let event = RideEvent::RideOfferRevoked {
            ride_id: RideId::new(),
            driver_id: DriverId::new(),
        };
        assert_eq!(event.kind().to_string(), "ride_offer_revoked");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind().to_string());
    }
}
