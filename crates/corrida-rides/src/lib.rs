//! Corrida Rides - the ride registry and its state machine
//!
//! The registry is the single source of truth for ride status. Every
//! mutation is a conditional update executed under that ride's own lock:
//! the current status (and, for binding, the absence of a driver) is
//! checked and swapped in one critical section, so concurrent actors
//! serialize per ride while distinct rides proceed in parallel. No lock
//! is ever held across an await point or blocking I/O.
//!
//! Committed transitions are announced synchronously on the event bus,
//! still inside the ride's critical section, which makes the per-ride
//! event order exactly the commit order. Bus handlers are non-blocking
//! and must not call back into the registry inline (spawn instead).
//!
//! # Invariants
//!
//! 1. driver id is Some iff status is Accepted or later
//! 2. exactly one `bind_driver` succeeds per binding; losers get Conflict
//! 3. Completed and Cancelled are never left
//! 4. rides are never deleted

pub mod pricing;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, warn};

use corrida_realtime::EventBus;
use corrida_types::{
    round_money, Actor, CancelReason, CoreError, DriverId, Location, PassengerId, Result, Ride,
    RideCategory, RideEvent, RideId, RideQuote, RideStatus,
};

/// The authoritative ride store
pub struct RideRegistry {
    rides: DashMap<RideId, Arc<Mutex<Ride>>>,
    by_passenger: DashMap<PassengerId, Vec<RideId>>,
    by_driver: DashMap<DriverId, Vec<RideId>>,
    events: Arc<EventBus>,
}

impl RideRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            rides: DashMap::new(),
            by_passenger: DashMap::new(),
            by_driver: DashMap::new(),
            events,
        }
    }

    /// Create a ride in Requested for a passenger request.
    ///
    /// The quote carries the estimate accepted by the passenger; dispatch
    /// is started by the caller once the ride exists.
    pub fn create(
        &self,
        passenger: PassengerId,
        origin: Location,
        destination: Location,
        category: RideCategory,
        quote: RideQuote,
    ) -> Result<Ride> {
        origin.point.validate("origin")?;
        destination.point.validate("destination")?;
        if origin.point == destination.point {
            return Err(CoreError::invalid_input(
                "destination",
                "origin and destination coordinates are identical",
            ));
        }

        let ride = Ride {
            id: RideId::new(),
            passenger_id: passenger,
            driver_id: None,
            origin,
            destination,
            category,
            distance_km: quote.distance_km,
            duration_min: quote.duration_min,
            estimated_price: quote.estimated_price,
            final_price: None,
            status: RideStatus::Requested,
            cancel_reason: None,
            created_at: Utc::now(),
            accepted_at: None,
            arriving_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        };
        self.rides.insert(ride.id, Arc::new(Mutex::new(ride.clone())));
        self.by_passenger
            .entry(passenger)
            .or_default()
            .push(ride.id);
        info!(
            ride = %ride.id,
            passenger = %passenger,
            %category,
            price = %ride.estimated_price,
            "ride requested"
        );
        Ok(ride)
    }

    fn entry(&self, id: RideId) -> Result<Arc<Mutex<Ride>>> {
        self.rides
            .get(&id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| CoreError::not_found("ride", id))
    }

    /// Current snapshot of a ride
    pub fn get(&self, id: RideId) -> Result<Ride> {
        Ok(self.entry(id)?.lock().clone())
    }

    /// Bind a driver to a Requested ride: Requested → Accepted.
    ///
    /// This is the acceptance race resolver. The update commits only if
    /// the prior status was Requested with no driver bound; every other
    /// concurrent attempt observes `Conflict` and must not retry as if it
    /// had won.
    pub fn bind_driver(&self, id: RideId, driver: DriverId) -> Result<Ride> {
        let entry = self.entry(id)?;
        let mut ride = entry.lock();
        if ride.status != RideStatus::Requested || ride.driver_id.is_some() {
            return Err(CoreError::conflict(format!(
                "ride {id} is not available (status {})",
                ride.status
            )));
        }
        ride.status = RideStatus::Accepted;
        ride.driver_id = Some(driver);
        ride.accepted_at = Some(Utc::now());
        self.by_driver.entry(driver).or_default().push(id);
        info!(ride = %id, driver = %driver, "driver bound");
        self.events.emit(&RideEvent::RideAccepted {
            ride_id: id,
            passenger_id: ride.passenger_id,
            driver_id: driver,
        });
        Ok(ride.clone())
    }

    fn guard_bound_driver(ride: &Ride, driver: DriverId) -> Result<()> {
        if ride.driver_id != Some(driver) {
            return Err(CoreError::forbidden(format!(
                "driver {driver} is not assigned to ride {}",
                ride.id
            )));
        }
        Ok(())
    }

    /// Accepted → DriverArriving, by the bound driver only.
    pub fn mark_arriving(&self, id: RideId, driver: DriverId) -> Result<Ride> {
        let entry = self.entry(id)?;
        let mut ride = entry.lock();
        Self::guard_bound_driver(&ride, driver)?;
        if ride.status != RideStatus::Accepted {
            return Err(CoreError::conflict(format!(
                "ride {id} is {}, expected ACCEPTED",
                ride.status
            )));
        }
        ride.status = RideStatus::DriverArriving;
        ride.arriving_at = Some(Utc::now());
        info!(ride = %id, driver = %driver, "driver arriving");
        self.events.emit(&RideEvent::DriverArriving {
            ride_id: id,
            passenger_id: ride.passenger_id,
            driver_id: driver,
        });
        Ok(ride.clone())
    }

    /// DriverArriving → InProgress, by the bound driver only.
    pub fn start_ride(&self, id: RideId, driver: DriverId) -> Result<Ride> {
        let entry = self.entry(id)?;
        let mut ride = entry.lock();
        Self::guard_bound_driver(&ride, driver)?;
        if ride.status != RideStatus::DriverArriving {
            return Err(CoreError::conflict(format!(
                "ride {id} is {}, expected DRIVER_ARRIVING",
                ride.status
            )));
        }
        ride.status = RideStatus::InProgress;
        ride.started_at = Some(Utc::now());
        info!(ride = %id, driver = %driver, "ride started");
        self.events.emit(&RideEvent::RideStarted {
            ride_id: id,
            passenger_id: ride.passenger_id,
            driver_id: driver,
        });
        Ok(ride.clone())
    }

    /// InProgress → Completed, by the bound driver only.
    ///
    /// Emits the completion fact the wallet settles on. The conditional
    /// transition fires at most once per ride, and the wallet credit is
    /// additionally idempotent on the ride reference, so a retried finish
    /// can never double-credit.
    pub fn finish_ride(&self, id: RideId, driver: DriverId, final_price: Decimal) -> Result<Ride> {
        if final_price <= Decimal::ZERO {
            return Err(CoreError::invalid_input(
                "final_price",
                format!("final price {final_price} must be positive"),
            ));
        }
        let entry = self.entry(id)?;
        let mut ride = entry.lock();
        Self::guard_bound_driver(&ride, driver)?;
        if ride.status != RideStatus::InProgress {
            return Err(CoreError::conflict(format!(
                "ride {id} is {}, expected IN_PROGRESS",
                ride.status
            )));
        }
        ride.status = RideStatus::Completed;
        ride.final_price = Some(round_money(final_price));
        ride.completed_at = Some(Utc::now());
        info!(ride = %id, driver = %driver, price = %final_price, "ride completed");
        self.events.emit(&RideEvent::RideCompleted {
            ride_id: id,
            passenger_id: ride.passenger_id,
            driver_id: driver,
            final_price: ride.final_price.unwrap_or(final_price),
        });
        Ok(ride.clone())
    }

    /// Cancel or release a ride, depending on who asks.
    ///
    /// A passenger cancels outright (any state before InProgress). A
    /// driver cancelling after accept does NOT terminate the ride: it is
    /// released back to Requested with the driver cleared so dispatch can
    /// find a replacement - otherwise the passenger would be stranded.
    pub fn cancel(&self, id: RideId, actor: Actor) -> Result<Ride> {
        match actor {
            Actor::Passenger(passenger) => self.cancel_by_passenger(id, passenger),
            Actor::Driver(driver) => self.release_by_driver(id, driver),
        }
    }

    fn cancel_by_passenger(&self, id: RideId, passenger: PassengerId) -> Result<Ride> {
        let entry = self.entry(id)?;
        let mut ride = entry.lock();
        if ride.passenger_id != passenger {
            return Err(CoreError::forbidden(format!(
                "passenger {passenger} does not own ride {id}"
            )));
        }
        if !matches!(
            ride.status,
            RideStatus::Requested | RideStatus::Accepted | RideStatus::DriverArriving
        ) {
            return Err(CoreError::conflict(format!(
                "ride {id} is {}, cancellation window closed",
                ride.status
            )));
        }
        ride.status = RideStatus::Cancelled;
        ride.cancel_reason = Some(CancelReason::PassengerRequest);
        ride.cancelled_at = Some(Utc::now());
        info!(ride = %id, passenger = %passenger, "ride cancelled by passenger");
        self.events.emit(&RideEvent::RideCancelled {
            ride_id: id,
            passenger_id: ride.passenger_id,
            driver_id: ride.driver_id,
            reason: CancelReason::PassengerRequest,
        });
        Ok(ride.clone())
    }

    fn release_by_driver(&self, id: RideId, driver: DriverId) -> Result<Ride> {
        let entry = self.entry(id)?;
        let mut ride = entry.lock();
        Self::guard_bound_driver(&ride, driver)?;
        if !matches!(
            ride.status,
            RideStatus::Accepted | RideStatus::DriverArriving
        ) {
            return Err(CoreError::conflict(format!(
                "ride {id} is {}, driver can no longer release it",
                ride.status
            )));
        }
        ride.status = RideStatus::Requested;
        ride.driver_id = None;
        ride.accepted_at = None;
        ride.arriving_at = None;
        if let Some(mut history) = self.by_driver.get_mut(&driver) {
            history.retain(|&r| r != id);
        }
        warn!(ride = %id, driver = %driver, "driver released ride, back to dispatch");
        self.events.emit(&RideEvent::RideReopened {
            ride_id: id,
            passenger_id: ride.passenger_id,
        });
        Ok(ride.clone())
    }

    /// Auto-cancel after dispatch exhausted every round.
    ///
    /// Only valid while the ride is still Requested and unbound.
    pub fn cancel_no_drivers(&self, id: RideId) -> Result<Ride> {
        let entry = self.entry(id)?;
        let mut ride = entry.lock();
        if ride.status != RideStatus::Requested || ride.driver_id.is_some() {
            return Err(CoreError::conflict(format!(
                "ride {id} is {}, auto-cancel skipped",
                ride.status
            )));
        }
        ride.status = RideStatus::Cancelled;
        ride.cancel_reason = Some(CancelReason::NoDriversAvailable);
        ride.cancelled_at = Some(Utc::now());
        warn!(ride = %id, "ride cancelled: no drivers available");
        self.events.emit(&RideEvent::RideCancelled {
            ride_id: id,
            passenger_id: ride.passenger_id,
            driver_id: None,
            reason: CancelReason::NoDriversAvailable,
        });
        Ok(ride.clone())
    }

    /// Ride history for a passenger, newest first
    pub fn rides_for_passenger(&self, passenger: PassengerId) -> Vec<Ride> {
        self.history(self.by_passenger.get(&passenger).map(|ids| ids.clone()))
    }

    /// Ride history for a driver, newest first
    pub fn rides_for_driver(&self, driver: DriverId) -> Vec<Ride> {
        self.history(self.by_driver.get(&driver).map(|ids| ids.clone()))
    }

    fn history(&self, ids: Option<Vec<RideId>>) -> Vec<Ride> {
        let mut rides: Vec<Ride> = ids
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.get(id).ok())
            .collect();
        rides.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rides
    }

    /// Total number of rides ever created
    pub fn ride_count(&self) -> usize {
        self.rides.len()
    }
}
