//! Corrida Dispatch - finding and binding a driver to a requested ride
//!
//! `dispatch` runs as one task per ride. Each round queries the driver
//! index at an expanding radius, offers the ride to the ranked
//! candidates, and waits for the round deadline or an early resolution
//! (acceptance, cancellation, or every candidate declining) signalled on
//! a per-ride `Notify`. Rounds are separated by a backoff; when every
//! round is exhausted the ride is auto-cancelled with
//! NoDriversAvailable.
//!
//! The acceptance race is resolved by the registry's conditional
//! `bind_driver`: many drivers may accept concurrently, exactly one
//! conditional update succeeds, the rest observe `Conflict` and remain
//! available for other rides. The offer table here is advisory - the
//! registry is the source of truth, so a stale offer can never bind a
//! dead ride.
//!
//! Cancellation and driver release revoke outstanding offers
//! synchronously through the event-bus observer, so straggler accepts
//! are rejected rather than silently bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use corrida_geo::{DriverIndex, NearbyDriver};
use corrida_realtime::{EventBus, EventObserver};
use corrida_rides::RideRegistry;
use corrida_types::{
    CoreError, DriverId, EventKind, Result, Ride, RideEvent, RideId, RideStatus,
};

/// Dispatcher tunables
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// First search radius around the pickup point
    pub initial_radius_km: f64,
    /// Widened radius used when the first search is empty
    pub extended_radius_km: f64,
    /// How long one offer wave stays open
    pub offer_timeout: Duration,
    /// Offer rounds before the ride is auto-cancelled
    pub max_rounds: u32,
    /// Pause between rounds
    pub retry_backoff: Duration,
    /// Candidates offered per wave
    pub max_candidates: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            initial_radius_km: 2.0,
            extended_radius_km: 5.0,
            offer_timeout: Duration::from_secs(15),
            max_rounds: 3,
            retry_backoff: Duration::from_secs(5),
            max_candidates: 8,
        }
    }
}

/// Per-driver offer state within a wave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    Pending,
    Declined,
    Expired,
    Won,
}

#[derive(Debug)]
struct OfferEntry {
    driver_id: DriverId,
    status: OfferStatus,
}

/// One offer wave: the ordered candidate list and its deadline.
/// Transient - discarded once the ride is bound or the wave retires.
#[derive(Debug)]
struct OfferState {
    round: u32,
    deadline: DateTime<Utc>,
    entries: Vec<OfferEntry>,
}

/// The dispatcher
pub struct Dispatcher {
    config: DispatchConfig,
    registry: Arc<RideRegistry>,
    index: Arc<DriverIndex>,
    events: Arc<EventBus>,
    offers: DashMap<RideId, Mutex<OfferState>>,
    wakeups: DashMap<RideId, Arc<Notify>>,
    /// Latest dispatch generation per ride; an older loop observing a
    /// newer epoch stands down. Guards against double loops after a
    /// driver release re-opens a ride.
    epochs: DashMap<RideId, u64>,
    epoch_counter: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        registry: Arc<RideRegistry>,
        index: Arc<DriverIndex>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            registry,
            index,
            events,
            offers: DashMap::new(),
            wakeups: DashMap::new(),
            epochs: DashMap::new(),
            epoch_counter: AtomicU64::new(0),
        }
    }

    /// Start (or restart) the offer loop for a requested ride.
    pub fn spawn_dispatch(self: &Arc<Self>, ride_id: RideId) {
        let epoch = self.epoch_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.epochs.insert(ride_id, epoch);
        self.wakeups.insert(ride_id, Arc::new(Notify::new()));
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.run_dispatch(ride_id, epoch).await;
        });
    }

    fn is_current_epoch(&self, ride_id: RideId, epoch: u64) -> bool {
        self.epochs.get(&ride_id).map(|e| *e) == Some(epoch)
    }

    fn wakeup(&self, ride_id: RideId) -> Arc<Notify> {
        self.wakeups
            .get(&ride_id)
            .map(|n| Arc::clone(&n))
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    fn notify_ride(&self, ride_id: RideId) {
        if let Some(notify) = self.wakeups.get(&ride_id) {
            notify.notify_one();
        }
    }

    async fn run_dispatch(self: Arc<Self>, ride_id: RideId, epoch: u64) {
        for round in 1..=self.config.max_rounds {
            let ride = match self.registry.get(ride_id) {
                Ok(ride) => ride,
                Err(_) => break,
            };
            if ride.status != RideStatus::Requested {
                break;
            }
            // A release swaps the epoch under the ride lock before its
            // status change becomes visible, so checking the epoch AFTER
            // reading the status is what makes a superseded loop stand
            // down without touching its successor's waves.
            if !self.is_current_epoch(ride_id, epoch) {
                return;
            }

            let candidates = self.find_candidates(&ride);
            if candidates.is_empty() {
                debug!(ride = %ride_id, round, "no candidates in range");
                if round < self.config.max_rounds {
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                continue;
            }

            let deadline = Utc::now()
                + chrono::Duration::from_std(self.config.offer_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(15));
            self.offers.insert(
                ride_id,
                Mutex::new(OfferState {
                    round,
                    deadline,
                    entries: candidates
                        .iter()
                        .map(|c| OfferEntry {
                            driver_id: c.driver_id,
                            status: OfferStatus::Pending,
                        })
                        .collect(),
                }),
            );
            info!(
                ride = %ride_id,
                round,
                candidates = candidates.len(),
                "offer wave published"
            );
            for candidate in &candidates {
                self.events.emit(&RideEvent::RideOffer {
                    ride_id,
                    driver_id: candidate.driver_id,
                    origin_address: ride.origin.address.clone(),
                    destination_address: ride.destination.address.clone(),
                    category: ride.category,
                    estimated_price: ride.estimated_price,
                    distance_km: ride.distance_km,
                    expires_at: deadline,
                });
            }

            self.wait_for_wave(ride_id).await;

            let still_requested = matches!(
                self.registry.get(ride_id),
                Ok(ride) if ride.status == RideStatus::Requested
            );
            if !self.is_current_epoch(ride_id, epoch) {
                // Re-opened and re-dispatched while we slept; the waves
                // now belong to the newer loop.
                return;
            }
            if !still_requested {
                // Bound or cancelled while the wave was open; the
                // winning/cancelling path already retired it.
                self.retire_wave(ride_id, "resolved");
                break;
            }
            self.retire_wave(ride_id, "expired");
            if round < self.config.max_rounds {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }

        if let Ok(ride) = self.registry.get(ride_id) {
            if ride.status == RideStatus::Requested && self.is_current_epoch(ride_id, epoch) {
                warn!(ride = %ride_id, "dispatch exhausted, auto-cancelling");
                if let Err(e) = self.registry.cancel_no_drivers(ride_id) {
                    debug!(ride = %ride_id, error = %e, "auto-cancel skipped");
                }
            }
        }
        // A newer epoch may have replaced ours while we wound down; only
        // tear down state that still belongs to this loop.
        if self.epochs.remove_if(&ride_id, |_, e| *e == epoch).is_some() {
            self.wakeups.remove(&ride_id);
        }
    }

    /// Online, fresh, category-compatible drivers ranked by distance,
    /// searching at 2 km and widening to 5 km if nobody is close.
    fn find_candidates(&self, ride: &Ride) -> Vec<NearbyDriver> {
        let origin = &ride.origin.point;
        let near = self
            .index
            .nearby(
                origin,
                self.config.initial_radius_km,
                Some(ride.category),
                self.config.max_candidates,
            )
            .unwrap_or_default();
        if !near.is_empty() {
            return near;
        }
        self.index
            .nearby(
                origin,
                self.config.extended_radius_km,
                Some(ride.category),
                self.config.max_candidates,
            )
            .unwrap_or_default()
    }

    /// Park until the wave deadline, waking early on acceptance,
    /// cancellation, or every candidate declining.
    async fn wait_for_wave(&self, ride_id: RideId) {
        let notify = self.wakeup(ride_id);
        let deadline = Instant::now() + self.config.offer_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            tokio::select! {
                _ = notify.notified() => {
                    if self.wave_resolved(ride_id) {
                        return;
                    }
                }
                _ = tokio::time::sleep(deadline - now) => {
                    return;
                }
            }
        }
    }

    fn wave_resolved(&self, ride_id: RideId) -> bool {
        match self.registry.get(ride_id) {
            Ok(ride) if ride.status == RideStatus::Requested => {}
            _ => return true,
        }
        match self.offers.get(&ride_id) {
            None => true,
            Some(entry) => entry
                .lock()
                .entries
                .iter()
                .all(|e| e.status != OfferStatus::Pending),
        }
    }

    /// Drop the ride's offer wave and tell every still-pending candidate
    /// the offer is gone.
    fn retire_wave(&self, ride_id: RideId, cause: &str) {
        let Some((_, state)) = self.offers.remove(&ride_id) else {
            return;
        };
        let state = state.into_inner();
        let pending: Vec<DriverId> = state
            .entries
            .iter()
            .filter(|e| e.status == OfferStatus::Pending)
            .map(|e| e.driver_id)
            .collect();
        debug!(
            ride = %ride_id,
            round = state.round,
            revoked = pending.len(),
            cause,
            "offer wave retired"
        );
        for driver in pending {
            self.events.emit(&RideEvent::RideOfferRevoked {
                ride_id,
                driver_id: driver,
            });
        }
    }

    /// A candidate accepts the offer.
    ///
    /// Exactly one concurrent accept wins the conditional bind; the rest
    /// observe `Conflict`, as does any accept arriving after revocation
    /// or expiry.
    pub fn accept(&self, ride_id: RideId, driver: DriverId) -> Result<Ride> {
        {
            let entry = self
                .offers
                .get(&ride_id)
                .ok_or_else(|| CoreError::conflict(format!("no open offer for ride {ride_id}")))?;
            let mut state = entry.lock();
            if Utc::now() > state.deadline {
                return Err(CoreError::conflict(format!(
                    "offer for ride {ride_id} expired"
                )));
            }
            let offered = state
                .entries
                .iter_mut()
                .find(|e| e.driver_id == driver)
                .ok_or_else(|| {
                    CoreError::conflict(format!("driver {driver} was not offered ride {ride_id}"))
                })?;
            if offered.status != OfferStatus::Pending {
                return Err(CoreError::conflict(format!(
                    "offer for ride {ride_id} is no longer pending"
                )));
            }
            // Offer checks passed; drop the wave lock before touching the
            // registry so revocation can never deadlock against us.
        }

        let ride = self.registry.bind_driver(ride_id, driver)?;

        let mut losers = Vec::new();
        if let Some(entry) = self.offers.get(&ride_id) {
            let mut state = entry.lock();
            for e in state.entries.iter_mut() {
                if e.driver_id == driver {
                    e.status = OfferStatus::Won;
                } else if e.status == OfferStatus::Pending {
                    e.status = OfferStatus::Expired;
                    losers.push(e.driver_id);
                }
            }
        }
        self.offers.remove(&ride_id);
        for loser in losers {
            self.events.emit(&RideEvent::RideOfferRevoked {
                ride_id,
                driver_id: loser,
            });
        }
        self.notify_ride(ride_id);
        info!(ride = %ride_id, driver = %driver, "offer accepted");
        Ok(ride)
    }

    /// A candidate declines the offer. Declining never excludes the
    /// driver from later rounds of the same ride.
    pub fn decline(&self, ride_id: RideId, driver: DriverId) -> Result<()> {
        let all_resolved = {
            let entry = self
                .offers
                .get(&ride_id)
                .ok_or_else(|| CoreError::conflict(format!("no open offer for ride {ride_id}")))?;
            let mut state = entry.lock();
            let offered = state
                .entries
                .iter_mut()
                .find(|e| e.driver_id == driver)
                .ok_or_else(|| {
                    CoreError::conflict(format!("driver {driver} was not offered ride {ride_id}"))
                })?;
            if offered.status != OfferStatus::Pending {
                return Err(CoreError::conflict(format!(
                    "offer for ride {ride_id} is no longer pending"
                )));
            }
            offered.status = OfferStatus::Declined;
            state
                .entries
                .iter()
                .all(|e| e.status != OfferStatus::Pending)
        };
        debug!(ride = %ride_id, driver = %driver, "offer declined");
        if all_resolved {
            // Everyone passed; wake the loop so the next round starts
            // without waiting out the deadline.
            self.notify_ride(ride_id);
        }
        Ok(())
    }

    /// Snapshot of the open offer wave, if any (driver, status) in rank
    /// order.
    pub fn offer_snapshot(&self, ride_id: RideId) -> Option<Vec<(DriverId, OfferStatus)>> {
        self.offers.get(&ride_id).map(|entry| {
            entry
                .lock()
                .entries
                .iter()
                .map(|e| (e.driver_id, e.status))
                .collect()
        })
    }
}

/// Event-bus hook: revokes outstanding offers the moment a ride is
/// cancelled, and restarts dispatch when a driver releases a ride.
pub struct DispatchObserver(pub Arc<Dispatcher>);

impl DispatchObserver {
    /// The kinds this observer must be registered for.
    pub const KINDS: [EventKind; 2] = [EventKind::RideCancelled, EventKind::RideReopened];
}

impl EventObserver for DispatchObserver {
    fn on_event(&self, event: &RideEvent) {
        match event {
            RideEvent::RideCancelled { ride_id, .. } => {
                self.0.retire_wave(*ride_id, "cancelled");
                self.0.notify_ride(*ride_id);
            }
            RideEvent::RideReopened { ride_id, .. } => {
                self.0.retire_wave(*ride_id, "reopened");
                self.0.notify_ride(*ride_id);
                // Re-dispatch runs on its own task; the registry lock is
                // still held by the releasing transition here.
                self.0.spawn_dispatch(*ride_id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corrida_geo::GeoConfig;
    use corrida_realtime::EventRouter;
    use corrida_rides::pricing::PricingConfig;
    use corrida_types::{
        Actor, CancelReason, GeoPoint, Location, PassengerId, RideCategory, Role,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    const PICKUP: GeoPoint = GeoPoint {
        latitude: -23.5611,
        longitude: -46.6550,
    };

    struct Harness {
        registry: Arc<RideRegistry>,
        index: Arc<DriverIndex>,
        router: Arc<EventRouter>,
        dispatcher: Arc<Dispatcher>,
    }

    fn harness(config: DispatchConfig) -> Harness {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(RideRegistry::new(Arc::clone(&events)));
        let index = Arc::new(DriverIndex::new(GeoConfig::default()));
        let router = Arc::new(EventRouter::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            Arc::clone(&registry),
            Arc::clone(&index),
            Arc::clone(&events),
        ));
        let router_observer: Arc<dyn EventObserver> = router.clone();
        events.on(&EventKind::ALL, router_observer);
        events.on(
            &DispatchObserver::KINDS,
            Arc::new(DispatchObserver(Arc::clone(&dispatcher))),
        );
        Harness {
            registry,
            index,
            router,
            dispatcher,
        }
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            offer_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(30),
            max_rounds: 3,
            ..DispatchConfig::default()
        }
    }

    fn request_ride(harness: &Harness) -> Ride {
        let destination = GeoPoint::new(-23.5505, -46.6333);
        let quote = PricingConfig::default()
            .quote(&PICKUP, &destination, RideCategory::Standard)
            .unwrap();
        harness
            .registry
            .create(
                PassengerId::new(),
                Location::new("Av. Paulista, 1578", PICKUP),
                Location::new("Praça da Sé, 1", destination),
                RideCategory::Standard,
                quote,
            )
            .unwrap()
    }

    fn online_driver(harness: &Harness) -> (DriverId, UnboundedReceiver<RideEvent>) {
        let driver = DriverId::new();
        harness
            .index
            .set_online(driver, PICKUP, None, RideCategory::Standard)
            .unwrap();
        let (_, mut rx) = harness.router.subscribe(driver.into(), Role::Driver);
        // Drain the ack
        rx.try_recv().unwrap();
        (driver, rx)
    }

    async fn next_event(rx: &mut UnboundedReceiver<RideEvent>) -> RideEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_accept_binds_and_revokes_losers() {
        let harness = harness(fast_config());
        let (winner, mut winner_rx) = online_driver(&harness);
        let (loser, mut loser_rx) = online_driver(&harness);
        let ride = request_ride(&harness);

        harness.dispatcher.spawn_dispatch(ride.id);
        assert!(matches!(
            next_event(&mut winner_rx).await,
            RideEvent::RideOffer { .. }
        ));
        assert!(matches!(
            next_event(&mut loser_rx).await,
            RideEvent::RideOffer { .. }
        ));

        let bound = harness.dispatcher.accept(ride.id, winner).unwrap();
        assert_eq!(bound.status, RideStatus::Accepted);
        assert_eq!(bound.driver_id, Some(winner));

        // Loser is told the ride is gone, and a late accept conflicts
        assert!(matches!(
            next_event(&mut loser_rx).await,
            RideEvent::RideOfferRevoked { .. }
        ));
        let err = harness
            .dispatcher
            .accept(ride.id, loser)
            .expect_err("ride already bound");
        assert_eq!(err.error_code(), "CONFLICT");

        // Winner also sees the accepted event
        assert!(matches!(
            next_event(&mut winner_rx).await,
            RideEvent::RideAccepted { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_revokes_offer_synchronously() {
        let harness = harness(fast_config());
        let (driver, mut driver_rx) = online_driver(&harness);
        let ride = request_ride(&harness);

        harness.dispatcher.spawn_dispatch(ride.id);
        assert!(matches!(
            next_event(&mut driver_rx).await,
            RideEvent::RideOffer { .. }
        ));

        harness
            .registry
            .cancel(ride.id, Actor::Passenger(ride.passenger_id))
            .unwrap();

        // Revocation happened inside the cancel call; the straggler
        // accept must conflict.
        let err = harness
            .dispatcher
            .accept(ride.id, driver)
            .expect_err("offer was revoked");
        assert_eq!(err.error_code(), "CONFLICT");
        assert!(matches!(
            next_event(&mut driver_rx).await,
            RideEvent::RideOfferRevoked { .. }
        ));
    }

    #[tokio::test]
    async fn test_exhausted_dispatch_auto_cancels() {
        let harness = harness(DispatchConfig {
            offer_timeout: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(20),
            max_rounds: 3,
            ..DispatchConfig::default()
        });
        // No drivers online at all
        let ride = request_ride(&harness);
        harness.dispatcher.spawn_dispatch(ride.id);

        wait_until(|| {
            harness.registry.get(ride.id).unwrap().status == RideStatus::Cancelled
        })
        .await;
        let cancelled = harness.registry.get(ride.id).unwrap();
        assert_eq!(
            cancelled.cancel_reason,
            Some(CancelReason::NoDriversAvailable)
        );
        assert_eq!(cancelled.driver_id, None);
    }

    #[tokio::test]
    async fn test_decliner_is_reoffered_next_round() {
        let harness = harness(fast_config());
        let (driver, mut driver_rx) = online_driver(&harness);
        let ride = request_ride(&harness);

        harness.dispatcher.spawn_dispatch(ride.id);
        assert!(matches!(
            next_event(&mut driver_rx).await,
            RideEvent::RideOffer { .. }
        ));
        harness.dispatcher.decline(ride.id, driver).unwrap();

        // Round two re-offers the same driver, who takes it this time
        assert!(matches!(
            next_event(&mut driver_rx).await,
            RideEvent::RideOffer { .. }
        ));
        let bound = harness.dispatcher.accept(ride.id, driver).unwrap();
        assert_eq!(bound.driver_id, Some(driver));
    }

    #[tokio::test]
    async fn test_expired_wave_notifies_candidates() {
        let harness = harness(DispatchConfig {
            offer_timeout: Duration::from_millis(80),
            retry_backoff: Duration::from_millis(20),
            max_rounds: 1,
            ..DispatchConfig::default()
        });
        let (_, mut driver_rx) = online_driver(&harness);
        let ride = request_ride(&harness);

        harness.dispatcher.spawn_dispatch(ride.id);
        assert!(matches!(
            next_event(&mut driver_rx).await,
            RideEvent::RideOffer { .. }
        ));
        // Never respond: the wave expires and the single round runs out
        assert!(matches!(
            next_event(&mut driver_rx).await,
            RideEvent::RideOfferRevoked { .. }
        ));
        wait_until(|| {
            harness.registry.get(ride.id).unwrap().status == RideStatus::Cancelled
        })
        .await;
    }

    #[tokio::test]
    async fn test_driver_release_restarts_dispatch() {
        let harness = harness(fast_config());
        let (first, mut first_rx) = online_driver(&harness);
        let ride = request_ride(&harness);

        harness.dispatcher.spawn_dispatch(ride.id);
        assert!(matches!(
            next_event(&mut first_rx).await,
            RideEvent::RideOffer { .. }
        ));
        harness.dispatcher.accept(ride.id, first).unwrap();
        // First driver goes off-shift; another one is available
        harness.index.set_offline(first);
        let (second, mut second_rx) = online_driver(&harness);

        harness
            .registry
            .cancel(ride.id, Actor::Driver(first))
            .unwrap();
        assert_eq!(
            harness.registry.get(ride.id).unwrap().status,
            RideStatus::Requested
        );

        assert!(matches!(
            next_event(&mut second_rx).await,
            RideEvent::RideOffer { .. }
        ));
        let bound = harness.dispatcher.accept(ride.id, second).unwrap();
        assert_eq!(bound.driver_id, Some(second));
    }

    #[tokio::test]
    async fn test_multiple_accepts_have_one_winner() {
        let harness = harness(fast_config());
        let mut drivers = Vec::new();
        for _ in 0..4 {
            drivers.push(online_driver(&harness));
        }
        let ride = request_ride(&harness);
        harness.dispatcher.spawn_dispatch(ride.id);
        for (_, rx) in drivers.iter_mut() {
            assert!(matches!(next_event(rx).await, RideEvent::RideOffer { .. }));
        }

        let mut outcomes = Vec::new();
        for (driver, _) in &drivers {
            outcomes.push(harness.dispatcher.accept(ride.id, *driver));
        }
        let winners = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(CoreError::Conflict { .. })))
                .count(),
            drivers.len() - 1
        );
    }
}
