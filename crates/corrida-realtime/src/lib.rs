//! Corrida Realtime - event bus and connection router
//!
//! Two layers:
//!
//! - **EventBus**: an explicit observer table mapping event kind to an
//!   ordered list of handlers, invoked synchronously in registration
//!   order when a transition commits. The dispatcher (offer revocation)
//!   and the wallet (ride settlement) hang off this table, as does the
//!   router itself.
//! - **EventRouter**: the registry of live client connections keyed by
//!   (user id, role). Each subscription owns an unbounded channel;
//!   `publish` never blocks the caller and per-channel failures are
//!   isolated. Events with no registered channel are dropped - delivery
//!   is best-effort, at-most-once per connection, and clients reconcile
//!   state on reconnect.
//!
//! Ordering: events for one ride are emitted in the order their causing
//! transitions committed (the registry serializes per-ride mutations and
//! emits before releasing the ride); there is no cross-ride ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use corrida_types::{EventKind, RideEvent, Role, UserId};

// ============================================================================
// Event bus
// ============================================================================

/// A synchronous event handler. Implementations must not block: handlers
/// run inline at transition commit time.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &RideEvent);
}

/// Handle returned by `EventBus::on`, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// The observer table: event kind → handlers in registration order.
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<HashMap<EventKind, Vec<(ObserverId, Arc<dyn EventObserver>)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for the given kinds. Handlers fire in
    /// registration order per kind.
    pub fn on(&self, kinds: &[EventKind], observer: Arc<dyn EventObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut table = self.observers.write();
        for &kind in kinds {
            table
                .entry(kind)
                .or_default()
                .push((id, Arc::clone(&observer)));
        }
        id
    }

    /// Remove a handler from every kind it was registered for.
    pub fn off(&self, id: ObserverId) {
        let mut table = self.observers.write();
        for handlers in table.values_mut() {
            handlers.retain(|(observer_id, _)| *observer_id != id);
        }
    }

    /// Invoke every handler registered for the event's kind.
    ///
    /// The handler list is snapshotted first so no lock is held while
    /// handlers run.
    pub fn emit(&self, event: &RideEvent) {
        let handlers: Vec<Arc<dyn EventObserver>> = {
            let table = self.observers.read();
            match table.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };
        trace!(kind = %event.kind(), handlers = handlers.len(), "emit");
        for handler in handlers {
            handler.on_event(event);
        }
    }
}

// ============================================================================
// Connection router
// ============================================================================

/// Identifier of one delivery channel (one live connection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

struct Subscriber {
    id: ChannelId,
    tx: mpsc::UnboundedSender<RideEvent>,
}

/// Registry of live connections keyed by (user id, role).
///
/// A user may hold several connections (multiple devices); delivery to
/// each is independent and a dead channel never affects its siblings.
#[derive(Default)]
pub struct EventRouter {
    connections: DashMap<(UserId, Role), Vec<Subscriber>>,
    next_channel: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delivery channel for (user, role).
    ///
    /// The new channel immediately receives a `connection_ack`.
    pub fn subscribe(
        &self,
        user: UserId,
        role: Role,
    ) -> (ChannelId, mpsc::UnboundedReceiver<RideEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        let _ = tx.send(RideEvent::ConnectionAck { user_id: user, role });
        self.connections
            .entry((user, role))
            .or_default()
            .push(Subscriber { id, tx });
        debug!(%user, %role, channel = id.0, "subscribed");
        (id, rx)
    }

    /// Remove one channel (disconnect, close, logout).
    pub fn unsubscribe(&self, user: UserId, role: Role, channel: ChannelId) {
        if let Some(mut subscribers) = self.connections.get_mut(&(user, role)) {
            subscribers.retain(|s| s.id != channel);
            let empty = subscribers.is_empty();
            drop(subscribers);
            if empty {
                self.connections.remove_if(&(user, role), |_, s| s.is_empty());
            }
        }
        debug!(%user, %role, channel = channel.0, "unsubscribed");
    }

    /// Number of live channels for (user, role)
    pub fn connection_count(&self, user: UserId, role: Role) -> usize {
        self.connections
            .get(&(user, role))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Deliver an event to every channel of the target.
    ///
    /// Never blocks: channels are unbounded and closed channels are
    /// pruned on the spot. With no registered channel the event is
    /// dropped.
    pub fn publish(&self, user: UserId, role: Role, event: &RideEvent) {
        let Some(mut subscribers) = self.connections.get_mut(&(user, role)) else {
            trace!(%user, %role, kind = %event.kind(), "no subscriber, dropped");
            return;
        };
        subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
    }

    /// Route an event to its target subscriber set.
    pub fn route(&self, event: &RideEvent) {
        match event {
            RideEvent::RideOffer { driver_id, .. }
            | RideEvent::RideOfferRevoked { driver_id, .. } => {
                self.publish((*driver_id).into(), Role::Driver, event);
            }
            RideEvent::RideAccepted {
                passenger_id,
                driver_id,
                ..
            }
            | RideEvent::DriverArriving {
                passenger_id,
                driver_id,
                ..
            }
            | RideEvent::RideStarted {
                passenger_id,
                driver_id,
                ..
            }
            | RideEvent::RideCompleted {
                passenger_id,
                driver_id,
                ..
            } => {
                self.publish((*passenger_id).into(), Role::Passenger, event);
                self.publish((*driver_id).into(), Role::Driver, event);
            }
            RideEvent::RideCancelled {
                passenger_id,
                driver_id,
                ..
            } => {
                self.publish((*passenger_id).into(), Role::Passenger, event);
                if let Some(driver) = driver_id {
                    self.publish((*driver).into(), Role::Driver, event);
                }
            }
            RideEvent::RideReopened { passenger_id, .. } => {
                self.publish((*passenger_id).into(), Role::Passenger, event);
            }
            RideEvent::DriverLocation { passenger_id, .. } => {
                self.publish((*passenger_id).into(), Role::Passenger, event);
            }
            // Acks are sent at subscription time, never routed.
            RideEvent::ConnectionAck { .. } => {}
        }
    }
}

impl EventObserver for EventRouter {
    fn on_event(&self, event: &RideEvent) {
        self.route(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corrida_types::{DriverId, PassengerId, RideId};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    fn accepted(passenger: PassengerId, driver: DriverId) -> RideEvent {
        RideEvent::RideAccepted {
            ride_id: RideId::new(),
            passenger_id: passenger,
            driver_id: driver,
        }
    }

    #[test]
    fn test_subscribe_receives_ack() {
        let router = EventRouter::new();
        let user = UserId::from_uuid(uuid::Uuid::new_v4());
        let (_, mut rx) = router.subscribe(user, Role::Driver);
        let ack = rx.try_recv().unwrap();
        assert!(matches!(ack, RideEvent::ConnectionAck { user_id, role }
            if user_id == user && role == Role::Driver));
    }

    #[test]
    fn test_route_targets_both_sides_on_accept() {
        let router = EventRouter::new();
        let passenger = PassengerId::new();
        let driver = DriverId::new();
        let (_, mut passenger_rx) = router.subscribe(passenger.into(), Role::Passenger);
        let (_, mut driver_rx) = router.subscribe(driver.into(), Role::Driver);
        // Drain acks
        passenger_rx.try_recv().unwrap();
        driver_rx.try_recv().unwrap();

        router.route(&accepted(passenger, driver));
        assert!(matches!(
            passenger_rx.try_recv().unwrap(),
            RideEvent::RideAccepted { .. }
        ));
        assert!(matches!(
            driver_rx.try_recv().unwrap(),
            RideEvent::RideAccepted { .. }
        ));
    }

    #[test]
    fn test_offer_goes_only_to_the_candidate() {
        let router = EventRouter::new();
        let candidate = DriverId::new();
        let bystander = DriverId::new();
        let (_, mut candidate_rx) = router.subscribe(candidate.into(), Role::Driver);
        let (_, mut bystander_rx) = router.subscribe(bystander.into(), Role::Driver);
        candidate_rx.try_recv().unwrap();
        bystander_rx.try_recv().unwrap();

        router.route(&RideEvent::RideOffer {
            ride_id: RideId::new(),
            driver_id: candidate,
            origin_address: "Av. Paulista, 1000".into(),
            destination_address: "R. Augusta, 500".into(),
            category: corrida_types::RideCategory::Standard,
            estimated_price: dec!(18.40),
            distance_km: dec!(4.2),
            expires_at: chrono::Utc::now(),
        });
        assert!(candidate_rx.try_recv().is_ok());
        assert!(bystander_rx.try_recv().is_err());
    }

    #[test]
    fn test_fan_out_to_multiple_channels() {
        let router = EventRouter::new();
        let passenger = PassengerId::new();
        let driver = DriverId::new();
        let (_, mut rx_a) = router.subscribe(passenger.into(), Role::Passenger);
        let (_, mut rx_b) = router.subscribe(passenger.into(), Role::Passenger);
        rx_a.try_recv().unwrap();
        rx_b.try_recv().unwrap();

        router.route(&accepted(passenger, driver));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_closed_channel_is_pruned_and_isolated() {
        let router = EventRouter::new();
        let passenger = PassengerId::new();
        let driver = DriverId::new();
        let (_, rx_dead) = router.subscribe(passenger.into(), Role::Passenger);
        let (_, mut rx_live) = router.subscribe(passenger.into(), Role::Passenger);
        rx_live.try_recv().unwrap();
        drop(rx_dead);

        router.route(&accepted(passenger, driver));
        assert!(rx_live.try_recv().is_ok());
        assert_eq!(
            router.connection_count(passenger.into(), Role::Passenger),
            1
        );
    }

    #[test]
    fn test_unsubscribe_removes_channel() {
        let router = EventRouter::new();
        let user = UserId::from_uuid(uuid::Uuid::new_v4());
        let (id, _rx) = router.subscribe(user, Role::Driver);
        assert_eq!(router.connection_count(user, Role::Driver), 1);
        router.unsubscribe(user, Role::Driver, id);
        assert_eq!(router.connection_count(user, Role::Driver), 0);
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
        label: &'static str,
        shared: Arc<Mutex<Vec<&'static str>>>,
    }

    impl EventObserver for Recorder {
        fn on_event(&self, event: &RideEvent) {
            self.seen.lock().push(event.kind().to_string());
            self.shared.lock().push(self.label);
        }
    }

    #[test]
    fn test_bus_invokes_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            label: "first",
            shared: Arc::clone(&order),
        });
        let second = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            label: "second",
            shared: Arc::clone(&order),
        });
        bus.on(&[EventKind::RideAccepted], first);
        bus.on(&[EventKind::RideAccepted], second);

        bus.emit(&accepted(PassengerId::new(), DriverId::new()));
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_bus_off_deregisters() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let observer = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            label: "only",
            shared: Arc::clone(&order),
        });
        let id = bus.on(&[EventKind::RideAccepted], observer);
        bus.off(id);

        bus.emit(&accepted(PassengerId::new(), DriverId::new()));
        assert!(order.lock().is_empty());
    }

    #[test]
    fn test_bus_filters_by_kind() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let observer = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            label: "completed-only",
            shared: Arc::clone(&order),
        });
        bus.on(&[EventKind::RideCompleted], observer);

        bus.emit(&accepted(PassengerId::new(), DriverId::new()));
        assert!(order.lock().is_empty());
    }
}
