//! End-to-end flow across dispatch, registry, router, and wallet:
//! request → offers → acceptance race → trip lifecycle → settlement.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio::sync::mpsc::UnboundedReceiver;

use corrida_dispatch::{DispatchConfig, DispatchObserver, Dispatcher};
use corrida_geo::{DriverIndex, GeoConfig};
use corrida_realtime::{EventBus, EventObserver, EventRouter};
use corrida_rides::pricing::PricingConfig;
use corrida_rides::RideRegistry;
use corrida_types::{
    CancelReason, DriverId, EventKind, GeoPoint, Location, PassengerId, Ride, RideCategory,
    RideEvent, RideId, RideStatus, Role,
};
use corrida_wallet::{TransactionType, WalletConfig, WalletLedger};

const PICKUP: GeoPoint = GeoPoint {
    latitude: -23.56,
    longitude: -46.65,
};

/// Records the kinds of every event for one ride, in emission order.
struct KindRecorder {
    ride_id: Mutex<Option<RideId>>,
    kinds: Mutex<Vec<EventKind>>,
}

impl KindRecorder {
    fn new() -> Self {
        Self {
            ride_id: Mutex::new(None),
            kinds: Mutex::new(Vec::new()),
        }
    }

    fn watch(&self, ride_id: RideId) {
        *self.ride_id.lock() = Some(ride_id);
    }
}

impl EventObserver for KindRecorder {
    fn on_event(&self, event: &RideEvent) {
        if event.ride_id() == *self.ride_id.lock() {
            self.kinds.lock().push(event.kind());
        }
    }
}

struct World {
    registry: Arc<RideRegistry>,
    index: Arc<DriverIndex>,
    router: Arc<EventRouter>,
    dispatcher: Arc<Dispatcher>,
    wallet: Arc<WalletLedger>,
    recorder: Arc<KindRecorder>,
}

fn world() -> World {
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(RideRegistry::new(Arc::clone(&events)));
    let index = Arc::new(DriverIndex::new(GeoConfig::default()));
    let router = Arc::new(EventRouter::new());
    let dispatcher = Arc::new(Dispatcher::new(
        DispatchConfig {
            offer_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(30),
            max_rounds: 3,
            ..DispatchConfig::default()
        },
        Arc::clone(&registry),
        Arc::clone(&index),
        Arc::clone(&events),
    ));
    let wallet = Arc::new(WalletLedger::new(WalletConfig::default()));
    let recorder = Arc::new(KindRecorder::new());

    let router_observer: Arc<dyn EventObserver> = router.clone();
    events.on(&EventKind::ALL, router_observer);
    events.on(
        &DispatchObserver::KINDS,
        Arc::new(DispatchObserver(Arc::clone(&dispatcher))),
    );
    let wallet_observer: Arc<dyn EventObserver> = wallet.clone();
    events.on(&[EventKind::RideCompleted], wallet_observer);
    let recorder_observer: Arc<dyn EventObserver> = recorder.clone();
    events.on(&EventKind::ALL, recorder_observer);

    World {
        registry,
        index,
        router,
        dispatcher,
        wallet,
        recorder,
    }
}

fn request_ride(world: &World) -> Ride {
    let destination = GeoPoint::new(-23.5505, -46.6333);
    let quote = PricingConfig::default()
        .quote(&PICKUP, &destination, RideCategory::Standard)
        .unwrap();
    let ride = world
        .registry
        .create(
            PassengerId::new(),
            Location::new("R. da Consolação, 930", PICKUP),
            Location::new("Praça da Sé, 1", destination),
            RideCategory::Standard,
            quote,
        )
        .unwrap();
    world.recorder.watch(ride.id);
    ride
}

fn online_driver(world: &World) -> (DriverId, UnboundedReceiver<RideEvent>) {
    let driver = DriverId::new();
    world
        .index
        .set_online(driver, PICKUP, None, RideCategory::Standard)
        .unwrap();
    let (_, mut rx) = world.router.subscribe(driver.into(), Role::Driver);
    rx.try_recv().unwrap();
    (driver, rx)
}

async fn next_event(rx: &mut UnboundedReceiver<RideEvent>) -> RideEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

#[tokio::test]
async fn test_acceptance_race_settles_exactly_once() {
    let world = world();
    let (driver_a, mut rx_a) = online_driver(&world);
    let (driver_b, mut rx_b) = online_driver(&world);
    let ride = request_ride(&world);

    world.dispatcher.spawn_dispatch(ride.id);
    assert!(matches!(next_event(&mut rx_a).await, RideEvent::RideOffer { .. }));
    assert!(matches!(next_event(&mut rx_b).await, RideEvent::RideOffer { .. }));

    // Both race for it; A wins, B loses with Conflict
    let accepted = world.dispatcher.accept(ride.id, driver_a).unwrap();
    assert_eq!(accepted.status, RideStatus::Accepted);
    assert_eq!(accepted.driver_id, Some(driver_a));
    let err = world
        .dispatcher
        .accept(ride.id, driver_b)
        .expect_err("B lost the race");
    assert_eq!(err.error_code(), "CONFLICT");

    // A drives the trip to completion at 25.50
    world.registry.mark_arriving(ride.id, driver_a).unwrap();
    world.registry.start_ride(ride.id, driver_a).unwrap();
    let finished = world
        .registry
        .finish_ride(ride.id, driver_a, dec!(25.50))
        .unwrap();
    assert_eq!(finished.status, RideStatus::Completed);

    // Exactly one ride_credit of +25.50, held for driver A
    let transactions = world.wallet.transactions_for(driver_a);
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].tx_type, TransactionType::RideCredit);
    assert_eq!(transactions[0].amount, dec!(25.50));
    let account = world.wallet.account(driver_a).unwrap();
    assert_eq!(account.blocked_balance, dec!(25.50));
    assert_eq!(account.available_balance, dec!(0));
    assert!(world.wallet.account(driver_b).is_none());

    // Observed event order for this ride is the committed order
    let kinds = world.recorder.kinds.lock().clone();
    let lifecycle: Vec<EventKind> = kinds
        .iter()
        .copied()
        .filter(|k| {
            matches!(
                k,
                EventKind::RideAccepted
                    | EventKind::DriverArriving
                    | EventKind::RideStarted
                    | EventKind::RideCompleted
            )
        })
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            EventKind::RideAccepted,
            EventKind::DriverArriving,
            EventKind::RideStarted,
            EventKind::RideCompleted,
        ]
    );
}

#[tokio::test]
async fn test_dispatch_exhaustion_cancels_without_binding() {
    let world = world();
    // Nobody within 5 km: one driver far across town, wrong category too
    let far_driver = DriverId::new();
    world
        .index
        .set_online(
            far_driver,
            GeoPoint::new(-23.30, -46.20),
            None,
            RideCategory::Premium,
        )
        .unwrap();
    let ride = request_ride(&world);
    world.dispatcher.spawn_dispatch(ride.id);

    for _ in 0..200 {
        if world.registry.get(ride.id).unwrap().status == RideStatus::Cancelled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let cancelled = world.registry.get(ride.id).unwrap();
    assert_eq!(cancelled.status, RideStatus::Cancelled);
    assert_eq!(
        cancelled.cancel_reason,
        Some(CancelReason::NoDriversAvailable)
    );
    assert_eq!(cancelled.driver_id, None);
    // Settlement never fired
    assert_eq!(world.wallet.entry_count(), 0);
}

#[tokio::test]
async fn test_duplicate_completion_event_credits_once() {
    let world = world();
    let (driver, mut rx) = online_driver(&world);
    let ride = request_ride(&world);
    world.dispatcher.spawn_dispatch(ride.id);
    assert!(matches!(next_event(&mut rx).await, RideEvent::RideOffer { .. }));

    world.dispatcher.accept(ride.id, driver).unwrap();
    world.registry.mark_arriving(ride.id, driver).unwrap();
    world.registry.start_ride(ride.id, driver).unwrap();
    world.registry.finish_ride(ride.id, driver, dec!(31.80)).unwrap();

    // A retried finish is rejected by the state machine, and even a
    // replayed completion event cannot double-credit.
    assert!(world
        .registry
        .finish_ride(ride.id, driver, dec!(31.80))
        .is_err());
    world.wallet.on_event(&RideEvent::RideCompleted {
        ride_id: ride.id,
        passenger_id: ride.passenger_id,
        driver_id: driver,
        final_price: dec!(31.80),
    });

    assert_eq!(world.wallet.transactions_for(driver).len(), 1);
    assert_eq!(
        world.wallet.account(driver).unwrap().blocked_balance,
        dec!(31.80)
    );
}
