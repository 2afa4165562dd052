//! Demo mode
//!
//! Simulated drivers and passengers around central São Paulo exercising
//! the whole loop: request → offers → accept → arriving → start →
//! finish → wallet credit. Useful for watching the dashboard of events
//! on `/ws` and for manual poking without real clients.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use corrida_types::{
    DriverId, GeoPoint, Location, PassengerId, RideCategory, RideEvent, Role,
};

use crate::AppState;

const CENTER: GeoPoint = GeoPoint {
    latitude: -23.5614,
    longitude: -46.6559,
};

fn jittered(base: &GeoPoint, spread: f64) -> GeoPoint {
    GeoPoint::new(
        base.latitude + (rand::random::<f64>() - 0.5) * spread,
        base.longitude + (rand::random::<f64>() - 0.5) * spread,
    )
}

pub async fn run_demo(state: Arc<AppState>, num_drivers: usize) {
    info!(num_drivers, "starting demo traffic");

    for _ in 0..num_drivers {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            run_demo_driver(state).await;
        });
    }

    // One passenger keeps the city busy.
    let mut ticker = tokio::time::interval(Duration::from_secs(8));
    loop {
        ticker.tick().await;
        let passenger = PassengerId::new();
        let origin = jittered(&CENTER, 0.02);
        let destination = jittered(&CENTER, 0.08);
        let quote = match state
            .config
            .pricing
            .quote(&origin, &destination, RideCategory::Standard)
        {
            Ok(quote) => quote,
            Err(e) => {
                debug!(error = %e, "demo quote skipped");
                continue;
            }
        };
        match state.registry.create(
            passenger,
            Location::new("Demo origin", origin),
            Location::new("Demo destination", destination),
            RideCategory::Standard,
            quote,
        ) {
            Ok(ride) => {
                info!(ride = %ride.id, price = %ride.estimated_price, "demo ride requested");
                state.dispatcher.spawn_dispatch(ride.id);
            }
            Err(e) => warn!(error = %e, "demo ride rejected"),
        }
    }
}

async fn run_demo_driver(state: Arc<AppState>) {
    let driver = DriverId::new();
    let mut position = jittered(&CENTER, 0.04);
    if let Err(e) = state
        .index
        .set_online(driver, position, None, RideCategory::Standard)
    {
        warn!(driver = %driver, error = %e, "demo driver failed to go online");
        return;
    }
    let (_, mut rx) = state.router.subscribe(driver.into(), Role::Driver);
    let mut ping = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { return };
                if let RideEvent::RideOffer { ride_id, estimated_price, .. } = event {
                    // Think it over, then take the job.
                    tokio::time::sleep(Duration::from_millis(
                        200 + rand::random::<u64>() % 800,
                    ))
                    .await;
                    let Ok(_) = state.dispatcher.accept(ride_id, driver) else {
                        debug!(driver = %driver, ride = %ride_id, "offer already gone");
                        continue;
                    };
                    info!(driver = %driver, ride = %ride_id, "demo driver accepted");

                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let _ = state.registry.mark_arriving(ride_id, driver);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    let _ = state.registry.start_ride(ride_id, driver);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    match state.registry.finish_ride(ride_id, driver, estimated_price) {
                        Ok(ride) => info!(
                            driver = %driver,
                            ride = %ride_id,
                            price = %ride.final_price.unwrap_or(estimated_price),
                            "demo ride completed"
                        ),
                        Err(e) => debug!(ride = %ride_id, error = %e, "demo finish skipped"),
                    }
                }
            }
            _ = ping.tick() => {
                position = jittered(&position, 0.002);
                if state.index.update_location(driver, position, None).is_err() {
                    // Purged as stale while busy; come back online.
                    let _ = state
                        .index
                        .set_online(driver, position, None, RideCategory::Standard);
                }
            }
        }
    }
}
